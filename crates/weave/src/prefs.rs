//! Persisted key/value sync state
//!
//! Synchronizers keep their watermarks and flags in dotted namespaces such as
//! `synchronizer.history.lastFetched`. [`Prefs`] is a view of one namespace
//! over a shared [`PrefsStore`].

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

use anyhow::Result;
use serde_json::Value;

/// Backing store for prefs
pub trait PrefsStore: Send + Sync {
    fn get(&self, key: &str) -> Option<Value>;

    fn set(&self, key: &str, value: Value) -> Result<()>;

    fn remove(&self, key: &str) -> Result<()>;

    /// Remove every key starting with `prefix`
    fn remove_prefix(&self, prefix: &str) -> Result<()>;
}

/// Prefs held in memory only
#[derive(Default)]
pub struct InMemoryPrefsStore {
    values: RwLock<BTreeMap<String, Value>>,
}

impl InMemoryPrefsStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PrefsStore for InMemoryPrefsStore {
    fn get(&self, key: &str) -> Option<Value> {
        self.values.read().unwrap().get(key).cloned()
    }

    fn set(&self, key: &str, value: Value) -> Result<()> {
        self.values.write().unwrap().insert(key.to_string(), value);
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.values.write().unwrap().remove(key);
        Ok(())
    }

    fn remove_prefix(&self, prefix: &str) -> Result<()> {
        self.values
            .write()
            .unwrap()
            .retain(|k, _| !k.starts_with(prefix));
        Ok(())
    }
}

/// Prefs persisted to a JSON file, rewritten on every mutation
pub struct FilePrefsStore {
    path: PathBuf,
    values: Mutex<BTreeMap<String, Value>>,
}

impl FilePrefsStore {
    /// Open the prefs file, starting empty if it does not exist yet
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let values = if path.exists() {
            config::load_json_file(&path)?
        } else {
            BTreeMap::new()
        };

        Ok(Self {
            path,
            values: Mutex::new(values),
        })
    }

    /// Open `prefs.json` in the Weave config directory
    pub fn open_default() -> Result<Self> {
        let dir = config::init()?;
        Self::open(dir.join("prefs.json"))
    }

    fn mutate(&self, f: impl FnOnce(&mut BTreeMap<String, Value>)) -> Result<()> {
        let mut values = self.values.lock().unwrap();
        f(&mut values);
        config::save_json_file(&self.path, &*values)
    }
}

impl PrefsStore for FilePrefsStore {
    fn get(&self, key: &str) -> Option<Value> {
        self.values.lock().unwrap().get(key).cloned()
    }

    fn set(&self, key: &str, value: Value) -> Result<()> {
        self.mutate(|values| {
            values.insert(key.to_string(), value);
        })
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.mutate(|values| {
            values.remove(key);
        })
    }

    fn remove_prefix(&self, prefix: &str) -> Result<()> {
        self.mutate(|values| values.retain(|k, _| !k.starts_with(prefix)))
    }
}

/// A namespaced view over a [`PrefsStore`]
#[derive(Clone)]
pub struct Prefs {
    store: Arc<dyn PrefsStore>,
    prefix: String,
}

impl Prefs {
    /// Root view with an empty prefix
    pub fn new(store: Arc<dyn PrefsStore>) -> Self {
        Self {
            store,
            prefix: String::new(),
        }
    }

    /// Root view over a fresh in-memory store
    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemoryPrefsStore::new()))
    }

    /// Nested namespace; `name` should end with `.`
    pub fn branch(&self, name: &str) -> Prefs {
        Prefs {
            store: Arc::clone(&self.store),
            prefix: format!("{}{}", self.prefix, name),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    fn key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }

    pub fn u64(&self, key: &str) -> Option<u64> {
        self.store.get(&self.key(key))?.as_u64()
    }

    pub fn set_u64(&self, key: &str, value: u64) -> Result<()> {
        self.store.set(&self.key(key), Value::from(value))
    }

    pub fn bool(&self, key: &str) -> Option<bool> {
        self.store.get(&self.key(key))?.as_bool()
    }

    pub fn set_bool(&self, key: &str, value: bool) -> Result<()> {
        self.store.set(&self.key(key), Value::from(value))
    }

    pub fn string(&self, key: &str) -> Option<String> {
        match self.store.get(&self.key(key))? {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn set_string(&self, key: &str, value: &str) -> Result<()> {
        self.store.set(&self.key(key), Value::from(value))
    }

    pub fn string_list(&self, key: &str) -> Option<Vec<String>> {
        serde_json::from_value(self.store.get(&self.key(key))?).ok()
    }

    pub fn set_string_list(&self, key: &str, value: &[String]) -> Result<()> {
        self.store.set(&self.key(key), Value::from(value.to_vec()))
    }

    pub fn remove(&self, key: &str) -> Result<()> {
        self.store.remove(&self.key(key))
    }

    /// Remove every key in this namespace
    pub fn clear_all(&self) -> Result<()> {
        self.store.remove_prefix(&self.prefix)
    }
}
