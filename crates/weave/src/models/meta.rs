//! Server-wide metadata: collection timestamps and meta/global

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use super::Timestamp;

/// Storage format version this client speaks
pub const STORAGE_VERSION: u32 = 5;

/// Last-modified time of each collection on the server
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InfoCollections(HashMap<String, Timestamp>);

impl InfoCollections {
    pub fn new(collections: HashMap<String, Timestamp>) -> Self {
        Self(collections)
    }

    pub fn modified(&self, collection: &str) -> Option<Timestamp> {
        self.0.get(collection).copied()
    }

    pub fn collection_names(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn with(mut self, collection: impl Into<String>, modified: Timestamp) -> Self {
        self.0.insert(collection.into(), modified);
        self
    }
}

/// Per-engine entry of meta/global
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineMeta {
    pub version: u32,
    pub sync_id: String,
}

/// The account-wide meta/global record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetaGlobal {
    pub storage_version: u32,
    #[serde(default)]
    pub engines: BTreeMap<String, EngineMeta>,
    #[serde(default)]
    pub declined: Vec<String>,
}

impl MetaGlobal {
    pub fn new(storage_version: u32) -> Self {
        Self {
            storage_version,
            engines: BTreeMap::new(),
            declined: Vec::new(),
        }
    }

    pub fn with_engine(mut self, name: impl Into<String>, version: u32, sync_id: impl Into<String>) -> Self {
        self.engines.insert(
            name.into(),
            EngineMeta {
                version,
                sync_id: sync_id.into(),
            },
        );
        self
    }

    pub fn with_declined(mut self, name: impl Into<String>) -> Self {
        self.declined.push(name.into());
        self
    }

    pub fn is_declined(&self, collection: &str) -> bool {
        self.declined.iter().any(|d| d == collection)
    }
}
