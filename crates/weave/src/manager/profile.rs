//! Local stores a sync manager works on

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::broadcast;

use super::engines::ExternalEngine;
use super::events::StorageEvent;
use crate::prefs::{FilePrefsStore, Prefs};
use crate::storage::{
    BROWSER_DB_NAME, BrowserDb, InMemoryClientsAndTabs, InMemoryHistory, RemoteClientsAndTabs, SqliteHistory,
    SqliteRemoteClientsAndTabs, SyncableHistory,
};
use crate::synchronizers::{NoopSyncDelegate, SyncDelegate};

/// Prefs file name inside a profile directory
pub const PREFS_FILE_NAME: &str = "prefs.json";

/// The local side of sync for one browser profile
pub struct SyncProfile {
    pub prefs: Prefs,
    pub history: Arc<dyn SyncableHistory>,
    pub clients_and_tabs: Arc<dyn RemoteClientsAndTabs>,
    pub engines: Vec<Arc<dyn ExternalEngine>>,
    pub delegate: Arc<dyn SyncDelegate>,
}

impl SyncProfile {
    pub fn new(
        prefs: Prefs,
        history: Arc<dyn SyncableHistory>,
        clients_and_tabs: Arc<dyn RemoteClientsAndTabs>,
    ) -> Self {
        Self {
            prefs,
            history,
            clients_and_tabs,
            engines: Vec::new(),
            delegate: Arc::new(NoopSyncDelegate),
        }
    }

    /// A profile that keeps everything in memory
    pub fn in_memory() -> Self {
        Self::new(
            Prefs::in_memory(),
            Arc::new(InMemoryHistory::new()),
            Arc::new(InMemoryClientsAndTabs::new()),
        )
    }

    /// Open the profile stored in `dir`, creating it if needed
    ///
    /// If the browser database had to be recreated, a
    /// [`StorageEvent::DatabaseRecreated`] is sent on `events`.
    pub fn open(dir: &Path, events: &broadcast::Sender<StorageEvent>) -> Result<Self> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create profile directory: {}", dir.display()))?;

        let db = BrowserDb::open(dir.join(BROWSER_DB_NAME))?;
        let prefs = Prefs::new(Arc::new(FilePrefsStore::open(dir.join(PREFS_FILE_NAME))?));

        if db.was_recreated() {
            let event = StorageEvent::DatabaseRecreated(Some(db.name().to_string()));
            if events.send(event).is_err() {
                log::warn!("Nobody is listening for storage events");
            }
        }

        log::info!("Opened sync profile at {}", dir.display());
        Ok(Self::new(
            prefs,
            Arc::new(SqliteHistory::new(&db)),
            Arc::new(SqliteRemoteClientsAndTabs::new(&db)),
        ))
    }

    pub fn with_engine(mut self, engine: Arc<dyn ExternalEngine>) -> Self {
        self.engines.push(engine);
        self
    }

    pub fn with_delegate(mut self, delegate: Arc<dyn SyncDelegate>) -> Self {
        self.delegate = delegate;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::events;

    #[test]
    fn test_open_creates_profile() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, mut rx) = events::channel();

        let profile = SyncProfile::open(&dir.path().join("profile"), &tx).unwrap();
        profile.prefs.set_u64("probe", 1).unwrap();
        assert!(dir.path().join("profile").join(BROWSER_DB_NAME).exists());
        assert!(dir.path().join("profile").join(PREFS_FILE_NAME).exists());
        assert!(!profile.history.has_synced_history().unwrap());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_open_reports_recreated_db() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(BROWSER_DB_NAME), b"definitely not sqlite").unwrap();
        let (tx, mut rx) = events::channel();

        SyncProfile::open(dir.path(), &tx).unwrap();
        assert_eq!(
            rx.try_recv().unwrap(),
            StorageEvent::DatabaseRecreated(Some(BROWSER_DB_NAME.to_string()))
        );
    }
}
