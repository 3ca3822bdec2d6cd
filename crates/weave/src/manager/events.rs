//! Notifications from the storage layer

use tokio::sync::broadcast;

use crate::storage::BROWSER_DB_NAME;

/// Capacity of a storage event channel
pub const EVENT_CHANNEL_CAPACITY: usize = 16;

/// Something happened to local storage that sync must react to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageEvent {
    /// A database file was discarded and created afresh. `None` means the
    /// name is unknown.
    DatabaseRecreated(Option<String>),
}

impl StorageEvent {
    /// Whether this event invalidates synced history and tabs
    pub fn affects_browser_db(&self) -> bool {
        match self {
            StorageEvent::DatabaseRecreated(None) => true,
            StorageEvent::DatabaseRecreated(Some(name)) => name == BROWSER_DB_NAME,
        }
    }
}

/// A sender/receiver pair for storage events
pub fn channel() -> (broadcast::Sender<StorageEvent>, broadcast::Receiver<StorageEvent>) {
    broadcast::channel(EVENT_CHANNEL_CAPACITY)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_affects_browser_db() {
        assert!(StorageEvent::DatabaseRecreated(None).affects_browser_db());
        assert!(StorageEvent::DatabaseRecreated(Some("browser.db".into())).affects_browser_db());
        assert!(!StorageEvent::DatabaseRecreated(Some("logins.db".into())).affects_browser_db());
    }
}
