//! Storage traits and implementations
//!
//! Local collection stores are defined by capability traits. In-memory
//! implementations back tests; SQLite implementations share one browser
//! database file.

mod memory;
mod sqlite;
mod sqlite_history;
mod sqlite_tabs;
mod traits;

pub use memory::{InMemoryClientsAndTabs, InMemoryHistory};
pub use sqlite::{BROWSER_DB_NAME, BrowserDb};
pub use sqlite_history::SqliteHistory;
pub use sqlite_tabs::SqliteRemoteClientsAndTabs;
pub use traits::{
    BrowserHistory, MAX_VISITS_PER_RECORD, RemoteClientsAndTabs, ResettableSyncStorage,
    SyncableHistory, TabsOnly, VisitStatsSource,
};
