//! Weave - browser data sync engine
//!
//! This crate keeps a browser profile's history, open tabs and device list
//! in sync with a remote record store:
//! - Domain models (Site, Visit, RemoteClient, RemoteTab, wire payloads)
//! - Frecency ranking for search suggestions and top sites
//! - Storage trait abstractions with in-memory and SQLite backends
//! - Batched, resumable collection downloads
//! - Per-collection synchronizers (history, clients, tabs)
//! - A sync manager that serializes and coalesces sync attempts
//!
//! The transport and the account layer are injected through
//! [`SyncServer`] and [`AccountSession`]; this crate does no HTTP.

pub mod config;
pub mod downloader;
pub mod error;
pub mod frecency;
pub mod manager;
pub mod models;
pub mod prefs;
pub mod scratchpad;
pub mod server;
pub mod stats;
pub mod storage;
pub mod synchronizers;

pub use config::SyncConfig;
pub use downloader::{BatchingDownloader, DownloadEndState};
pub use error::{AccountError, ServerError, SyncError};
pub use frecency::{RankedSite, SearchQuery, SiteStats, rank_sites, rank_top_sites};
pub use manager::{ExternalEngine, StorageEvent, SyncManager, SyncPhase, SyncProfile, SyncResults};
pub use models::{
    ClientAndTabs, Guid, InfoCollections, KeyBundle, Keys, MetaGlobal, Place, Record, RemoteClient, RemoteTab,
    Site, SiteVisit, Timestamp, TokenServerToken, Visit, VisitType,
};
pub use prefs::{FilePrefsStore, InMemoryPrefsStore, Prefs, PrefsStore};
pub use scratchpad::Scratchpad;
pub use server::{
    AccountSession, FetchRequest, FetchResponse, InMemorySyncServer, StaticAccountSession, SyncServer, UploadResult,
};
pub use stats::{SyncEngineStats, SyncOperationStats};
pub use storage::{
    BrowserDb, BrowserHistory, InMemoryClientsAndTabs, InMemoryHistory, RemoteClientsAndTabs, ResettableSyncStorage,
    SqliteHistory, SqliteRemoteClientsAndTabs, SyncableHistory,
};
pub use synchronizers::{NotStartedReason, SyncDelegate, SyncReason, SyncStatus};
