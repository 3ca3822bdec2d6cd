//! Per-collection synchronizers
//!
//! A synchronizer reconciles one collection for one sync attempt. It is
//! built from a [`Scratchpad`], runs once and reports a [`SyncStatus`].
//! Real failures propagate as errors only until the synchronizer can turn
//! them into a `Partial` result; the orchestrator sees statuses.

mod clients;
mod history;
mod tabs;

use std::fmt;
use std::sync::Arc;

use anyhow::Result;
use serde_json::Value;
use url::Url;

use crate::downloader::BatchingDownloader;
use crate::error::{AccountError, ServerError, server_error};
use crate::models::{InfoCollections, Record, Timestamp, now_millis};
use crate::prefs::Prefs;
use crate::scratchpad::Scratchpad;
use crate::server::FetchRequest;
use crate::stats::{EngineStatsSession, SyncEngineStats};
use crate::storage::ResettableSyncStorage;

pub use clients::ClientsSynchronizer;
pub use history::HistorySynchronizer;
pub use tabs::{TabsSynchronizer, reset_clients_and_tabs, reset_tabs};

/// Prefs key holding the backoff deadline (ms since epoch)
pub const BACKOFF_UNTIL_PREF: &str = "sync.backoff.until";

/// Page size when fetching a whole small collection
const FULL_FETCH_PAGE_SIZE: usize = 1000;

/// Why a sync was requested
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncReason {
    Startup,
    Scheduled,
    Backgrounded,
    User,
    SyncNow,
    DidLogin,
    ClientNameChanged,
    EngineEnabled,
    Push,
}

impl SyncReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncReason::Startup => "startup",
            SyncReason::Scheduled => "scheduled",
            SyncReason::Backgrounded => "backgrounded",
            SyncReason::User => "user",
            SyncReason::SyncNow => "syncNow",
            SyncReason::DidLogin => "didLogin",
            SyncReason::ClientNameChanged => "clientNameChanged",
            SyncReason::EngineEnabled => "engineEnabled",
            SyncReason::Push => "push",
        }
    }
}

impl fmt::Display for SyncReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a collection was not synced at all
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotStartedReason {
    NoAccount,
    Offline,
    Backoff { remaining_seconds: u64 },
    EngineRemotelyNotEnabled { collection: String },
    EngineFormatOutdated { needs: u32 },
    EngineFormatTooNew { expected: u32 },
    StorageFormatOutdated { needs: u32 },
    StorageFormatTooNew { expected: u32 },
    StateMachineNotReady,
    RedLight,
    Unknown,
}

impl NotStartedReason {
    pub fn telemetry_id(&self) -> &'static str {
        match self {
            NotStartedReason::NoAccount => "sync.not_started.reason.no_account",
            NotStartedReason::Offline => "sync.not_started.reason.offline",
            NotStartedReason::Backoff { .. } => "sync.not_started.reason.backoff",
            NotStartedReason::EngineRemotelyNotEnabled { .. } => {
                "sync.not_started.reason.remotely_not_enabled"
            }
            NotStartedReason::EngineFormatOutdated { .. } => "sync.not_started.reason.format_outdated",
            NotStartedReason::EngineFormatTooNew { .. } => "sync.not_started.reason.format_too_new",
            NotStartedReason::StorageFormatOutdated { .. } => {
                "sync.not_started.reason.storage_format_outdated"
            }
            NotStartedReason::StorageFormatTooNew { .. } => {
                "sync.not_started.reason.storage_format_too_new"
            }
            NotStartedReason::StateMachineNotReady => "sync.not_started.reason.state_machine_not_ready",
            NotStartedReason::RedLight => "sync.not_started.reason.red_light",
            NotStartedReason::Unknown => "sync.not_started.reason.unknown",
        }
    }

    /// Reason for a failure that happened before any collection started
    pub fn from_error(err: &anyhow::Error) -> Self {
        match server_error(err) {
            Some(ServerError::Offline) => NotStartedReason::Offline,
            Some(ServerError::Backoff { remaining_seconds }) => NotStartedReason::Backoff {
                remaining_seconds: *remaining_seconds,
            },
            Some(ServerError::Unauthorized) => NotStartedReason::NoAccount,
            Some(_) => NotStartedReason::Unknown,
            None if err.downcast_ref::<AccountError>().is_some() => NotStartedReason::NoAccount,
            None => NotStartedReason::Unknown,
        }
    }

    /// Reason for a failure to get the account's token or keys
    ///
    /// Only connectivity and backoff are reported as such; anything else
    /// means there is no usable account.
    pub fn from_credentials_error(err: &anyhow::Error) -> Self {
        match Self::from_error(err) {
            reason @ (NotStartedReason::Offline | NotStartedReason::Backoff { .. }) => reason,
            _ => NotStartedReason::NoAccount,
        }
    }
}

impl fmt::Display for NotStartedReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NotStartedReason::NoAccount => write!(f, "no account"),
            NotStartedReason::Offline => write!(f, "offline"),
            NotStartedReason::Backoff { remaining_seconds } => {
                write!(f, "in backoff: {} seconds remaining", remaining_seconds)
            }
            NotStartedReason::EngineRemotelyNotEnabled { collection } => {
                write!(f, "{} not enabled on the server", collection)
            }
            NotStartedReason::EngineFormatOutdated { needs } => {
                write!(f, "engine format outdated, needs version {}", needs)
            }
            NotStartedReason::EngineFormatTooNew { expected } => {
                write!(f, "engine format too new, expected version {}", expected)
            }
            NotStartedReason::StorageFormatOutdated { needs } => {
                write!(f, "storage format outdated, needs version {}", needs)
            }
            NotStartedReason::StorageFormatTooNew { expected } => {
                write!(f, "storage format too new, expected version {}", expected)
            }
            NotStartedReason::StateMachineNotReady => write!(f, "not ready"),
            NotStartedReason::RedLight => write!(f, "red light"),
            NotStartedReason::Unknown => write!(f, "unknown reason"),
        }
    }
}

/// Outcome of syncing one collection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncStatus {
    Completed(SyncEngineStats),
    Partial(SyncEngineStats),
    NotStarted(NotStartedReason),
}

impl SyncStatus {
    pub fn is_completed(&self) -> bool {
        matches!(self, SyncStatus::Completed(_))
    }

    /// Stats of a sync that ran
    pub fn stats(&self) -> Option<&SyncEngineStats> {
        match self {
            SyncStatus::Completed(stats) | SyncStatus::Partial(stats) => Some(stats),
            SyncStatus::NotStarted(_) => None,
        }
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncStatus::Completed(_) => write!(f, "Completed"),
            SyncStatus::Partial(_) => write!(f, "Partial"),
            SyncStatus::NotStarted(reason) => write!(f, "Not started: {}", reason),
        }
    }
}

/// Receives events synchronizers surface to the user
pub trait SyncDelegate: Send + Sync {
    /// Another device sent this device a tab
    fn display_sent_tab(&self, url: &Url, title: &str, device_name: Option<&str>);
}

/// A delegate that ignores everything
pub struct NoopSyncDelegate;

impl SyncDelegate for NoopSyncDelegate {
    fn display_sent_tab(&self, _url: &Url, _title: &str, _device_name: Option<&str>) {}
}

/// State shared by every collection synchronizer
pub struct CollectionSynchronizer {
    pub collection: &'static str,
    pub scratchpad: Arc<Scratchpad>,
    pub base_prefs: Prefs,
    /// `synchronizer.<collection>.` branch
    pub prefs: Prefs,
    pub why: SyncReason,
    pub stats: EngineStatsSession,
}

impl CollectionSynchronizer {
    pub fn new(scratchpad: Arc<Scratchpad>, base_prefs: &Prefs, why: SyncReason, collection: &'static str) -> Self {
        Self {
            collection,
            scratchpad,
            base_prefs: base_prefs.clone(),
            prefs: Self::prefs_for(base_prefs, collection),
            why,
            stats: EngineStatsSession::start(collection),
        }
    }

    pub fn prefs_for(base_prefs: &Prefs, collection: &str) -> Prefs {
        base_prefs.branch(&format!("synchronizer.{}.", collection))
    }

    pub fn last_fetched(&self) -> Timestamp {
        self.prefs.u64("lastFetched").unwrap_or(0)
    }

    pub fn set_last_fetched(&self, timestamp: Timestamp) -> Result<()> {
        log::debug!("Setting {} lastFetched to {}", self.collection, timestamp);
        self.prefs.set_u64("lastFetched", timestamp)
    }

    /// Whether the server copy changed since we last fetched it
    pub fn remote_has_changes(&self, info: &InfoCollections) -> bool {
        info.modified(self.collection).unwrap_or(0) > self.last_fetched()
    }

    /// Every record changed since `lastFetched`, with the timestamp to
    /// store as the new `lastFetched` once they are applied
    pub async fn fetch_changed(&self) -> Result<(Vec<Record<Value>>, Timestamp)> {
        let since = self.last_fetched();
        let mut request = FetchRequest::new(since, FULL_FETCH_PAGE_SIZE);
        let mut records = Vec::new();

        loop {
            let page = self
                .scratchpad
                .server
                .fetch_records(self.collection, &request)
                .await?;
            records.extend(page.records);

            match page.next_offset {
                Some(offset) => request = request.with_offset(Some(offset)),
                None => {
                    let newest = records.iter().map(|r| r.modified).max().unwrap_or(0);
                    return Ok((records, since.max(newest).max(page.last_modified)));
                }
            }
        }
    }

    pub fn completed(&self) -> SyncStatus {
        log::info!("Synced {} ({})", self.collection, self.why);
        SyncStatus::Completed(self.stats.end())
    }

    /// End early without an error, e.g. on interruption
    pub fn partial(&mut self, reason: &str) -> SyncStatus {
        log::info!("Partial {} sync: {}", self.collection, reason);
        self.stats.record_failure(reason);
        SyncStatus::Partial(self.stats.end())
    }

    /// End early because of `err`, recording any server backoff
    pub fn failed(&mut self, err: &anyhow::Error) -> SyncStatus {
        log::warn!("{} sync failed: {:#}", self.collection, err);
        if let Some(ServerError::Backoff { remaining_seconds }) = server_error(err) {
            if let Err(e) = record_backoff(&self.base_prefs, *remaining_seconds) {
                log::warn!("Failed to persist backoff: {:#}", e);
            }
        }
        self.stats.record_failure(format!("{:#}", err));
        SyncStatus::Partial(self.stats.end())
    }
}

/// Make a synchronizer start from scratch next time
///
/// Clears the watermark and download position, and drops the storage's sync
/// metadata. Local data is kept and reconciled on the next sync.
pub fn reset_synchronizer<S>(storage: &S, base_prefs: &Prefs, collection: &str) -> Result<()>
where
    S: ResettableSyncStorage + ?Sized,
{
    let prefs = CollectionSynchronizer::prefs_for(base_prefs, collection);
    prefs.remove("lastFetched")?;
    storage.reset_client()?;
    BatchingDownloader::reset(&prefs, collection)?;
    log::info!("Reset {} synchronizer", collection);
    Ok(())
}

/// Persist a server backoff request
pub fn record_backoff(base_prefs: &Prefs, remaining_seconds: u64) -> Result<()> {
    let until = now_millis().saturating_add(remaining_seconds.saturating_mul(1000));
    base_prefs.set_u64(BACKOFF_UNTIL_PREF, until)
}

/// Seconds of backoff left, if any
pub fn backoff_remaining(base_prefs: &Prefs) -> Option<u64> {
    let until = base_prefs.u64(BACKOFF_UNTIL_PREF)?;
    let now = now_millis();
    (until > now).then(|| (until - now).div_ceil(1000))
}
