//! Statistics recorded while syncing
//!
//! One [`EngineStatsSession`] per collection sync, one
//! [`SyncOperationStats`] per orchestrated sync. Emission is left to the
//! embedding application.

use std::time::Instant;

use chrono::{DateTime, Utc};

/// Incoming record counts
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DownloadStats {
    /// Records fetched from the server
    pub fetched: usize,
    /// Records stored locally
    pub applied: usize,
    /// Records that failed to apply
    pub failed: usize,
}

/// Outgoing record counts
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct UploadStats {
    /// Records accepted by the server
    pub sent: usize,
    /// Records the server rejected
    pub sent_failed: usize,
}

/// Statistics for one collection sync
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SyncEngineStats {
    pub collection: String,
    pub downloads: DownloadStats,
    pub uploads: UploadStats,
    /// Reason the sync stopped early
    pub failure_reason: Option<String>,
    pub took_ms: u64,
}

/// Accumulates [`SyncEngineStats`] for a running collection sync
#[derive(Debug, Clone)]
pub struct EngineStatsSession {
    start: Instant,
    stats: SyncEngineStats,
}

impl EngineStatsSession {
    pub fn start(collection: impl Into<String>) -> Self {
        Self {
            start: Instant::now(),
            stats: SyncEngineStats {
                collection: collection.into(),
                ..Default::default()
            },
        }
    }

    pub fn record_download_fetched(&mut self, count: usize) {
        self.stats.downloads.fetched += count;
    }

    pub fn record_download_applied(&mut self) {
        self.stats.downloads.applied += 1;
    }

    pub fn record_download_failed(&mut self) {
        self.stats.downloads.failed += 1;
    }

    pub fn record_upload(&mut self, sent: usize, failed: usize) {
        self.stats.uploads.sent += sent;
        self.stats.uploads.sent_failed += failed;
    }

    /// Note why the sync did not finish; the first reason wins
    pub fn record_failure(&mut self, reason: impl Into<String>) {
        if self.stats.failure_reason.is_none() {
            self.stats.failure_reason = Some(reason.into());
        }
    }

    /// Statistics so far
    pub fn stats(&self) -> &SyncEngineStats {
        &self.stats
    }

    /// Finish the session, stamping the elapsed time
    pub fn end(&self) -> SyncEngineStats {
        SyncEngineStats {
            took_ms: self.start.elapsed().as_millis() as u64,
            ..self.stats.clone()
        }
    }
}

/// Timing of one orchestrated sync
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncOperationStats {
    pub started_at: DateTime<Utc>,
    pub took_ms: u64,
    /// Why the sync was requested
    pub why: String,
}

/// Running [`SyncOperationStats`]
#[derive(Debug, Clone)]
pub struct OperationStatsSession {
    start: Instant,
    started_at: DateTime<Utc>,
    why: String,
}

impl OperationStatsSession {
    pub fn start(why: impl Into<String>) -> Self {
        Self {
            start: Instant::now(),
            started_at: Utc::now(),
            why: why.into(),
        }
    }

    pub fn end(&self) -> SyncOperationStats {
        SyncOperationStats {
            started_at: self.started_at,
            took_ms: self.start.elapsed().as_millis() as u64,
            why: self.why.clone(),
        }
    }
}

/// Whether at least `interval_secs` have passed since `last`
///
/// `None` (never happened) counts as elapsed.
pub fn interval_elapsed(last: Option<DateTime<Utc>>, interval_secs: u64) -> bool {
    match last {
        Some(last) => (Utc::now() - last).num_seconds() >= interval_secs as i64,
        None => true,
    }
}
