//! Batched, resumable download of one collection
//!
//! A download walks the records modified after a fixed `base` time in
//! pages of at most `limit`, following the server's offset cursor. Progress
//! is persisted in prefs under `downloader.<collection>.`:
//!
//! - `since`: highest modified time of any applied record
//! - `base`: lower bound of the page walk in progress
//! - `offset`: cursor of the next page, absent between walks
//!
//! Nothing moves until [`BatchingDownloader::advance`] is called, which the
//! caller does only after the fetched batch is durably applied. A crash
//! between pages therefore resumes at the first unapplied page.

use std::sync::Arc;

use anyhow::Result;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::models::{InfoCollections, Record, Timestamp};
use crate::prefs::Prefs;
use crate::server::{FetchRequest, SyncServer};

/// How a call to [`BatchingDownloader::go`] ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadEndState {
    /// Last page fetched; nothing more to download
    Complete,
    /// A page was fetched and more remain
    Incomplete,
    /// The green light turned red before fetching
    Interrupted,
    /// The collection has not changed since the last download
    NoNewData,
}

/// Fetched but not yet committed
#[derive(Debug, Clone)]
struct PendingBatch {
    high_water: Timestamp,
    next_offset: Option<String>,
}

/// Pages through a collection, persisting its position
pub struct BatchingDownloader {
    server: Arc<dyn SyncServer>,
    collection: String,
    prefs: Prefs,
    green_light: CancellationToken,
    buffer: Vec<Record<Value>>,
    pending: Option<PendingBatch>,
}

impl BatchingDownloader {
    /// `prefs` is the owning synchronizer's branch
    pub fn new(
        server: Arc<dyn SyncServer>,
        collection: impl Into<String>,
        prefs: &Prefs,
        green_light: CancellationToken,
    ) -> Self {
        let collection = collection.into();
        Self {
            server,
            prefs: Self::prefs_for(prefs, &collection),
            collection,
            green_light,
            buffer: Vec::new(),
            pending: None,
        }
    }

    fn prefs_for(prefs: &Prefs, collection: &str) -> Prefs {
        prefs.branch(&format!("downloader.{}.", collection))
    }

    /// Forget all download progress for `collection`
    pub fn reset(prefs: &Prefs, collection: &str) -> Result<()> {
        Self::prefs_for(prefs, collection).clear_all()
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    /// Highest committed modified time
    pub fn since(&self) -> Timestamp {
        self.prefs.u64("since").unwrap_or(0)
    }

    fn base(&self) -> Timestamp {
        self.prefs.u64("base").unwrap_or(0)
    }

    fn offset(&self) -> Option<String> {
        self.prefs.string("offset")
    }

    /// Fetch the next page of at most `limit` records
    pub async fn go(&mut self, info: &InfoCollections, limit: usize) -> Result<DownloadEndState> {
        anyhow::ensure!(limit > 0, "{} download page size must be positive", self.collection);
        let since = self.since();
        let offset = self.offset();

        // Mid-walk we must continue even if info/collections has not moved.
        if offset.is_none() && info.modified(&self.collection).unwrap_or(0) <= since {
            log::debug!("No new data for {} since {}", self.collection, since);
            return Ok(DownloadEndState::NoNewData);
        }

        if self.green_light.is_cancelled() {
            log::info!("Green light turned red, stopping {} download", self.collection);
            return Ok(DownloadEndState::Interrupted);
        }

        let base = if offset.is_some() { self.base() } else { since };
        let request = FetchRequest::new(base, limit).with_offset(offset);
        let response = self.server.fetch_records(&self.collection, &request).await?;

        let newest = response.records.iter().map(|r| r.modified).max().unwrap_or(0);
        let high_water = match response.next_offset {
            Some(_) => newest,
            None => newest.max(response.last_modified),
        };

        log::debug!(
            "Fetched {} {} records (base {}, high water {})",
            response.records.len(),
            self.collection,
            base,
            high_water
        );

        let end = if response.next_offset.is_some() {
            DownloadEndState::Incomplete
        } else {
            DownloadEndState::Complete
        };

        self.buffer.extend(response.records);
        self.pending = Some(PendingBatch {
            high_water,
            next_offset: response.next_offset,
        });
        if self.prefs.u64("base") != Some(base) {
            self.prefs.set_u64("base", base)?;
        }

        Ok(end)
    }

    /// Take the records fetched since the last call
    pub fn retrieve(&mut self) -> Vec<Record<Value>> {
        std::mem::take(&mut self.buffer)
    }

    /// Commit the last fetched page
    ///
    /// Call after its records are applied. Calling again without a new page
    /// changes nothing.
    pub fn advance(&mut self) -> Result<()> {
        let Some(batch) = self.pending.take() else {
            return Ok(());
        };

        let since = self.since().max(batch.high_water);
        self.prefs.set_u64("since", since)?;

        match batch.next_offset {
            Some(offset) => self.prefs.set_string("offset", &offset)?,
            None => {
                self.prefs.remove("offset")?;
                self.prefs.set_u64("base", since)?;
            }
        }

        log::debug!("Advanced {} download to {}", self.collection, since);
        Ok(())
    }

    /// Skip to `timestamp` after our own upload
    ///
    /// Only valid when every remote change up to the upload has been
    /// applied. Ignored while a page walk is in progress.
    pub fn fast_forward(&mut self, timestamp: Timestamp) -> Result<()> {
        if self.offset().is_some() || self.pending.is_some() {
            return Ok(());
        }
        let since = self.since().max(timestamp);
        self.prefs.set_u64("since", since)?;
        self.prefs.set_u64("base", since)
    }
}
