//! `history` collection synchronizer

use std::sync::Arc;

use anyhow::{Result, bail};
use serde_json::Value;

use super::{CollectionSynchronizer, SyncReason, SyncStatus};
use crate::downloader::{BatchingDownloader, DownloadEndState};
use crate::models::{
    Guid, HistoryPayload, Record, Timestamp, is_ignored_url, make_history_record,
};
use crate::prefs::Prefs;
use crate::scratchpad::Scratchpad;
use crate::storage::SyncableHistory;

/// Downloads remote history page by page and uploads local changes
pub struct HistorySynchronizer {
    base: CollectionSynchronizer,
}

impl HistorySynchronizer {
    pub const COLLECTION: &'static str = "history";
    pub const STORAGE_VERSION: u32 = 1;

    pub fn new(scratchpad: Arc<Scratchpad>, base_prefs: &Prefs, why: SyncReason) -> Self {
        Self {
            base: CollectionSynchronizer::new(scratchpad, base_prefs, why, Self::COLLECTION),
        }
    }

    pub fn last_fetched(&self) -> Timestamp {
        self.base.last_fetched()
    }

    pub async fn synchronize_local_history(mut self, history: &dyn SyncableHistory) -> Result<SyncStatus> {
        let scratchpad = Arc::clone(&self.base.scratchpad);
        let info = &scratchpad.info;
        let batch_size = scratchpad.config.history_batch_size;

        let mut downloader = BatchingDownloader::new(
            Arc::clone(&scratchpad.server),
            Self::COLLECTION,
            &self.base.prefs,
            scratchpad.green_light.clone(),
        );

        loop {
            let end = match downloader.go(info, batch_size).await {
                Ok(end) => end,
                Err(e) => return Ok(self.base.failed(&e)),
            };

            match end {
                DownloadEndState::Complete | DownloadEndState::Incomplete => {
                    let records = downloader.retrieve();
                    self.base.stats.record_download_fetched(records.len());
                    if let Err(e) = self.apply_incoming(history, &records) {
                        return Ok(self.base.failed(&e));
                    }
                    downloader.advance()?;
                    self.base.set_last_fetched(downloader.since())?;

                    if end == DownloadEndState::Incomplete {
                        log::debug!("Running another history batch");
                        continue;
                    }

                    log::info!("Done with batched history download");
                    history.done_applying_records_after_download()?;
                    break;
                }
                DownloadEndState::NoNewData => {
                    downloader.advance()?;
                    break;
                }
                DownloadEndState::Interrupted => {
                    return Ok(self.base.partial("interrupted"));
                }
            }
        }

        // Uploading after a red light would fast-forward past unseen records.
        if scratchpad.green_light.is_cancelled() {
            return Ok(self.base.partial("interrupted"));
        }

        if let Err(e) = self.upload_outgoing(history, &mut downloader).await {
            return Ok(self.base.failed(&e));
        }

        Ok(self.base.completed())
    }

    /// Apply one downloaded batch, tolerating a few bad records
    fn apply_incoming(&mut self, history: &dyn SyncableHistory, records: &[Record<Value>]) -> Result<()> {
        let max_failures = self.base.scratchpad.config.max_record_failures;
        let mut failures = 0;

        for record in records {
            match apply_record(history, record) {
                Ok(true) => self.base.stats.record_download_applied(),
                Ok(false) => {}
                Err(e) => {
                    failures += 1;
                    self.base.stats.record_download_failed();
                    if failures > max_failures {
                        log::error!("Too many history record failures, aborting batch: {:#}", e);
                        return Err(e);
                    }
                    log::debug!("Masking history record failure {}: {:#}", failures, e);
                }
            }
        }

        Ok(())
    }

    async fn upload_outgoing(
        &mut self,
        history: &dyn SyncableHistory,
        downloader: &mut BatchingDownloader,
    ) -> Result<()> {
        let scratchpad = Arc::clone(&self.base.scratchpad);

        let mut records: Vec<Record<Value>> = Vec::new();
        for (place, visits) in history.modified_places_to_upload()? {
            records.push(make_history_record(&place, visits).encode()?);
        }
        for guid in history.deleted_places_to_upload()? {
            records.push(Record::new(guid.clone(), HistoryPayload::tombstone(guid), 0).encode()?);
        }

        if records.is_empty() {
            return Ok(());
        }

        // Only fast-forward when nothing remote is left unseen.
        let was_current = !self.base.remote_has_changes(&scratchpad.info);
        let batch_size = scratchpad.config.history_upload_batch_size.max(1);
        let mut last_modified = None;

        for chunk in records.chunks(batch_size) {
            let result = scratchpad
                .server
                .upload_records(Self::COLLECTION, chunk.to_vec())
                .await?;
            history.mark_as_synchronized(&result.succeeded, result.modified)?;
            self.base.stats.record_upload(result.succeeded.len(), result.failed.len());
            last_modified = Some(result.modified);
        }

        log::info!("Uploaded {} history records", records.len());

        if let (true, Some(modified)) = (was_current, last_modified) {
            downloader.fast_forward(modified)?;
            self.base.set_last_fetched(modified)?;
        }
        Ok(())
    }
}

/// Apply a single record. `Ok(false)` means it was skipped on purpose.
fn apply_record(history: &dyn SyncableHistory, record: &Record<Value>) -> Result<bool> {
    if record.is_deleted() {
        history.delete_by_guid(&record.id, record.modified)?;
        return Ok(true);
    }

    let record = record.decode::<HistoryPayload>()?;
    let place = record.payload.as_place();
    if is_ignored_url(&place.url) {
        log::debug!("Ignoring incoming history record {}", record.id);
        return Ok(false);
    }
    if place.guid != record.id {
        bail!("History record {} carries payload id {}", record.id, place.guid);
    }

    let guid: Guid = history.insert_or_update_place(&place, record.modified)?;
    history.store_remote_visits(&record.payload.visits, &guid)?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Place, Visit, VisitType};
    use crate::scratchpad::tests_support::scratchpad;
    use crate::server::InMemorySyncServer;
    use crate::storage::{InMemoryHistory, VisitStatsSource};
    use serde_json::json;

    fn history_payload(id: &str, url: &str) -> Value {
        json!({
            "id": id,
            "histUri": url,
            "title": format!("Title {}", id),
            "visits": [{"date": 1_000_000, "type": 1}]
        })
    }

    #[tokio::test]
    async fn test_downloads_and_applies() {
        let server = Arc::new(InMemorySyncServer::new());
        for i in 0..5 {
            let id = format!("place{:07}", i);
            server.insert_payload("history", Guid::new(&id), history_payload(&id, &format!("https://s{}.example/", i)));
        }
        server.insert_payload("history", Guid::new("aboutblank01"), history_payload("aboutblank01", "about:blank"));

        let prefs = Prefs::in_memory();
        let scratchpad = scratchpad(&server).await;
        let history = InMemoryHistory::new();

        let status = HistorySynchronizer::new(scratchpad, &prefs, SyncReason::User)
            .synchronize_local_history(&history)
            .await
            .unwrap();

        let SyncStatus::Completed(stats) = status else {
            panic!("expected completed, got {:?}", status);
        };
        assert_eq!(stats.downloads.fetched, 6);
        assert_eq!(stats.downloads.applied, 5);
        assert_eq!(stats.downloads.failed, 0);
        assert_eq!(history.site_stats(None).unwrap().len(), 5);
        assert!(history.downloads_applied() >= 1);

        let sync_prefs = CollectionSynchronizer::prefs_for(&prefs, "history");
        assert_eq!(sync_prefs.u64("lastFetched"), Some(server.now()));
    }

    #[tokio::test]
    async fn test_remote_deletion() {
        let server = Arc::new(InMemorySyncServer::new());
        let history = InMemoryHistory::new();
        let place = Place::new(Guid::new("doomed000001"), "https://doomed.example/", "Doomed");
        history.insert_or_update_place(&place, 1).unwrap();
        history.store_remote_visits(&[Visit::new(5, VisitType::Link)], &place.guid).unwrap();
        server.delete_record("history", &place.guid);

        let status = HistorySynchronizer::new(scratchpad(&server).await, &Prefs::in_memory(), SyncReason::User)
            .synchronize_local_history(&history)
            .await
            .unwrap();

        assert!(status.is_completed());
        assert!(history.site_stats(None).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_uploads_local_changes() {
        let server = Arc::new(InMemorySyncServer::new());
        let history = InMemoryHistory::new();
        let visit = crate::models::SiteVisit::new(
            crate::models::Site::new("https://local.example/", "Local"),
            crate::models::now_micros(),
            VisitType::Typed,
        );
        crate::storage::BrowserHistory::add_local_visit(&history, &visit).unwrap();

        let prefs = Prefs::in_memory();
        let status = HistorySynchronizer::new(scratchpad(&server).await, &prefs, SyncReason::User)
            .synchronize_local_history(&history)
            .await
            .unwrap();

        let SyncStatus::Completed(stats) = status else {
            panic!("expected completed");
        };
        assert_eq!(stats.uploads.sent, 1);

        let uploaded = server.records("history");
        assert_eq!(uploaded.len(), 1);
        let record = uploaded[0].decode::<HistoryPayload>().unwrap();
        assert_eq!(record.payload.hist_uri, "https://local.example/");
        assert_eq!(record.payload.visits.len(), 1);
        assert_eq!(record.ttl, Some(crate::models::HISTORY_TTL_SECONDS));
        assert!(history.modified_places_to_upload().unwrap().is_empty());

        // Nothing was unseen, so our own upload is not downloaded again.
        let sync_prefs = CollectionSynchronizer::prefs_for(&prefs, "history");
        assert_eq!(sync_prefs.u64("lastFetched"), Some(uploaded[0].modified));
        let again = HistorySynchronizer::new(scratchpad(&server).await, &prefs, SyncReason::User)
            .synchronize_local_history(&history)
            .await
            .unwrap();
        assert_eq!(again.stats().unwrap().downloads.fetched, 0);
        assert_eq!(server.fetch_count("history"), 0);
    }

    #[tokio::test]
    async fn test_download_failure_is_partial() {
        let server = Arc::new(InMemorySyncServer::new());
        server.insert_payload("history", Guid::new("a"), history_payload("a", "https://a.example/"));
        server.fail_next_fetch("history", crate::ServerError::Http { status: 503, message: "busy".to_string() });

        let prefs = Prefs::in_memory();
        let status = HistorySynchronizer::new(scratchpad(&server).await, &prefs, SyncReason::User)
            .synchronize_local_history(&InMemoryHistory::new())
            .await
            .unwrap();

        let SyncStatus::Partial(stats) = status else {
            panic!("expected partial");
        };
        assert!(stats.failure_reason.unwrap().contains("503"));
        assert_eq!(CollectionSynchronizer::prefs_for(&prefs, "history").u64("lastFetched"), None);
    }

    #[tokio::test]
    async fn test_zero_batch_size_is_partial() {
        let server = Arc::new(InMemorySyncServer::new());
        server.insert_payload("history", Guid::new("a"), history_payload("a", "https://a.example/"));
        let mut pad = (*scratchpad(&server).await).clone();
        pad.config.history_batch_size = 0;

        let status = HistorySynchronizer::new(Arc::new(pad), &Prefs::in_memory(), SyncReason::User)
            .synchronize_local_history(&InMemoryHistory::new())
            .await
            .unwrap();
        assert!(matches!(status, SyncStatus::Partial(_)));
        assert_eq!(server.fetch_count("history"), 0);
    }

    async fn sync_with_bad_records(bad: usize) -> SyncStatus {
        let server = Arc::new(InMemorySyncServer::new());
        for i in 0..3 {
            let id = format!("good{:08}", i);
            server.insert_payload("history", Guid::new(&id), history_payload(&id, &format!("https://g{}.example/", i)));
        }
        for i in 0..bad {
            // No id: cannot be decoded
            server.insert_payload("history", Guid::new(format!("bad{:09}", i)), json!({"histUri": 7}));
        }

        HistorySynchronizer::new(scratchpad(&server).await, &Prefs::in_memory(), SyncReason::User)
            .synchronize_local_history(&InMemoryHistory::new())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_few_failures_are_masked() {
        let SyncStatus::Completed(stats) = sync_with_bad_records(2).await else {
            panic!("expected completed");
        };
        assert_eq!(stats.downloads.failed, 2);
        assert_eq!(stats.downloads.applied, 3);
    }

    #[tokio::test]
    async fn test_fourth_failure_aborts() {
        let status = sync_with_bad_records(4).await;
        let SyncStatus::Partial(stats) = status else {
            panic!("expected partial, got {:?}", status);
        };
        assert_eq!(stats.downloads.failed, 4);
        assert!(stats.failure_reason.is_some());
    }
}
