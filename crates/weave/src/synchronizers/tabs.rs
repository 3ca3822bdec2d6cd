//! `tabs` collection synchronizer

use std::sync::Arc;

use anyhow::Result;
use serde_json::Value;

use super::{CollectionSynchronizer, SyncReason, SyncStatus, reset_synchronizer};
use crate::downloader::BatchingDownloader;
use crate::models::{Record, TabsPayload};
use crate::prefs::Prefs;
use crate::scratchpad::Scratchpad;
use crate::storage::{RemoteClientsAndTabs, ResettableSyncStorage};

/// Mirrors the open tabs of other devices and publishes ours
pub struct TabsSynchronizer {
    base: CollectionSynchronizer,
}

impl TabsSynchronizer {
    pub const COLLECTION: &'static str = "tabs";
    pub const STORAGE_VERSION: u32 = 1;

    pub fn new(scratchpad: Arc<Scratchpad>, base_prefs: &Prefs, why: SyncReason) -> Self {
        Self {
            base: CollectionSynchronizer::new(scratchpad, base_prefs, why, Self::COLLECTION),
        }
    }

    pub async fn synchronize_local_tabs(mut self, storage: &dyn RemoteClientsAndTabs) -> Result<SyncStatus> {
        let scratchpad = Arc::clone(&self.base.scratchpad);

        if self.base.remote_has_changes(&scratchpad.info) {
            let (records, fetched_at) = match self.base.fetch_changed().await {
                Ok(fetched) => fetched,
                Err(e) => return Ok(self.base.failed(&e)),
            };
            self.base.stats.record_download_fetched(records.len());

            for record in records.iter().filter(|r| r.id != scratchpad.client_guid) {
                self.apply_record(record, storage)?;
            }
            self.base.set_last_fetched(fetched_at)?;
        } else {
            log::debug!("No remote tab changes");
        }

        if scratchpad.green_light.is_cancelled() {
            return Ok(self.base.partial("interrupted"));
        }

        if let Err(e) = self.upload_local_tabs(storage).await {
            return Ok(self.base.failed(&e));
        }

        Ok(self.base.completed())
    }

    fn apply_record(&mut self, record: &Record<Value>, storage: &dyn RemoteClientsAndTabs) -> Result<()> {
        if record.is_deleted() {
            storage.insert_or_update_tabs_for_client(Some(&record.id), &[])?;
            self.base.stats.record_download_applied();
            return Ok(());
        }

        match record.decode::<TabsPayload>() {
            Ok(decoded) => {
                let tabs = decoded.payload.remote_tabs();
                let stored = storage.insert_or_update_tabs_for_client(Some(&record.id), &tabs)?;
                log::debug!("Stored {} tabs for client {}", stored, record.id);
                self.base.stats.record_download_applied();
            }
            Err(e) => {
                log::warn!("Skipping malformed tabs record {}: {}", record.id, e);
                self.base.stats.record_download_failed();
            }
        }
        Ok(())
    }

    async fn upload_local_tabs(&mut self, storage: &dyn RemoteClientsAndTabs) -> Result<()> {
        let scratchpad = Arc::clone(&self.base.scratchpad);
        let was_current = !self.base.remote_has_changes(&scratchpad.info);

        let tabs = storage
            .get_tabs_for_client(None)?
            .iter()
            .filter_map(|t| t.to_payload())
            .collect();
        let payload = TabsPayload {
            id: scratchpad.client_guid.clone(),
            client_name: scratchpad.client_name.clone(),
            tabs,
        };

        let record = Record::new(payload.id.clone(), payload, 0).encode()?;
        let result = scratchpad
            .server
            .upload_records(Self::COLLECTION, vec![record])
            .await?;
        self.base.stats.record_upload(result.succeeded.len(), result.failed.len());

        if was_current {
            self.base.set_last_fetched(result.modified)?;
        }
        Ok(())
    }
}

/// Reset both the clients and tabs synchronizers over their shared storage
pub fn reset_clients_and_tabs<S>(storage: &S, base_prefs: &Prefs) -> Result<()>
where
    S: ResettableSyncStorage + ?Sized,
{
    for collection in ["clients", "tabs"] {
        let prefs = CollectionSynchronizer::prefs_for(base_prefs, collection);
        prefs.remove("lastFetched")?;
        BatchingDownloader::reset(&prefs, collection)?;
    }
    storage.reset_client()?;
    log::info!("Reset clients and tabs synchronizers");
    Ok(())
}

/// Reset the tabs synchronizer alone, keeping remote clients
pub fn reset_tabs(storage: &dyn RemoteClientsAndTabs, base_prefs: &Prefs) -> Result<()> {
    reset_synchronizer(&crate::storage::TabsOnly(storage), base_prefs, TabsSynchronizer::COLLECTION)
}
