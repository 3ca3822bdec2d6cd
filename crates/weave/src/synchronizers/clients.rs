//! `clients` collection synchronizer

use std::sync::Arc;

use anyhow::Result;
use chrono::DateTime;
use serde_json::Value;

use super::{CollectionSynchronizer, SyncDelegate, SyncReason, SyncStatus};
use crate::models::{
    ClientCommand, ClientPayload, CommandPayload, Record, RemoteClient, SUPPORTED_PROTOCOLS, now_millis,
};
use crate::prefs::Prefs;
use crate::scratchpad::Scratchpad;
use crate::stats::interval_elapsed;
use crate::storage::RemoteClientsAndTabs;

const LAST_UPLOAD_PREF: &str = "clientRecordLastUpload";

/// Mirrors remote client records and keeps ours current
pub struct ClientsSynchronizer {
    base: CollectionSynchronizer,
}

impl ClientsSynchronizer {
    pub const COLLECTION: &'static str = "clients";
    pub const STORAGE_VERSION: u32 = 1;

    pub fn new(scratchpad: Arc<Scratchpad>, base_prefs: &Prefs, why: SyncReason) -> Self {
        Self {
            base: CollectionSynchronizer::new(scratchpad, base_prefs, why, Self::COLLECTION),
        }
    }

    pub async fn synchronize_local_clients(
        mut self,
        storage: &dyn RemoteClientsAndTabs,
        delegate: &dyn SyncDelegate,
    ) -> Result<SyncStatus> {
        let scratchpad = Arc::clone(&self.base.scratchpad);
        let mut commands_processed = false;

        if self.base.remote_has_changes(&scratchpad.info) {
            let (records, fetched_at) = match self.base.fetch_changed().await {
                Ok(fetched) => fetched,
                Err(e) => return Ok(self.base.failed(&e)),
            };
            self.base.stats.record_download_fetched(records.len());

            let (own, others): (Vec<_>, Vec<_>) = records.iter().partition(|r| r.id == scratchpad.client_guid);
            for record in others {
                self.apply_record(record, storage)?;
            }
            // Senders in this batch must be stored before their names are looked up
            for record in own {
                commands_processed |= self.process_commands(record, storage, delegate)?;
            }

            self.base.set_last_fetched(fetched_at)?;
        } else {
            log::debug!("No remote client changes");
        }

        if self.should_upload(commands_processed) {
            if let Err(e) = self.upload_local_client().await {
                return Ok(self.base.failed(&e));
            }
        }

        Ok(self.base.completed())
    }

    fn apply_record(&mut self, record: &Record<Value>, storage: &dyn RemoteClientsAndTabs) -> Result<()> {
        if record.is_deleted() {
            storage.delete_client(&record.id)?;
            self.base.stats.record_download_applied();
            return Ok(());
        }

        match record.decode::<ClientPayload>() {
            Ok(decoded) => {
                storage.insert_or_update_client(&RemoteClient::from_payload(&decoded.payload, record.modified))?;
                self.base.stats.record_download_applied();
            }
            Err(e) => {
                log::warn!("Skipping malformed client record {}: {}", record.id, e);
                self.base.stats.record_download_failed();
            }
        }
        Ok(())
    }

    /// Run commands queued on our own record. Returns whether any were found.
    fn process_commands(
        &mut self,
        record: &Record<Value>,
        storage: &dyn RemoteClientsAndTabs,
        delegate: &dyn SyncDelegate,
    ) -> Result<bool> {
        let commands: Vec<CommandPayload> = match record.decode::<ClientPayload>() {
            Ok(decoded) => decoded.payload.commands,
            Err(e) => {
                log::warn!("Own client record is malformed, replacing it: {}", e);
                return Ok(true);
            }
        };

        for command in &commands {
            match ClientCommand::parse(command) {
                Some(ClientCommand::DisplayUri { uri, sender, title }) => {
                    let sender_name = storage.get_client(&sender)?.map(|c| c.name);
                    log::info!("Displaying tab sent by {:?}", sender_name);
                    delegate.display_sent_tab(&uri, &title, sender_name.as_deref());
                }
                Some(ClientCommand::Wipe { command }) => {
                    log::info!("Ignoring {} command", command);
                }
                None => {
                    log::debug!("Ignoring unknown client command {}", command.command);
                }
            }
        }

        Ok(!commands.is_empty())
    }

    fn should_upload(&self, commands_processed: bool) -> bool {
        if commands_processed || self.base.why == SyncReason::ClientNameChanged {
            return true;
        }
        if self.base.scratchpad.info.modified(Self::COLLECTION).is_none() {
            return true;
        }

        let last_upload = self
            .base
            .prefs
            .u64(LAST_UPLOAD_PREF)
            .and_then(|ms| DateTime::from_timestamp_millis(ms as i64));
        interval_elapsed(last_upload, self.base.scratchpad.config.clients_upload_interval_secs)
    }

    fn local_client_payload(&self) -> ClientPayload {
        let scratchpad = &self.base.scratchpad;
        let form_factor = match scratchpad.client_type.as_str() {
            "mobile" => "phone",
            _ => "desktop",
        };

        ClientPayload {
            id: scratchpad.client_guid.clone(),
            name: scratchpad.client_name.clone(),
            client_type: scratchpad.client_type.clone(),
            version: Some(env!("CARGO_PKG_VERSION").to_string()),
            protocols: SUPPORTED_PROTOCOLS.iter().map(|p| p.to_string()).collect(),
            os: Some(std::env::consts::OS.to_string()),
            form_factor: Some(form_factor.to_string()),
            fxa_device_id: None,
            commands: Vec::new(),
        }
    }

    async fn upload_local_client(&mut self) -> Result<()> {
        let scratchpad = Arc::clone(&self.base.scratchpad);
        let was_current = !self.base.remote_has_changes(&scratchpad.info);

        let payload = self.local_client_payload();
        let record = Record::new(payload.id.clone(), payload, 0).encode()?;
        let result = scratchpad
            .server
            .upload_records(Self::COLLECTION, vec![record])
            .await?;

        self.base.stats.record_upload(result.succeeded.len(), result.failed.len());
        self.base.prefs.set_u64(LAST_UPLOAD_PREF, now_millis())?;
        log::info!("Uploaded local client record {}", scratchpad.client_guid);

        if was_current || self.base.last_fetched() >= scratchpad.info.modified(Self::COLLECTION).unwrap_or(0) {
            self.base.set_last_fetched(result.modified)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Guid;
    use crate::scratchpad::tests_support::scratchpad;
    use crate::server::InMemorySyncServer;
    use crate::storage::InMemoryClientsAndTabs;
    use serde_json::json;
    use std::sync::Mutex;
    use url::Url;

    #[derive(Default)]
    struct RecordingDelegate {
        shown: Mutex<Vec<(String, String, Option<String>)>>,
    }

    impl SyncDelegate for RecordingDelegate {
        fn display_sent_tab(&self, url: &Url, title: &str, device_name: Option<&str>) {
            self.shown
                .lock()
                .unwrap()
                .push((url.to_string(), title.to_string(), device_name.map(str::to_string)));
        }
    }

    fn client_payload(id: &str, name: &str, commands: Value) -> Value {
        json!({"id": id, "name": name, "type": "desktop", "commands": commands})
    }

    #[tokio::test]
    async fn test_mirrors_remote_clients() {
        let server = Arc::new(InMemorySyncServer::new());
        server.insert_payload("clients", Guid::new("laptop"), client_payload("laptop", "Laptop", json!([])));
        server.insert_payload("clients", Guid::new("tablet"), client_payload("tablet", "Tablet", json!([])));
        server.delete_record("clients", &Guid::new("tablet"));

        let storage = InMemoryClientsAndTabs::new();
        storage
            .insert_or_update_client(&RemoteClient::new(Guid::new("tablet"), "Tablet", "mobile", 1))
            .unwrap();

        let status = ClientsSynchronizer::new(scratchpad(&server).await, &Prefs::in_memory(), SyncReason::User)
            .synchronize_local_clients(&storage, &RecordingDelegate::default())
            .await
            .unwrap();

        assert!(status.is_completed());
        let clients = storage.get_clients().unwrap();
        assert_eq!(clients.len(), 1);
        assert_eq!(clients[0].name, "Laptop");
    }

    #[tokio::test]
    async fn test_uploads_own_record() {
        let server = Arc::new(InMemorySyncServer::new());
        let prefs = Prefs::in_memory();
        let storage = InMemoryClientsAndTabs::new();

        let status = ClientsSynchronizer::new(scratchpad(&server).await, &prefs, SyncReason::User)
            .synchronize_local_clients(&storage, &RecordingDelegate::default())
            .await
            .unwrap();
        assert_eq!(status.stats().unwrap().uploads.sent, 1);

        let record = server.record("clients", &Guid::new("localclient1")).unwrap();
        let payload = record.decode::<ClientPayload>().unwrap().payload;
        assert_eq!(payload.name, "Test Phone");
        assert_eq!(payload.protocols, vec!["1.5"]);
        assert!(payload.commands.is_empty());
        assert!(storage.get_clients().unwrap().is_empty());

        // Fresh record, nothing new: no second upload
        let status = ClientsSynchronizer::new(scratchpad(&server).await, &prefs, SyncReason::User)
            .synchronize_local_clients(&storage, &RecordingDelegate::default())
            .await
            .unwrap();
        assert_eq!(status.stats().unwrap().uploads.sent, 0);
        assert_eq!(server.upload_count("clients"), 1);
    }

    #[tokio::test]
    async fn test_display_uri_command() {
        let server = Arc::new(InMemorySyncServer::new());
        server.insert_payload("clients", Guid::new("laptop"), client_payload("laptop", "Laptop", json!([])));
        server.insert_payload(
            "clients",
            Guid::new("localclient1"),
            client_payload(
                "localclient1",
                "Test Phone",
                json!([
                    {"command": "displayURI", "args": ["https://sent.example/", "laptop", "Sent"]},
                    {"command": "displayURI", "args": ["https://other.example/", "unknown", "Other"]},
                    {"command": "wipeAll", "args": []},
                    {"command": "frobnicate", "args": []}
                ]),
            ),
        );

        let delegate = RecordingDelegate::default();
        let status = ClientsSynchronizer::new(scratchpad(&server).await, &Prefs::in_memory(), SyncReason::User)
            .synchronize_local_clients(&InMemoryClientsAndTabs::new(), &delegate)
            .await
            .unwrap();
        assert!(status.is_completed());

        let shown = delegate.shown.lock().unwrap().clone();
        assert_eq!(
            shown,
            vec![
                ("https://sent.example/".to_string(), "Sent".to_string(), Some("Laptop".to_string())),
                ("https://other.example/".to_string(), "Other".to_string(), None),
            ]
        );

        // Commands are cleared by re-uploading our record
        let record = server.record("clients", &Guid::new("localclient1")).unwrap();
        assert!(record.decode::<ClientPayload>().unwrap().payload.commands.is_empty());
    }

    #[tokio::test]
    async fn test_sender_name_from_same_batch() {
        let server = Arc::new(InMemorySyncServer::new());
        // Our record is older than the sender's, so it is fetched first
        server.insert_payload(
            "clients",
            Guid::new("localclient1"),
            client_payload(
                "localclient1",
                "Test Phone",
                json!([{"command": "displayURI", "args": ["https://sent.example/", "laptop", "Sent"]}]),
            ),
        );
        server.insert_payload("clients", Guid::new("laptop"), client_payload("laptop", "Laptop", json!([])));

        let delegate = RecordingDelegate::default();
        ClientsSynchronizer::new(scratchpad(&server).await, &Prefs::in_memory(), SyncReason::User)
            .synchronize_local_clients(&InMemoryClientsAndTabs::new(), &delegate)
            .await
            .unwrap();

        let names: Vec<Option<String>> = delegate.shown.lock().unwrap().iter().map(|s| s.2.clone()).collect();
        assert_eq!(names, vec![Some("Laptop".to_string())]);
    }
}
