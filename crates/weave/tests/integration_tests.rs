//! Integration tests for the weave crate
//!
//! These tests drive the sync manager end to end against the in-memory
//! storage service.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use serde_json::{Value, json};
use tempfile::TempDir;
use tokio::sync::broadcast;

use weave::manager::events;
use weave::models::{KeyBundle, Keys, MetaGlobal};
use weave::storage::{InMemoryClientsAndTabs, InMemoryHistory, RemoteClientsAndTabs};
use weave::{
    AccountSession, ExternalEngine, Guid, InMemorySyncServer, NotStartedReason, Prefs, Scratchpad, ServerError, StaticAccountSession,
    StorageEvent, SyncConfig, SyncEngineStats, SyncError, SyncManager, SyncPhase, SyncProfile, SyncReason,
    SyncResults, SyncServer, SyncStatus, TokenServerToken,
};

/// Stand-in for a collection synced outside the crate
struct FakeEngine {
    collection: &'static str,
    has_synced: bool,
    syncs: AtomicUsize,
    resets: AtomicUsize,
}

impl FakeEngine {
    fn new(collection: &'static str) -> Arc<Self> {
        Arc::new(Self {
            collection,
            has_synced: true,
            syncs: AtomicUsize::new(0),
            resets: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl ExternalEngine for FakeEngine {
    fn collection(&self) -> &str {
        self.collection
    }

    fn storage_version(&self) -> u32 {
        1
    }

    async fn sync(&self, _scratchpad: Arc<Scratchpad>, _why: SyncReason) -> Result<SyncStatus> {
        self.syncs.fetch_add(1, Ordering::SeqCst);
        Ok(SyncStatus::Completed(SyncEngineStats {
            collection: self.collection.to_string(),
            ..Default::default()
        }))
    }

    fn reset(&self) -> Result<()> {
        self.resets.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn has_synced(&self) -> Result<bool> {
        Ok(self.has_synced)
    }
}

/// Signed in, but the sync keys cannot be read
struct LockedKeychainAccount {
    server: Arc<InMemorySyncServer>,
}

#[async_trait]
impl AccountSession for LockedKeychainAccount {
    async fn ready(&self) -> Result<()> {
        Ok(())
    }

    async fn storage_token(&self) -> Result<TokenServerToken> {
        Ok(StaticAccountSession::default_token())
    }

    async fn decryption_keys(&self, _scope: &str) -> Result<Keys> {
        Err(anyhow!("keychain entry unavailable"))
    }

    fn storage_client(&self, _token: &TokenServerToken) -> Arc<dyn SyncServer> {
        self.server.clone()
    }
}

struct Harness {
    server: Arc<InMemorySyncServer>,
    account: Arc<StaticAccountSession>,
    prefs: Prefs,
    history: Arc<InMemoryHistory>,
    clients_and_tabs: Arc<InMemoryClientsAndTabs>,
    events: broadcast::Sender<StorageEvent>,
    manager: Arc<SyncManager>,
}

impl Harness {
    fn new() -> Self {
        Self::with(SyncConfig::default(), Vec::new())
    }

    fn with(config: SyncConfig, engines: Vec<Arc<dyn ExternalEngine>>) -> Self {
        let server = Arc::new(InMemorySyncServer::new());
        let account = Arc::new(StaticAccountSession::new(server.clone()));
        let prefs = Prefs::in_memory();
        let history = Arc::new(InMemoryHistory::new());
        let clients_and_tabs = Arc::new(InMemoryClientsAndTabs::new());

        let mut profile = SyncProfile::new(prefs.clone(), history.clone(), clients_and_tabs.clone());
        for engine in engines {
            profile = profile.with_engine(engine);
        }

        let (events, rx) = events::channel();
        let manager = Arc::new(SyncManager::new(account.clone(), profile, config, rx));

        Self {
            server,
            account,
            prefs,
            history,
            clients_and_tabs,
            events,
            manager,
        }
    }

    fn last_fetched(&self, collection: &str) -> Option<u64> {
        self.prefs.u64(&format!("synchronizer.{}.lastFetched", collection))
    }

    fn add_history(&self, id: &str, url: &str) -> u64 {
        self.server.insert_payload("history", Guid::new(id), history_payload(id, url))
    }
}

fn history_payload(id: &str, url: &str) -> Value {
    json!({
        "id": id,
        "histUri": url,
        "title": format!("Title {}", id),
        "visits": [{"date": 1_000_000, "type": 1}]
    })
}

fn names(results: &SyncResults) -> Vec<&str> {
    results.iter().map(|(c, _)| c.as_str()).collect()
}

fn all_not_started(results: &SyncResults, reason: NotStartedReason) -> bool {
    results
        .iter()
        .all(|(_, s)| *s == SyncStatus::NotStarted(reason.clone()))
}

#[tokio::test]
async fn test_sync_all_completes_in_order() {
    let h = Harness::new();
    h.add_history("place0000001", "https://a.example/");
    h.add_history("place0000002", "https://b.example/");
    h.server.insert_payload(
        "clients",
        Guid::new("laptop"),
        json!({"id": "laptop", "name": "Laptop", "type": "desktop"}),
    );
    let phases = h.manager.subscribe_phase();
    assert_eq!(h.manager.phase(), SyncPhase::NoAccount);

    let results = h.manager.sync_all(SyncReason::User).await;

    assert_eq!(names(&results), vec!["clients", "tabs", "history"]);
    assert!(results.iter().all(|(_, s)| s.is_completed()));
    assert_eq!(*phases.borrow(), SyncPhase::Completed);

    assert!(h.history.place_for_url("https://a.example/").is_some());
    assert!(h.history.place_for_url("https://b.example/").is_some());
    assert!(h.manager.has_synced_history().unwrap());
    assert!(!h.manager.has_synced_logins().unwrap());
    assert_eq!(h.clients_and_tabs.get_clients().unwrap().len(), 1);

    assert_eq!(
        h.prefs.string_list("sync.enabledEngines").unwrap(),
        vec!["clients", "tabs", "history"]
    );
    assert_eq!(h.manager.last_operation_stats().unwrap().why, "user");
}

#[tokio::test(start_paused = true)]
async fn test_overlapping_sync_all_is_coalesced() {
    let h = Harness::new();
    h.add_history("place0000001", "https://a.example/");
    h.server.set_latency(Some(Duration::from_millis(10)));

    let (first, second) = tokio::join!(
        h.manager.sync_all(SyncReason::Scheduled),
        h.manager.sync_all(SyncReason::User)
    );

    assert_eq!(first, second);
    assert!(first.iter().all(|(_, s)| s.is_completed()));
    // Only one attempt reached the account and the server
    assert_eq!(h.account.token_requests(), 1);
    assert_eq!(h.server.upload_count("tabs"), 1);
    assert_eq!(h.server.fetch_count("history"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_overlapping_subset_shares_results() {
    let h = Harness::new();
    h.server.set_latency(Some(Duration::from_millis(10)));

    let (all, tabs) = tokio::join!(h.manager.sync_all(SyncReason::Scheduled), async {
        h.manager.sync_collection("tabs").await.unwrap()
    });

    let shared = all.iter().find(|(c, _)| c == "tabs").map(|(_, s)| s.clone());
    assert_eq!(shared, Some(tabs));
    assert_eq!(h.server.upload_count("tabs"), 1);
}

#[tokio::test]
async fn test_no_account() {
    let server = Arc::new(InMemorySyncServer::new());
    let account = Arc::new(StaticAccountSession::signed_out(server.clone()));
    let (_events, rx) = events::channel();
    let manager = SyncManager::new(account, SyncProfile::in_memory(), SyncConfig::default(), rx);

    let results = manager.sync_all(SyncReason::Startup).await;
    assert_eq!(results.len(), 3);
    assert!(all_not_started(&results, NotStartedReason::NoAccount));
    assert_eq!(manager.phase(), SyncPhase::NoAccount);
    assert_eq!(server.fetch_count("clients"), 0);
    assert_eq!(server.upload_count("clients"), 0);
}

#[tokio::test]
async fn test_unreadable_keys_mean_no_account() {
    let server = Arc::new(InMemorySyncServer::new());
    let account = Arc::new(LockedKeychainAccount { server: server.clone() });
    let (_events, rx) = events::channel();
    let manager = SyncManager::new(account, SyncProfile::in_memory(), SyncConfig::default(), rx);

    let results = manager.sync_all(SyncReason::User).await;
    assert_eq!(results.len(), 3);
    assert!(all_not_started(&results, NotStartedReason::NoAccount));
    assert_eq!(manager.phase(), SyncPhase::NoAccount);
    assert_eq!(server.fetch_count("clients"), 0);
}

#[tokio::test]
async fn test_offline_and_backoff() {
    let h = Harness::new();

    h.manager.set_online(false);
    let results = h.manager.sync_all(SyncReason::Scheduled).await;
    assert!(all_not_started(&results, NotStartedReason::Offline));
    assert_eq!(h.manager.phase(), SyncPhase::NotStarted);
    assert_eq!(h.account.token_requests(), 0);

    h.manager.set_online(true);
    h.server.fail_next(ServerError::Backoff { remaining_seconds: 60 });
    let results = h.manager.sync_all(SyncReason::Scheduled).await;
    assert!(all_not_started(&results, NotStartedReason::Backoff { remaining_seconds: 60 }));

    // The deadline is persisted and honoured without asking the server
    let requests = h.account.token_requests();
    let results = h.manager.sync_all(SyncReason::Scheduled).await;
    let SyncStatus::NotStarted(NotStartedReason::Backoff { remaining_seconds }) = &results[0].1 else {
        panic!("expected backoff, got {}", results[0].1);
    };
    assert!(*remaining_seconds > 0 && *remaining_seconds <= 60);
    assert_eq!(h.account.token_requests(), requests);
    assert!(h.prefs.u64("sync.backoff.until").is_some());
}

#[tokio::test]
async fn test_red_light_when_idle() {
    let h = Harness::new();
    h.manager.interrupt();

    let results = h.manager.sync_all(SyncReason::User).await;
    assert!(all_not_started(&results, NotStartedReason::RedLight));

    let results = h.manager.sync_all(SyncReason::User).await;
    assert!(results.iter().all(|(_, s)| s.is_completed()));
}

#[tokio::test]
async fn test_interrupt_mid_sync() {
    let bookmarks = FakeEngine::new("bookmarks");
    let config = SyncConfig {
        history_batch_size: 2,
        ..SyncConfig::default()
    };
    let h = Harness::with(config, vec![bookmarks.clone() as Arc<dyn ExternalEngine>]);
    let stamps: Vec<u64> = (1..=5)
        .map(|i| h.add_history(&format!("place000000{}", i), &format!("https://{}.example/", i)))
        .collect();

    let manager = Arc::downgrade(&h.manager);
    h.server.on_fetch(move |collection, page| {
        if collection == "history" && page == 1 {
            if let Some(manager) = manager.upgrade() {
                manager.interrupt();
            }
        }
    });

    let results = h.manager.sync_all(SyncReason::User).await;
    assert_eq!(names(&results), vec!["clients", "tabs", "history", "bookmarks"]);
    assert!(results[0].1.is_completed());
    assert!(results[1].1.is_completed());
    assert!(matches!(results[2].1, SyncStatus::Partial(_)));
    assert_eq!(results[3].1, SyncStatus::NotStarted(NotStartedReason::RedLight));
    assert_eq!(bookmarks.syncs.load(Ordering::SeqCst), 0);
    assert_eq!(h.manager.phase(), SyncPhase::Partial);

    // Watermark stops at the applied page
    assert_eq!(h.last_fetched("history"), Some(stamps[1]));
    assert!(h.history.place_for_url("https://2.example/").is_some());
    assert!(h.history.place_for_url("https://3.example/").is_none());

    let results = h.manager.sync_all(SyncReason::User).await;
    assert!(results.iter().all(|(_, s)| s.is_completed()));
    assert!(h.history.place_for_url("https://5.example/").is_some());
    assert_eq!(bookmarks.syncs.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_continue_after_interrupt() {
    let bookmarks = FakeEngine::new("bookmarks");
    let config = SyncConfig {
        history_batch_size: 2,
        continue_after_interrupt: true,
        ..SyncConfig::default()
    };
    let h = Harness::with(config, vec![bookmarks.clone() as Arc<dyn ExternalEngine>]);
    for i in 1..=5 {
        h.add_history(&format!("place000000{}", i), &format!("https://{}.example/", i));
    }

    let manager = Arc::downgrade(&h.manager);
    h.server.on_fetch(move |collection, page| {
        if collection == "history" && page == 1 {
            if let Some(manager) = manager.upgrade() {
                manager.interrupt();
            }
        }
    });

    let results = h.manager.sync_all(SyncReason::User).await;
    assert!(matches!(results[2].1, SyncStatus::Partial(_)));
    assert!(results[3].1.is_completed());
    assert_eq!(bookmarks.syncs.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_reset_collection_scopes() {
    let h = Harness::new();
    h.manager.sync_all(SyncReason::User).await;
    assert!(h.last_fetched("clients").is_some());
    assert!(h.last_fetched("tabs").is_some());

    h.manager.reset_collection("tabs").await.unwrap();
    assert_eq!(h.last_fetched("tabs"), None);
    assert!(h.last_fetched("clients").is_some());

    h.manager.sync_all(SyncReason::User).await;
    h.manager.reset_collection("clients").await.unwrap();
    assert_eq!(h.last_fetched("clients"), None);
    assert_eq!(h.last_fetched("tabs"), None);

    let err = h.manager.reset_collection("forms").await.unwrap_err();
    assert_eq!(
        err.downcast_ref::<SyncError>(),
        Some(&SyncError::UnknownCollection("forms".to_string()))
    );
}

#[tokio::test(start_paused = true)]
async fn test_database_recreated_resets_history_and_tabs() {
    let h = Harness::new();
    h.add_history("place0000001", "https://a.example/");
    h.manager.sync_all(SyncReason::User).await;
    assert!(h.last_fetched("history").is_some());

    h.events
        .send(StorageEvent::DatabaseRecreated(Some("logins.db".to_string())))
        .unwrap();
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(h.last_fetched("history").is_some());

    h.events.send(StorageEvent::DatabaseRecreated(None)).unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    // Not before the delay
    assert!(h.last_fetched("history").is_some());

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(h.last_fetched("history"), None);
    assert_eq!(h.last_fetched("tabs"), None);
    assert!(h.last_fetched("clients").is_some());
}

#[tokio::test]
async fn test_disabling_engine_resets_it() {
    let h = Harness::new();
    h.add_history("place0000001", "https://a.example/");
    h.manager.sync_all(SyncReason::User).await;
    assert_eq!(h.server.fetch_count("history"), 1);

    h.manager.set_engine_enabled("history", false).unwrap();
    assert!(!h.manager.is_engine_enabled("history"));
    let results = h.manager.sync_all(SyncReason::EngineEnabled).await;
    assert_eq!(names(&results), vec!["clients", "tabs"]);
    assert_eq!(h.last_fetched("history"), None);

    let err = h.manager.sync_collection("history").await.unwrap_err();
    assert_eq!(
        err.downcast_ref::<SyncError>(),
        Some(&SyncError::EngineDisabled("history".to_string()))
    );

    h.manager.set_engine_enabled("history", true).unwrap();
    let results = h.manager.sync_all(SyncReason::EngineEnabled).await;
    assert_eq!(names(&results), vec!["clients", "tabs", "history"]);
    // Downloaded again from scratch
    assert_eq!(h.server.fetch_count("history"), 2);
}

#[tokio::test]
async fn test_node_reassignment_resets_everything() {
    let h = Harness::new();
    h.add_history("place0000001", "https://a.example/");
    h.manager.sync_all(SyncReason::User).await;
    h.manager.sync_all(SyncReason::User).await;
    assert_eq!(h.server.fetch_count("history"), 1);

    let mut token = StaticAccountSession::default_token();
    token.api_endpoint = "https://sync-2.example.com/1.5/1".to_string();
    h.account.set_token(token);

    let results = h.manager.sync_all(SyncReason::User).await;
    assert!(results.iter().all(|(_, s)| s.is_completed()));
    assert_eq!(h.server.fetch_count("history"), 2);
    assert_eq!(h.prefs.string("sync.token.endpoint").unwrap(), "https://sync-2.example.com/1.5/1");
}

#[tokio::test]
async fn test_meta_global_checks() {
    let h = Harness::new();

    h.server.set_meta_global(Some(MetaGlobal::new(4)));
    let results = h.manager.sync_all(SyncReason::User).await;
    assert!(all_not_started(&results, NotStartedReason::StorageFormatOutdated { needs: 5 }));
    assert_eq!(h.manager.phase(), SyncPhase::NotStarted);

    h.server.set_meta_global(Some(MetaGlobal::new(6)));
    let results = h.manager.sync_all(SyncReason::User).await;
    assert!(all_not_started(&results, NotStartedReason::StorageFormatTooNew { expected: 5 }));

    h.server.set_meta_global(Some(
        MetaGlobal::new(5)
            .with_declined("history")
            .with_engine("tabs", 2, "tabs-sync-id"),
    ));
    let results = h.manager.sync_all(SyncReason::User).await;
    assert!(results[0].1.is_completed());
    assert_eq!(
        results[1].1,
        SyncStatus::NotStarted(NotStartedReason::EngineFormatTooNew { expected: 1 })
    );
    assert_eq!(
        results[2].1,
        SyncStatus::NotStarted(NotStartedReason::EngineRemotelyNotEnabled {
            collection: "history".to_string()
        })
    );
    assert_eq!(h.prefs.string_list("sync.declinedEngines").unwrap(), vec!["history"]);
    assert_eq!(h.prefs.string_list("sync.enabledEngines").unwrap(), vec!["clients", "tabs"]);
    assert_eq!(h.manager.phase(), SyncPhase::Partial);
}

#[tokio::test]
async fn test_unusable_keys() {
    let h = Harness::new();
    h.account.set_keys(Keys::new(KeyBundle::new(Vec::new(), Vec::new())));

    let results = h.manager.sync_all(SyncReason::User).await;
    assert!(all_not_started(&results, NotStartedReason::StateMachineNotReady));
}

#[tokio::test]
async fn test_external_engines() {
    let passwords = FakeEngine::new("passwords");
    let bookmarks = FakeEngine::new("bookmarks");
    let engines: Vec<Arc<dyn ExternalEngine>> = vec![passwords.clone(), bookmarks.clone()];
    let h = Harness::with(SyncConfig::default(), engines);

    assert!(h.manager.has_synced_logins().unwrap());

    let results = h
        .manager
        .sync_several(&["passwords", "clients", "passwords"], SyncReason::User)
        .await
        .unwrap();
    assert_eq!(names(&results), vec!["clients", "passwords"]);
    assert_eq!(passwords.syncs.load(Ordering::SeqCst), 1);
    assert_eq!(bookmarks.syncs.load(Ordering::SeqCst), 0);

    h.manager.reset_collection("passwords").await.unwrap();
    assert_eq!(passwords.resets.load(Ordering::SeqCst), 1);

    let results = h.manager.sync_all(SyncReason::User).await;
    assert_eq!(names(&results), vec!["clients", "tabs", "history", "bookmarks", "passwords"]);

    let err = h.manager.sync_several(&["forms"], SyncReason::User).await.unwrap_err();
    assert!(err.downcast_ref::<SyncError>().is_some());
}

#[tokio::test]
async fn test_sqlite_profile_sync() {
    let dir = TempDir::new().unwrap();
    let server = Arc::new(InMemorySyncServer::new());
    server.insert_payload(
        "history",
        Guid::new("place0000001"),
        history_payload("place0000001", "https://a.example/"),
    );
    let account = Arc::new(StaticAccountSession::new(server.clone()));

    let (tx, rx) = events::channel();
    let profile = SyncProfile::open(dir.path(), &tx).unwrap();
    let manager = SyncManager::new(account.clone(), profile, SyncConfig::default(), rx);

    let results = manager.sync_all(SyncReason::DidLogin).await;
    assert!(results.iter().all(|(_, s)| s.is_completed()));
    assert!(manager.has_synced_history().unwrap());
    manager.shutdown().await;
    drop(manager);

    // Watermarks survive a restart
    let (tx, rx) = events::channel();
    let profile = SyncProfile::open(dir.path(), &tx).unwrap();
    let manager = SyncManager::new(account, profile, SyncConfig::default(), rx);
    manager.sync_all(SyncReason::Startup).await;
    assert_eq!(server.fetch_count("history"), 1);
}
