//! Sync orchestration
//!
//! [`SyncManager`] runs sync attempts for a [`SyncProfile`]. An attempt
//! goes through:
//!
//! 1. Local resets for collections whose enablement changed, or whose
//!    database was recreated
//! 2. Readiness: backoff, connectivity, red light, then account credentials
//!    and server metadata
//! 3. Per-collection meta/global checks and dispatch to the synchronizers
//!    in a fixed order
//!
//! Only one attempt runs at a time. Requests overlapping a queued or running
//! attempt share its results instead of syncing the same collections twice.

mod coalesce;
mod engines;
pub mod events;
mod profile;

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::SyncConfig;
use crate::error::{ServerError, SyncError, server_error};
use crate::models::{Keys, STORAGE_VERSION, TokenServerToken};
use crate::prefs::Prefs;
use crate::scratchpad::{Scratchpad, local_client_guid};
use crate::server::{AccountSession, SYNC_KEY_SCOPE};
use crate::stats::{EngineStatsSession, OperationStatsSession, SyncOperationStats};
use crate::storage::{RemoteClientsAndTabs, SyncableHistory};
use crate::synchronizers::{
    ClientsSynchronizer, HistorySynchronizer, NotStartedReason, SyncDelegate, SyncReason, SyncStatus,
    TabsSynchronizer, backoff_remaining, record_backoff, reset_clients_and_tabs, reset_synchronizer, reset_tabs,
};

pub use coalesce::SyncResults;
pub use engines::ExternalEngine;
pub use events::StorageEvent;
pub use profile::{PREFS_FILE_NAME, SyncProfile};

/// Order in which collections are synced
pub const CANONICAL_ORDER: &[&str] = &["clients", "tabs", "history", "bookmarks", "passwords"];

/// Collection of the external logins engine
pub const LOGINS_COLLECTION: &str = "passwords";

const BUILT_IN_COLLECTIONS: &[&str] = &[
    ClientsSynchronizer::COLLECTION,
    TabsSynchronizer::COLLECTION,
    HistorySynchronizer::COLLECTION,
];

const TOKEN_UID_PREF: &str = "sync.token.uid";
const TOKEN_ENDPOINT_PREF: &str = "sync.token.endpoint";
const ENABLED_ENGINES_PREF: &str = "sync.enabledEngines";
const DECLINED_ENGINES_PREF: &str = "sync.declinedEngines";

/// Where the manager is in a sync attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    /// No account, or the last attempt found none
    NoAccount,
    Authenticating,
    Ready,
    Syncing,
    /// Every collection of the last attempt completed
    Completed,
    /// Some collection of the last attempt ran but did not complete
    Partial,
    /// No collection of the last attempt started
    NotStarted,
}

/// Orchestrates syncing of one profile against one account
///
/// Must be created inside a tokio runtime: it spawns the storage event
/// listener.
pub struct SyncManager {
    inner: Arc<ManagerInner>,
    shutdown: CancellationToken,
    listener: Mutex<Option<JoinHandle<()>>>,
}

struct ManagerInner {
    account: Arc<dyn AccountSession>,
    config: SyncConfig,
    prefs: Prefs,
    history: Arc<dyn SyncableHistory>,
    clients_and_tabs: Arc<dyn RemoteClientsAndTabs>,
    engines: Vec<Arc<dyn ExternalEngine>>,
    delegate: Arc<dyn SyncDelegate>,
    sync_lock: tokio::sync::Mutex<()>,
    in_flight: coalesce::InFlightSyncs,
    phase: watch::Sender<SyncPhase>,
    online: AtomicBool,
    green_light: Mutex<CancellationToken>,
    browser_db_reset_pending: AtomicBool,
    last_operation: Mutex<Option<SyncOperationStats>>,
}

impl SyncManager {
    pub fn new(
        account: Arc<dyn AccountSession>,
        profile: SyncProfile,
        config: SyncConfig,
        events: broadcast::Receiver<StorageEvent>,
    ) -> Self {
        let (phase, _) = watch::channel(SyncPhase::NoAccount);
        let inner = Arc::new(ManagerInner {
            account,
            config,
            prefs: profile.prefs,
            history: profile.history,
            clients_and_tabs: profile.clients_and_tabs,
            engines: profile.engines,
            delegate: profile.delegate,
            sync_lock: tokio::sync::Mutex::new(()),
            in_flight: coalesce::InFlightSyncs::new(),
            phase,
            online: AtomicBool::new(true),
            green_light: Mutex::new(CancellationToken::new()),
            browser_db_reset_pending: AtomicBool::new(false),
            last_operation: Mutex::new(None),
        });

        let shutdown = CancellationToken::new();
        let listener = tokio::spawn(listen(Arc::clone(&inner), events, shutdown.clone()));

        Self {
            inner,
            shutdown,
            listener: Mutex::new(Some(listener)),
        }
    }

    /// Sync every locally enabled collection
    pub async fn sync_all(&self, why: SyncReason) -> SyncResults {
        let wanted = self
            .inner
            .collections()
            .into_iter()
            .filter(|c| self.inner.is_enabled(c))
            .collect();
        self.inner.sync_requested(wanted, why).await
    }

    /// Sync the named collections; disabled ones are skipped
    pub async fn sync_several(&self, names: &[&str], why: SyncReason) -> Result<SyncResults> {
        let mut wanted = Vec::new();
        for name in names {
            self.inner.ensure_known(name)?;
            if !self.inner.is_enabled(name) {
                log::debug!("Skipping disabled collection {}", name);
                continue;
            }
            if !wanted.iter().any(|w: &String| w.as_str() == *name) {
                wanted.push(name.to_string());
            }
        }
        self.inner.sort_canonical(&mut wanted);
        Ok(self.inner.sync_requested(wanted, why).await)
    }

    pub async fn sync_collection(&self, name: &str) -> Result<SyncStatus> {
        let results = self.sync_several(&[name], SyncReason::User).await?;
        results
            .into_iter()
            .find(|(collection, _)| collection == name)
            .map(|(_, status)| status)
            .ok_or_else(|| SyncError::EngineDisabled(name.to_string()).into())
    }

    /// Drop sync metadata for `name` so its next sync starts over.
    /// Resetting clients also resets tabs.
    pub async fn reset_collection(&self, name: &str) -> Result<()> {
        self.inner.ensure_known(name)?;
        let _lock = self.inner.sync_lock.lock().await;
        self.inner.reset_locally(&[name.to_string()])
    }

    pub fn has_synced_history(&self) -> Result<bool> {
        self.inner.history.has_synced_history()
    }

    pub fn has_synced_logins(&self) -> Result<bool> {
        match self.inner.engine(LOGINS_COLLECTION) {
            Some(engine) => engine.has_synced(),
            None => Ok(false),
        }
    }

    /// Enable or disable a collection locally. Takes effect, with a local
    /// reset, on the next sync attempt.
    pub fn set_engine_enabled(&self, name: &str, enabled: bool) -> Result<()> {
        self.inner.ensure_known(name)?;
        log::info!("{} {}", if enabled { "Enabling" } else { "Disabling" }, name);
        self.inner.engine_prefs(name).set_bool("enabled", enabled)
    }

    pub fn is_engine_enabled(&self, name: &str) -> bool {
        self.inner.is_enabled(name)
    }

    pub fn set_online(&self, online: bool) {
        self.inner.online.store(online, Ordering::SeqCst);
    }

    /// Stop the running sync at its next suspension point
    ///
    /// When idle, the next attempt is refused with a red light instead.
    pub fn interrupt(&self) {
        log::info!("Interrupting sync");
        self.inner.green_light.lock().unwrap().cancel();
    }

    pub fn phase(&self) -> SyncPhase {
        *self.inner.phase.borrow()
    }

    pub fn subscribe_phase(&self) -> watch::Receiver<SyncPhase> {
        self.inner.phase.subscribe()
    }

    /// Timing of the last attempt that passed readiness
    pub fn last_operation_stats(&self) -> Option<SyncOperationStats> {
        self.inner.last_operation.lock().unwrap().clone()
    }

    /// Stop listening for storage events and interrupt any running sync
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.interrupt();
        let listener = self.listener.lock().unwrap().take();
        if let Some(listener) = listener {
            if let Err(e) = listener.await {
                log::warn!("Storage event listener failed: {}", e);
            }
        }
    }
}

impl Drop for SyncManager {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn listen(inner: Arc<ManagerInner>, mut events: broadcast::Receiver<StorageEvent>, shutdown: CancellationToken) {
    loop {
        let event = tokio::select! {
            _ = shutdown.cancelled() => break,
            event = events.recv() => event,
        };

        match event {
            Ok(event) if event.affects_browser_db() => {
                log::info!("Browser database recreated, scheduling reset");
                inner.browser_db_reset_pending.store(true, Ordering::SeqCst);
                let delay = Duration::from_millis(inner.config.database_reset_delay_ms);
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
                inner.reset_after_recreation().await;
            }
            Ok(event) => log::debug!("Ignoring {:?}", event),
            Err(RecvError::Lagged(missed)) => log::warn!("Missed {} storage events", missed),
            Err(RecvError::Closed) => break,
        }
    }
    log::debug!("Storage event listener stopped");
}

impl ManagerInner {
    /// Every collection this manager can sync, in dispatch order
    fn collections(&self) -> Vec<String> {
        let mut collections: Vec<String> = BUILT_IN_COLLECTIONS
            .iter()
            .map(|c| c.to_string())
            .chain(self.engines.iter().map(|e| e.collection().to_string()))
            .collect();
        self.sort_canonical(&mut collections);
        collections
    }

    fn sort_canonical(&self, collections: &mut [String]) {
        collections.sort_by_key(|c| {
            CANONICAL_ORDER
                .iter()
                .position(|o| o == c)
                .unwrap_or(CANONICAL_ORDER.len())
        });
    }

    fn ensure_known(&self, name: &str) -> Result<()> {
        if BUILT_IN_COLLECTIONS.contains(&name) || self.engine(name).is_some() {
            Ok(())
        } else {
            Err(SyncError::UnknownCollection(name.to_string()).into())
        }
    }

    fn engine(&self, name: &str) -> Option<&Arc<dyn ExternalEngine>> {
        self.engines.iter().find(|e| e.collection() == name)
    }

    fn engine_prefs(&self, name: &str) -> Prefs {
        self.prefs.branch(&format!("engine.{}.", name))
    }

    fn is_enabled(&self, name: &str) -> bool {
        self.engine_prefs(name).bool("enabled").unwrap_or(true)
    }

    fn local_storage_version(&self, name: &str) -> Option<u32> {
        match name {
            ClientsSynchronizer::COLLECTION => Some(ClientsSynchronizer::STORAGE_VERSION),
            TabsSynchronizer::COLLECTION => Some(TabsSynchronizer::STORAGE_VERSION),
            HistorySynchronizer::COLLECTION => Some(HistorySynchronizer::STORAGE_VERSION),
            other => self.engine(other).map(|e| e.storage_version()),
        }
    }

    async fn sync_requested(&self, wanted: Vec<String>, why: SyncReason) -> SyncResults {
        let (joined, registration) = self.in_flight.join_or_register(&wanted);

        let mut results = SyncResults::new();
        if let Some(registration) = registration {
            let own = self.run_attempt(&registration.collections, why).await;
            registration.complete(&own);
            results.extend(own);
        }
        for attempt in joined {
            results.extend(attempt.results().await);
        }

        results.sort_by_key(|(c, _)| wanted.iter().position(|w| w == c));
        results
    }

    async fn run_attempt(&self, collections: &[String], why: SyncReason) -> SyncResults {
        let _lock = self.sync_lock.lock().await;
        log::info!("Starting sync ({}) of {:?}", why, collections);

        if let Err(e) = self.apply_local_resets() {
            log::error!("Failed to apply local resets: {:#}", e);
        }

        self.phase.send_replace(SyncPhase::Authenticating);
        let results = match self.prepare().await {
            Ok(scratchpad) => {
                self.phase.send_replace(SyncPhase::Ready);
                if let Err(e) = self.update_engine_prefs(&scratchpad) {
                    log::warn!("Failed to update engine prefs: {:#}", e);
                }
                self.dispatch(scratchpad, collections, why).await
            }
            Err(reason) => {
                log::info!("Sync not started: {}", reason);
                collections
                    .iter()
                    .map(|c| (c.clone(), SyncStatus::NotStarted(reason.clone())))
                    .collect()
            }
        };

        self.phase.send_replace(final_phase(&results));
        self.renew_green_light_if_red();
        results
    }

    async fn prepare(&self) -> std::result::Result<Scratchpad, NotStartedReason> {
        if let Some(remaining_seconds) = backoff_remaining(&self.prefs) {
            return Err(NotStartedReason::Backoff { remaining_seconds });
        }
        if !self.online.load(Ordering::SeqCst) {
            return Err(NotStartedReason::Offline);
        }
        let green_light = self.green_light.lock().unwrap().clone();
        if green_light.is_cancelled() {
            return Err(NotStartedReason::RedLight);
        }

        let (token, keys) = self
            .credentials()
            .await
            .map_err(|e| self.credentials_not_started(&e))?;
        let server = self.account.storage_client(&token);
        let info = server.info_collections().await.map_err(|e| self.not_started(&e))?;
        let meta = server.meta_global().await.map_err(|e| self.not_started(&e))?;

        self.check_node_assignment(&token).map_err(|e| self.not_started(&e))?;
        let client_guid = local_client_guid(&self.prefs).map_err(|e| self.not_started(&e))?;

        Ok(Scratchpad {
            keys,
            server,
            info,
            meta,
            token,
            client_guid,
            client_name: self.config.client_name.clone(),
            client_type: self.config.client_type.clone(),
            config: self.config.clone(),
            green_light,
        })
    }

    async fn credentials(&self) -> Result<(TokenServerToken, Keys)> {
        self.account.ready().await.context("Account not ready")?;
        let token = self
            .account
            .storage_token()
            .await
            .context("Failed to get storage token")?;
        let keys = self
            .account
            .decryption_keys(SYNC_KEY_SCOPE)
            .await
            .context("Failed to get sync keys")?;
        Ok((token, keys))
    }

    fn not_started(&self, err: &anyhow::Error) -> NotStartedReason {
        self.note_start_failure(err);
        NotStartedReason::from_error(err)
    }

    fn credentials_not_started(&self, err: &anyhow::Error) -> NotStartedReason {
        self.note_start_failure(err);
        NotStartedReason::from_credentials_error(err)
    }

    fn note_start_failure(&self, err: &anyhow::Error) {
        log::warn!("Sync cannot start: {:#}", err);
        if let Some(ServerError::Backoff { remaining_seconds }) = server_error(err) {
            if let Err(e) = record_backoff(&self.prefs, *remaining_seconds) {
                log::warn!("Failed to persist backoff: {:#}", e);
            }
        }
    }

    /// Reset everything when the account moved to another storage node
    fn check_node_assignment(&self, token: &TokenServerToken) -> Result<()> {
        let uid = self.prefs.u64(TOKEN_UID_PREF);
        let endpoint = self.prefs.string(TOKEN_ENDPOINT_PREF);

        if let (Some(uid), Some(endpoint)) = (uid, endpoint) {
            if uid != token.uid || endpoint != token.api_endpoint {
                log::info!("Storage node changed to {}, resetting all collections", token.api_endpoint);
                self.reset_locally(&self.collections())?;
            }
        }

        self.prefs.set_u64(TOKEN_UID_PREF, token.uid)?;
        self.prefs.set_string(TOKEN_ENDPOINT_PREF, &token.api_endpoint)
    }

    fn update_engine_prefs(&self, scratchpad: &Scratchpad) -> Result<()> {
        let declined = scratchpad
            .meta
            .as_ref()
            .map(|m| m.declined.clone())
            .unwrap_or_default();
        let enabled: Vec<String> = self
            .collections()
            .into_iter()
            .filter(|c| self.is_enabled(c) && !declined.contains(c))
            .collect();

        self.prefs.set_string_list(ENABLED_ENGINES_PREF, &enabled)?;
        self.prefs.set_string_list(DECLINED_ENGINES_PREF, &declined)
    }

    async fn dispatch(&self, scratchpad: Scratchpad, collections: &[String], why: SyncReason) -> SyncResults {
        let operation = OperationStatsSession::start(why.as_str());
        self.phase.send_replace(SyncPhase::Syncing);

        let mut scratchpad = Arc::new(scratchpad);
        let mut red_light = false;
        let mut results = SyncResults::new();

        for collection in collections {
            let status = if red_light {
                SyncStatus::NotStarted(NotStartedReason::RedLight)
            } else {
                match self.check_engine(&scratchpad, collection) {
                    Some(reason) => SyncStatus::NotStarted(reason),
                    None => self.sync_one(&scratchpad, collection, why).await,
                }
            };
            log::info!("{}: {}", collection, status);
            results.push((collection.clone(), status));

            if !red_light && scratchpad.green_light.is_cancelled() {
                if self.config.continue_after_interrupt {
                    let green_light = self.renew_green_light_if_red();
                    scratchpad = Arc::new(Scratchpad {
                        green_light,
                        ..(*scratchpad).clone()
                    });
                } else {
                    red_light = true;
                }
            }
        }

        let stats = operation.end();
        log::info!("Sync ({}) took {}ms", stats.why, stats.took_ms);
        *self.last_operation.lock().unwrap() = Some(stats);
        results
    }

    /// Why `collection` cannot be synced against this server, if it cannot
    fn check_engine(&self, scratchpad: &Scratchpad, collection: &str) -> Option<NotStartedReason> {
        if let Some(meta) = &scratchpad.meta {
            if meta.storage_version < STORAGE_VERSION {
                return Some(NotStartedReason::StorageFormatOutdated { needs: STORAGE_VERSION });
            }
            if meta.storage_version > STORAGE_VERSION {
                return Some(NotStartedReason::StorageFormatTooNew { expected: STORAGE_VERSION });
            }
            if meta.is_declined(collection) {
                return Some(NotStartedReason::EngineRemotelyNotEnabled {
                    collection: collection.to_string(),
                });
            }
            if let (Some(remote), Some(local)) = (meta.engines.get(collection), self.local_storage_version(collection)) {
                if remote.version > local {
                    return Some(NotStartedReason::EngineFormatTooNew { expected: local });
                }
                if remote.version < local {
                    return Some(NotStartedReason::EngineFormatOutdated { needs: local });
                }
            }
        }

        if scratchpad.keys_for(collection).is_none() {
            return Some(NotStartedReason::StateMachineNotReady);
        }
        None
    }

    async fn sync_one(&self, scratchpad: &Arc<Scratchpad>, collection: &str, why: SyncReason) -> SyncStatus {
        let result = match collection {
            ClientsSynchronizer::COLLECTION => {
                ClientsSynchronizer::new(Arc::clone(scratchpad), &self.prefs, why)
                    .synchronize_local_clients(self.clients_and_tabs.as_ref(), self.delegate.as_ref())
                    .await
            }
            TabsSynchronizer::COLLECTION => {
                TabsSynchronizer::new(Arc::clone(scratchpad), &self.prefs, why)
                    .synchronize_local_tabs(self.clients_and_tabs.as_ref())
                    .await
            }
            HistorySynchronizer::COLLECTION => {
                HistorySynchronizer::new(Arc::clone(scratchpad), &self.prefs, why)
                    .synchronize_local_history(self.history.as_ref())
                    .await
            }
            other => match self.engine(other) {
                Some(engine) => engine.sync(Arc::clone(scratchpad), why).await,
                None => Err(SyncError::UnknownCollection(other.to_string()).into()),
            },
        };

        result.unwrap_or_else(|e| {
            log::error!("{} sync failed: {:#}", collection, e);
            let mut stats = EngineStatsSession::start(collection);
            stats.record_failure(format!("{:#}", e));
            SyncStatus::Partial(stats.end())
        })
    }

    /// Reset collections whose enablement changed or whose database was
    /// recreated since the last attempt
    fn apply_local_resets(&self) -> Result<()> {
        let mut pending = Vec::new();

        for collection in self.collections() {
            let prefs = self.engine_prefs(&collection);
            let enabled = prefs.bool("enabled").unwrap_or(true);
            if prefs.bool("lastSyncedEnabled").is_some_and(|last| last != enabled) {
                log::info!("{} was {} since the last sync", collection, if enabled { "enabled" } else { "disabled" });
                pending.push(collection.clone());
            }
            prefs.set_bool("lastSyncedEnabled", enabled)?;
        }

        if self.browser_db_reset_pending.swap(false, Ordering::SeqCst) {
            pending.push(HistorySynchronizer::COLLECTION.to_string());
            pending.push(TabsSynchronizer::COLLECTION.to_string());
        }

        self.reset_locally(&pending)
    }

    async fn reset_after_recreation(&self) {
        let _lock = self.sync_lock.lock().await;
        // A sync that ran in the meantime has already handled it
        if !self.browser_db_reset_pending.swap(false, Ordering::SeqCst) {
            return;
        }
        let collections = [
            HistorySynchronizer::COLLECTION.to_string(),
            TabsSynchronizer::COLLECTION.to_string(),
        ];
        if let Err(e) = self.reset_locally(&collections) {
            log::error!("Failed to reset after database recreation: {:#}", e);
        }
    }

    /// Reset each collection once; a clients reset covers tabs
    fn reset_locally(&self, collections: &[String]) -> Result<()> {
        let resets_clients = collections.iter().any(|c| c == ClientsSynchronizer::COLLECTION);
        let mut done = BTreeSet::new();

        for collection in collections {
            if !done.insert(collection.as_str()) {
                continue;
            }
            if resets_clients && collection == TabsSynchronizer::COLLECTION {
                log::debug!("Tabs reset covered by clients reset");
                continue;
            }
            self.reset_one(collection)?;
        }
        Ok(())
    }

    fn reset_one(&self, collection: &str) -> Result<()> {
        match collection {
            ClientsSynchronizer::COLLECTION => reset_clients_and_tabs(self.clients_and_tabs.as_ref(), &self.prefs),
            TabsSynchronizer::COLLECTION => reset_tabs(self.clients_and_tabs.as_ref(), &self.prefs),
            HistorySynchronizer::COLLECTION => {
                reset_synchronizer(self.history.as_ref(), &self.prefs, HistorySynchronizer::COLLECTION)
            }
            other => match self.engine(other) {
                Some(engine) => engine.reset(),
                None => Err(SyncError::UnknownCollection(other.to_string()).into()),
            },
        }
    }

    /// The current green light, replaced first if it was turned red
    fn renew_green_light_if_red(&self) -> CancellationToken {
        let mut green_light = self.green_light.lock().unwrap();
        if green_light.is_cancelled() {
            *green_light = CancellationToken::new();
        }
        green_light.clone()
    }
}

fn final_phase(results: &SyncResults) -> SyncPhase {
    let not_started = |s: &SyncStatus| matches!(s, SyncStatus::NotStarted(_));

    if results.iter().all(|(_, s)| s.is_completed()) {
        SyncPhase::Completed
    } else if results
        .iter()
        .any(|(_, s)| matches!(s, SyncStatus::NotStarted(NotStartedReason::NoAccount)))
    {
        SyncPhase::NoAccount
    } else if results.iter().all(|(_, s)| not_started(s)) {
        SyncPhase::NotStarted
    } else {
        SyncPhase::Partial
    }
}
