//! In-memory storage service and account
//!
//! Used by tests and for running the engine without a network.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{Value, json};

use super::{AccountSession, FetchRequest, FetchResponse, SyncServer, UploadResult};
use crate::error::{AccountError, ServerError};
use crate::models::{
    Guid, InfoCollections, KeyBundle, Keys, MetaGlobal, Record, STORAGE_VERSION, Timestamp,
    TokenServerToken,
};

/// Server clock start for a fresh in-memory server
const EPOCH: Timestamp = 1_600_000_000_000;

type FetchHook = Box<dyn Fn(&str, usize) + Send + Sync>;

#[derive(Default)]
struct ServerInner {
    collections: HashMap<String, BTreeMap<Guid, Record<Value>>>,
    modified: HashMap<String, Timestamp>,
    meta: Option<MetaGlobal>,
    clock: Timestamp,
    fetches: HashMap<String, usize>,
    uploads: HashMap<String, usize>,
    failures: VecDeque<ServerError>,
    fetch_failures: HashMap<String, ServerError>,
}

impl ServerInner {
    fn tick(&mut self) -> Timestamp {
        self.clock += 1;
        self.clock
    }

    fn put(&mut self, collection: &str, record: Record<Value>) {
        let modified = record.modified;
        self.clock = self.clock.max(modified);
        let stamp = self.modified.entry(collection.to_string()).or_default();
        *stamp = (*stamp).max(modified);
        self.collections
            .entry(collection.to_string())
            .or_default()
            .insert(record.id.clone(), record);
    }

    fn take_failure(&mut self) -> Result<()> {
        match self.failures.pop_front() {
            Some(err) => Err(err.into()),
            None => Ok(()),
        }
    }
}

/// A storage service held entirely in memory
pub struct InMemorySyncServer {
    inner: Mutex<ServerInner>,
    latency: Mutex<Option<Duration>>,
    fetch_hook: Mutex<Option<FetchHook>>,
}

impl Default for InMemorySyncServer {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemorySyncServer {
    /// An empty server with a current meta/global
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(ServerInner {
                clock: EPOCH,
                meta: Some(MetaGlobal::new(STORAGE_VERSION)),
                ..Default::default()
            }),
            latency: Mutex::new(None),
            fetch_hook: Mutex::new(None),
        }
    }

    /// Current server time
    pub fn now(&self) -> Timestamp {
        self.inner.lock().unwrap().clock
    }

    /// Store a record as-is, keeping its modified time
    pub fn insert_record(&self, collection: &str, record: Record<Value>) {
        self.inner.lock().unwrap().put(collection, record);
    }

    /// Store a payload at the next server tick
    pub fn insert_payload(&self, collection: &str, id: Guid, payload: Value) -> Timestamp {
        let mut inner = self.inner.lock().unwrap();
        let modified = inner.tick();
        inner.put(collection, Record::new(id, payload, modified));
        modified
    }

    /// Replace a record with a deletion marker
    pub fn delete_record(&self, collection: &str, id: &Guid) -> Timestamp {
        self.insert_payload(collection, id.clone(), json!({"id": id, "deleted": true}))
    }

    pub fn records(&self, collection: &str) -> Vec<Record<Value>> {
        let inner = self.inner.lock().unwrap();
        inner
            .collections
            .get(collection)
            .map(|records| records.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn record(&self, collection: &str, id: &Guid) -> Option<Record<Value>> {
        let inner = self.inner.lock().unwrap();
        inner.collections.get(collection)?.get(id).cloned()
    }

    pub fn set_meta_global(&self, meta: Option<MetaGlobal>) {
        self.inner.lock().unwrap().meta = meta;
    }

    /// Number of page requests served for `collection`
    pub fn fetch_count(&self, collection: &str) -> usize {
        self.inner.lock().unwrap().fetches.get(collection).copied().unwrap_or(0)
    }

    /// Number of upload requests accepted for `collection`
    pub fn upload_count(&self, collection: &str) -> usize {
        self.inner.lock().unwrap().uploads.get(collection).copied().unwrap_or(0)
    }

    /// Fail the next request of any kind
    pub fn fail_next(&self, error: ServerError) {
        self.inner.lock().unwrap().failures.push_back(error);
    }

    /// Fail the next page request for `collection`
    pub fn fail_next_fetch(&self, collection: &str, error: ServerError) {
        self.inner
            .lock()
            .unwrap()
            .fetch_failures
            .insert(collection.to_string(), error);
    }

    /// Delay every request by `latency`
    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.lock().unwrap() = latency;
    }

    /// Run `hook` with the collection and page number before each page is served
    pub fn on_fetch(&self, hook: impl Fn(&str, usize) + Send + Sync + 'static) {
        *self.fetch_hook.lock().unwrap() = Some(Box::new(hook));
    }

    async fn delay(&self) {
        let latency = *self.latency.lock().unwrap();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }
}

#[async_trait]
impl SyncServer for InMemorySyncServer {
    async fn info_collections(&self) -> Result<InfoCollections> {
        self.delay().await;
        let mut inner = self.inner.lock().unwrap();
        inner.take_failure()?;
        Ok(InfoCollections::new(inner.modified.clone()))
    }

    async fn meta_global(&self) -> Result<Option<MetaGlobal>> {
        self.delay().await;
        let mut inner = self.inner.lock().unwrap();
        inner.take_failure()?;
        Ok(inner.meta.clone())
    }

    async fn fetch_records(&self, collection: &str, request: &FetchRequest) -> Result<FetchResponse> {
        self.delay().await;

        let page = {
            let mut inner = self.inner.lock().unwrap();
            inner.take_failure()?;
            if let Some(err) = inner.fetch_failures.remove(collection) {
                return Err(err.into());
            }
            let count = inner.fetches.entry(collection.to_string()).or_default();
            *count += 1;
            *count
        };

        if let Some(hook) = self.fetch_hook.lock().unwrap().as_ref() {
            hook(collection, page);
        }

        let inner = self.inner.lock().unwrap();
        let start = match &request.offset {
            Some(offset) => offset
                .parse::<usize>()
                .map_err(|_| ServerError::Malformed(format!("bad offset {}", offset)))?,
            None => 0,
        };

        let mut matching: Vec<&Record<Value>> = inner
            .collections
            .get(collection)
            .map(|records| records.values().filter(|r| r.modified > request.since).collect())
            .unwrap_or_default();
        matching.sort_by(|a, b| a.modified.cmp(&b.modified).then_with(|| a.id.cmp(&b.id)));

        let end = (start + request.limit).min(matching.len());
        let records = matching
            .get(start..end)
            .unwrap_or_default()
            .iter()
            .map(|r| (*r).clone())
            .collect();
        let next_offset = (end < matching.len()).then(|| end.to_string());

        Ok(FetchResponse {
            records,
            next_offset,
            last_modified: inner.modified.get(collection).copied().unwrap_or(0),
        })
    }

    async fn upload_records(&self, collection: &str, records: Vec<Record<Value>>) -> Result<UploadResult> {
        self.delay().await;
        let mut inner = self.inner.lock().unwrap();
        inner.take_failure()?;

        let modified = inner.tick();
        let succeeded = records.iter().map(|r| r.id.clone()).collect();
        for record in records {
            inner.put(collection, Record { modified, ..record });
        }
        *inner.uploads.entry(collection.to_string()).or_default() += 1;

        Ok(UploadResult {
            modified,
            succeeded,
            failed: Vec::new(),
        })
    }
}

/// Credentials handed out by [`StaticAccountSession`]
#[derive(Debug, Clone)]
struct Credentials {
    token: TokenServerToken,
    keys: Keys,
}

/// An account that always yields the same credentials, or a fixed error
pub struct StaticAccountSession {
    server: Arc<InMemorySyncServer>,
    credentials: Mutex<std::result::Result<Credentials, AccountError>>,
    token_requests: Mutex<usize>,
}

impl StaticAccountSession {
    /// A signed-in account whose storage node is `server`
    pub fn new(server: Arc<InMemorySyncServer>) -> Self {
        Self {
            server,
            credentials: Mutex::new(Ok(Credentials {
                token: Self::default_token(),
                keys: Keys::new(KeyBundle::random()),
            })),
            token_requests: Mutex::new(0),
        }
    }

    /// An account that is not signed in
    pub fn signed_out(server: Arc<InMemorySyncServer>) -> Self {
        let session = Self::new(server);
        session.fail_with(AccountError::NoAccount);
        session
    }

    pub fn default_token() -> TokenServerToken {
        TokenServerToken {
            id: "token-id".to_string(),
            key: "token-key".to_string(),
            api_endpoint: "https://sync-1.example.com/1.5/1".to_string(),
            uid: 1,
            hashed_fxa_uid: "hashed".to_string(),
            duration_in_seconds: 3600,
            remote_timestamp: EPOCH,
        }
    }

    /// Hand out `token` from now on
    pub fn set_token(&self, token: TokenServerToken) {
        let keys = match &*self.credentials.lock().unwrap() {
            Ok(c) => c.keys.clone(),
            Err(_) => Keys::new(KeyBundle::random()),
        };
        *self.credentials.lock().unwrap() = Ok(Credentials { token, keys });
    }

    /// Hand out `keys` from now on
    pub fn set_keys(&self, keys: Keys) {
        let mut credentials = self.credentials.lock().unwrap();
        let token = match &*credentials {
            Ok(c) => c.token.clone(),
            Err(_) => Self::default_token(),
        };
        *credentials = Ok(Credentials { token, keys });
    }

    /// Fail every credential request with `error`
    pub fn fail_with(&self, error: AccountError) {
        *self.credentials.lock().unwrap() = Err(error);
    }

    pub fn token_requests(&self) -> usize {
        *self.token_requests.lock().unwrap()
    }

    fn credentials(&self) -> Result<Credentials> {
        Ok(self.credentials.lock().unwrap().clone()?)
    }
}

#[async_trait]
impl AccountSession for StaticAccountSession {
    async fn ready(&self) -> Result<()> {
        self.credentials().map(|_| ())
    }

    async fn storage_token(&self) -> Result<TokenServerToken> {
        *self.token_requests.lock().unwrap() += 1;
        Ok(self.credentials()?.token)
    }

    async fn decryption_keys(&self, _scope: &str) -> Result<Keys> {
        Ok(self.credentials()?.keys)
    }

    fn storage_client(&self, _token: &TokenServerToken) -> Arc<dyn SyncServer> {
        self.server.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(id: &str) -> Value {
        json!({"id": id})
    }

    #[tokio::test]
    async fn test_fetch_pages_oldest_first() {
        let server = InMemorySyncServer::new();
        for i in (0..5u64).rev() {
            server.insert_record("history", Record::new(Guid::new(format!("r{}", i)), payload("x"), 100 + i));
        }

        let first = server
            .fetch_records("history", &FetchRequest::new(100, 2))
            .await
            .unwrap();
        let ids: Vec<_> = first.records.iter().map(|r| r.modified).collect();
        assert_eq!(ids, vec![101, 102]);
        assert_eq!(first.next_offset.as_deref(), Some("2"));
        assert_eq!(first.last_modified, 104);

        let second = server
            .fetch_records("history", &FetchRequest::new(100, 2).with_offset(first.next_offset))
            .await
            .unwrap();
        assert_eq!(second.records.len(), 2);
        assert_eq!(second.next_offset, None);
        assert_eq!(server.fetch_count("history"), 2);
    }

    #[tokio::test]
    async fn test_upload_stamps_records() {
        let server = InMemorySyncServer::new();
        let before = server.now();
        let result = server
            .upload_records("tabs", vec![Record::new(Guid::new("a"), payload("a"), 0)])
            .await
            .unwrap();

        assert!(result.modified > before);
        assert_eq!(result.succeeded, vec![Guid::new("a")]);
        assert_eq!(server.record("tabs", &Guid::new("a")).unwrap().modified, result.modified);

        let info = server.info_collections().await.unwrap();
        assert_eq!(info.modified("tabs"), Some(result.modified));
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let server = InMemorySyncServer::new();
        server.fail_next(ServerError::Offline);
        let err = server.info_collections().await.unwrap_err();
        assert_eq!(err.downcast_ref::<ServerError>(), Some(&ServerError::Offline));
        assert!(server.info_collections().await.is_ok());

        server.fail_next_fetch("history", ServerError::Unauthorized);
        assert!(server.fetch_records("tabs", &FetchRequest::new(0, 1)).await.is_ok());
        assert!(server.fetch_records("history", &FetchRequest::new(0, 1)).await.is_err());
    }

    #[tokio::test]
    async fn test_static_account() {
        let server = Arc::new(InMemorySyncServer::new());
        let account = StaticAccountSession::new(server.clone());
        assert!(account.ready().await.is_ok());
        assert_eq!(account.storage_token().await.unwrap().uid, 1);
        assert_eq!(account.token_requests(), 1);

        account.fail_with(AccountError::NoAccount);
        let err = account.ready().await.unwrap_err();
        assert_eq!(err.downcast_ref::<AccountError>(), Some(&AccountError::NoAccount));

        let signed_out = StaticAccountSession::signed_out(server);
        assert!(signed_out.decryption_keys("scope").await.is_err());
    }
}
