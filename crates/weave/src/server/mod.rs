//! Remote storage and account interfaces
//!
//! The sync engine never talks HTTP itself. It sees the storage service
//! through [`SyncServer`] and the signed-in account through
//! [`AccountSession`], both implemented by the embedding application.
//! Failures are reported as [`ServerError`](crate::ServerError) and
//! [`AccountError`](crate::AccountError) inside `anyhow::Error`.

mod memory;

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

use crate::models::{Guid, InfoCollections, Keys, MetaGlobal, Record, Timestamp, TokenServerToken};

pub use memory::{InMemorySyncServer, StaticAccountSession};

/// Key scope of the sync encryption keys
pub const SYNC_KEY_SCOPE: &str = "https://identity.mozilla.com/apps/oldsync";

/// One page request against a collection
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchRequest {
    /// Only records modified strictly after this time
    pub since: Timestamp,
    /// Maximum records in the page
    pub limit: usize,
    /// Continuation cursor from a previous page
    pub offset: Option<String>,
}

impl FetchRequest {
    pub fn new(since: Timestamp, limit: usize) -> Self {
        Self {
            since,
            limit,
            offset: None,
        }
    }

    pub fn with_offset(mut self, offset: Option<String>) -> Self {
        self.offset = offset;
        self
    }
}

/// One page of records, oldest first
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FetchResponse {
    pub records: Vec<Record<Value>>,
    /// Cursor for the next page, `None` when the query is exhausted
    pub next_offset: Option<String>,
    /// Collection last-modified time when the page was served
    pub last_modified: Timestamp,
}

/// Outcome of a batch upload
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UploadResult {
    /// Server time assigned to the uploaded records
    pub modified: Timestamp,
    pub succeeded: Vec<Guid>,
    pub failed: Vec<Guid>,
}

/// Record storage service for one account
#[async_trait]
pub trait SyncServer: Send + Sync {
    /// Last-modified time of every collection
    async fn info_collections(&self) -> Result<InfoCollections>;

    /// The meta/global record, `None` if the account has none yet
    async fn meta_global(&self) -> Result<Option<MetaGlobal>>;

    /// Records newer than `request.since`, in increasing modified order
    async fn fetch_records(&self, collection: &str, request: &FetchRequest) -> Result<FetchResponse>;

    /// Store records, replacing any with the same id
    async fn upload_records(&self, collection: &str, records: Vec<Record<Value>>) -> Result<UploadResult>;
}

/// The signed-in account, as far as sync is concerned
#[async_trait]
pub trait AccountSession: Send + Sync {
    /// Resolves once the account is usable
    async fn ready(&self) -> Result<()>;

    /// Credentials for the storage node
    async fn storage_token(&self) -> Result<TokenServerToken>;

    /// Encryption keys for `scope`
    async fn decryption_keys(&self, scope: &str) -> Result<Keys>;

    /// A storage client authorized by `token`
    fn storage_client(&self, token: &TokenServerToken) -> Arc<dyn SyncServer>;
}
