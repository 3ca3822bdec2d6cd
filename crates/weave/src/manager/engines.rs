//! Collections synced by components outside this crate

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use crate::scratchpad::Scratchpad;
use crate::synchronizers::{SyncReason, SyncStatus};

/// A collection whose synchronizer lives elsewhere, e.g. bookmarks or passwords
///
/// The manager runs readiness and meta/global checks for it like for any
/// built-in collection, then hands over the scratchpad.
#[async_trait]
pub trait ExternalEngine: Send + Sync {
    /// Collection name on the server
    fn collection(&self) -> &str;

    /// Engine format version this client writes
    fn storage_version(&self) -> u32;

    async fn sync(&self, scratchpad: Arc<Scratchpad>, why: SyncReason) -> Result<SyncStatus>;

    /// Drop sync metadata so the next sync starts from scratch
    fn reset(&self) -> Result<()>;

    fn has_synced(&self) -> Result<bool>;
}
