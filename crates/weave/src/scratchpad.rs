//! Per-sync context handed to synchronizers
//!
//! Built by the orchestrator once credentials and server metadata are in
//! hand, and dropped when the sync attempt ends.

use std::sync::Arc;

use anyhow::Result;
use tokio_util::sync::CancellationToken;

use crate::config::SyncConfig;
use crate::models::{Guid, InfoCollections, KeyBundle, Keys, MetaGlobal, TokenServerToken};
use crate::prefs::Prefs;
use crate::server::SyncServer;

const LOCAL_CLIENT_GUID_PREF: &str = "clients.localGuid";

/// Everything one sync attempt needs
#[derive(Clone)]
pub struct Scratchpad {
    pub keys: Keys,
    pub server: Arc<dyn SyncServer>,
    pub info: InfoCollections,
    pub meta: Option<MetaGlobal>,
    pub token: TokenServerToken,
    pub client_guid: Guid,
    pub client_name: String,
    pub client_type: String,
    pub config: SyncConfig,
    /// Cancelled when the sync should stop
    pub green_light: CancellationToken,
}

impl Scratchpad {
    /// Key bundle for `collection`, `None` if the keys are unusable
    pub fn keys_for(&self, collection: &str) -> Option<&KeyBundle> {
        let bundle = self.keys.for_collection(collection);
        (!bundle.enc_key.is_empty() && !bundle.hmac_key.is_empty()).then_some(bundle)
    }
}

/// GUID of this device's client record, created on first use
pub fn local_client_guid(prefs: &Prefs) -> Result<Guid> {
    if let Some(guid) = prefs.string(LOCAL_CLIENT_GUID_PREF) {
        return Ok(Guid::new(guid));
    }

    let guid = Guid::random();
    prefs.set_string(LOCAL_CLIENT_GUID_PREF, guid.as_str())?;
    log::info!("Created local client GUID {}", guid);
    Ok(guid)
}
