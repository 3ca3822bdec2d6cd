//! Storage capability traits
//!
//! Each local collection store declares the capabilities it has: history is
//! browsable, syncable and resettable; clients and tabs are resettable.
//! Synchronizers only depend on these traits, never on a backend.

use anyhow::Result;

use crate::frecency::{self, SearchQuery, SiteStats};
use crate::models::{
    ClientAndTabs, Guid, MicrosecondTimestamp, Place, RemoteClient, RemoteTab, Site, SiteVisit,
    Timestamp, Visit, now_micros,
};

/// Most recent visits included in an uploaded history record
pub const MAX_VISITS_PER_RECORD: usize = 20;

/// Storage that can drop its sync metadata and start over
pub trait ResettableSyncStorage: Send + Sync {
    /// Forget what has been synced so the next sync starts from scratch.
    /// Local data is kept and reconciled later.
    fn reset_client(&self) -> Result<()>;

    /// Remove all synced data
    fn clear(&self) -> Result<()>;
}

/// History operations used by the history synchronizer
pub trait SyncableHistory: ResettableSyncStorage {
    /// Apply a downloaded place, returning the GUID it is stored under.
    ///
    /// A place whose URL already exists locally under another GUID adopts the
    /// incoming GUID.
    fn insert_or_update_place(&self, place: &Place, modified: Timestamp) -> Result<Guid>;

    /// Add remote visits to the place with `guid`, skipping ones already known
    fn store_remote_visits(&self, visits: &[Visit], guid: &Guid) -> Result<()>;

    /// Apply a remote deletion
    fn delete_by_guid(&self, guid: &Guid, deleted_at: Timestamp) -> Result<()>;

    /// Hook run after a full download has been applied
    fn done_applying_records_after_download(&self) -> Result<()>;

    /// Places changed locally since the last upload, with their recent visits
    fn modified_places_to_upload(&self) -> Result<Vec<(Place, Vec<Visit>)>>;

    /// GUIDs of places deleted locally since the last upload
    fn deleted_places_to_upload(&self) -> Result<Vec<Guid>>;

    /// Record that the given places were uploaded at `modified`
    fn mark_as_synchronized(&self, guids: &[Guid], modified: Timestamp) -> Result<()>;

    /// Whether any history has been synced with the server
    fn has_synced_history(&self) -> Result<bool>;
}

/// Per-site visit aggregates for frecency ranking
pub trait VisitStatsSource: Send + Sync {
    /// Statistics for every live history entry matching `filter`
    fn site_stats(&self, filter: Option<&SearchQuery>) -> Result<Vec<SiteStats>>;
}

/// History operations used by the browser front end
pub trait BrowserHistory: VisitStatsSource {
    /// Record a local visit, creating or updating its site.
    ///
    /// Fails with [`SyncError::IgnoredSite`](crate::SyncError::IgnoredSite)
    /// for URLs that are never stored.
    fn add_local_visit(&self, visit: &SiteVisit) -> Result<()>;

    fn clear_history(&self) -> Result<()>;

    /// Delete a URL and its visits; the deletion is uploaded on next sync
    fn remove_history_for_url(&self, url: &str) -> Result<()>;

    /// Delete every site visited after `date`
    fn remove_history_from_date(&self, date: MicrosecondTimestamp) -> Result<()>;

    /// Hide a domain from top sites
    fn remove_host_from_top_sites(&self, host: &str) -> Result<()>;

    /// Sites ordered by most recent visit
    fn get_sites_by_last_visit(&self, limit: usize, offset: usize) -> Result<Vec<Site>>;

    fn add_pinned_top_site(&self, site: &Site) -> Result<()>;

    /// Unpin every pinned site of the same host and show it in top sites again
    fn remove_from_pinned_top_sites(&self, site: &Site) -> Result<()>;

    /// Pinned sites, most recently pinned first
    fn get_pinned_top_sites(&self) -> Result<Vec<Site>>;

    fn is_pinned_top_site(&self, url: &str) -> Result<bool>;

    /// Frecency-ranked sites matching a free text query
    fn get_sites(&self, query: &str, limit: usize) -> Result<Vec<Site>> {
        let query = SearchQuery::parse(query);
        let filter = (!query.is_empty()).then_some(&query);
        let stats = self.site_stats(filter)?;
        Ok(frecency::rank_sites(&stats, now_micros(), limit)
            .into_iter()
            .map(|r| r.site)
            .collect())
    }

    /// Frecency-ranked top sites, one per domain
    fn get_top_sites(&self, limit: usize) -> Result<Vec<Site>> {
        let stats = self.site_stats(None)?;
        Ok(frecency::rank_top_sites(&stats, now_micros(), limit)
            .into_iter()
            .map(|r| r.site)
            .collect())
    }
}

/// Storage for remote clients and the tabs open on every device
pub trait RemoteClientsAndTabs: ResettableSyncStorage {
    fn get_clients(&self) -> Result<Vec<RemoteClient>>;

    fn get_client(&self, guid: &Guid) -> Result<Option<RemoteClient>>;

    fn insert_or_update_client(&self, client: &RemoteClient) -> Result<()>;

    /// Delete a client and its tabs
    fn delete_client(&self, guid: &Guid) -> Result<()>;

    /// Replace the local device's tabs. Returns the number stored.
    fn insert_or_update_tabs(&self, tabs: &[RemoteTab]) -> Result<usize> {
        self.insert_or_update_tabs_for_client(None, tabs)
    }

    /// Atomically replace one client's tabs (`None` is the local device)
    fn insert_or_update_tabs_for_client(
        &self,
        client_guid: Option<&Guid>,
        tabs: &[RemoteTab],
    ) -> Result<usize>;

    fn get_tabs_for_client(&self, client_guid: Option<&Guid>) -> Result<Vec<RemoteTab>>;

    /// Every known remote client with its tabs
    fn get_clients_and_tabs(&self) -> Result<Vec<ClientAndTabs>> {
        self.get_clients()?
            .into_iter()
            .map(|client| {
                let tabs = self.get_tabs_for_client(client.guid.as_ref())?;
                Ok(ClientAndTabs { client, tabs })
            })
            .collect()
    }

    /// Delete tabs of all remote clients, keeping local tabs
    fn wipe_remote_tabs(&self) -> Result<()>;

    /// Delete all tabs, local included
    fn wipe_tabs(&self) -> Result<()>;
}

/// Resets only the remote tabs of a clients-and-tabs store, leaving clients
pub struct TabsOnly<'a>(pub &'a dyn RemoteClientsAndTabs);

impl ResettableSyncStorage for TabsOnly<'_> {
    fn reset_client(&self) -> Result<()> {
        self.0.wipe_remote_tabs()
    }

    fn clear(&self) -> Result<()> {
        self.0.wipe_tabs()
    }
}
