//! In-memory storage implementations
//!
//! Used in tests and by embedders that do not need persistence. Each store
//! keeps all of its state behind a single lock so every operation is atomic.

use std::collections::{BTreeMap, HashSet};
use std::sync::RwLock;

use anyhow::{Result, anyhow};

use super::traits::{
    BrowserHistory, MAX_VISITS_PER_RECORD, RemoteClientsAndTabs, ResettableSyncStorage,
    SyncableHistory, VisitStatsSource,
};
use crate::error::SyncError;
use crate::frecency::{SearchQuery, SiteStats};
use crate::models::{
    Guid, MicrosecondTimestamp, Place, RemoteClient, RemoteTab, Site, SiteVisit, Timestamp, Visit,
    VisitType, is_ignored_url, normalized_host, now_millis,
};

struct PlaceRow {
    id: i64,
    guid: Guid,
    /// `None` once deleted
    url: Option<String>,
    title: String,
    domain: Option<String>,
    server_modified: Option<Timestamp>,
    local_modified: Option<Timestamp>,
    is_deleted: bool,
    should_upload: bool,
}

impl PlaceRow {
    fn to_site(&self) -> Site {
        Site {
            id: Some(self.id),
            url: self.url.clone().unwrap_or_default(),
            title: self.title.clone(),
            guid: Some(self.guid.clone()),
        }
    }

    fn mark_deleted(&mut self, should_upload: bool, modified: Timestamp) {
        self.url = None;
        self.title.clear();
        self.is_deleted = true;
        self.should_upload = should_upload;
        if should_upload {
            self.local_modified = Some(modified);
        } else {
            self.server_modified = Some(modified);
        }
    }
}

struct VisitRow {
    site_id: i64,
    date: MicrosecondTimestamp,
    visit_type: VisitType,
    is_local: bool,
}

struct PinnedRow {
    site: Site,
    domain: String,
    pinned_at: (Timestamp, u64),
}

#[derive(Default)]
struct HistoryInner {
    places: BTreeMap<i64, PlaceRow>,
    visits: Vec<VisitRow>,
    hidden_domains: HashSet<String>,
    pinned: Vec<PinnedRow>,
    next_id: i64,
    pin_seq: u64,
    downloads_applied: usize,
}

impl HistoryInner {
    fn id_by_guid(&self, guid: &Guid) -> Option<i64> {
        self.places.values().find(|p| &p.guid == guid).map(|p| p.id)
    }

    fn id_by_url(&self, url: &str) -> Option<i64> {
        self.places
            .values()
            .find(|p| p.url.as_deref() == Some(url))
            .map(|p| p.id)
    }

    fn row(&mut self, id: i64) -> Result<&mut PlaceRow> {
        self.places
            .get_mut(&id)
            .ok_or_else(|| SyncError::Fatal(format!("History row {} vanished", id)).into())
    }

    fn insert_place(&mut self, guid: Guid, url: &str, title: &str) -> i64 {
        self.next_id += 1;
        let id = self.next_id;
        self.places.insert(
            id,
            PlaceRow {
                id,
                guid,
                url: Some(url.to_string()),
                title: title.to_string(),
                domain: normalized_host(url),
                server_modified: None,
                local_modified: None,
                is_deleted: false,
                should_upload: false,
            },
        );
        id
    }

    fn add_visit(&mut self, site_id: i64, date: MicrosecondTimestamp, visit_type: VisitType, is_local: bool) {
        let exists = self
            .visits
            .iter()
            .any(|v| v.site_id == site_id && v.date == date && v.visit_type == visit_type);
        if !exists {
            self.visits.push(VisitRow {
                site_id,
                date,
                visit_type,
                is_local,
            });
        }
    }

    fn last_visit(&self, site_id: i64) -> Option<MicrosecondTimestamp> {
        self.visits
            .iter()
            .filter(|v| v.site_id == site_id)
            .map(|v| v.date)
            .max()
    }
}

/// In-memory history store
#[derive(Default)]
pub struct InMemoryHistory {
    inner: RwLock<HistoryInner>,
}

impl InMemoryHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of completed downloads applied, for tests
    pub fn downloads_applied(&self) -> usize {
        self.inner.read().unwrap().downloads_applied
    }

    /// Look up a live place by URL
    pub fn place_for_url(&self, url: &str) -> Option<Place> {
        let inner = self.inner.read().unwrap();
        inner
            .places
            .values()
            .find(|p| p.url.as_deref() == Some(url))
            .map(|p| Place::new(p.guid.clone(), url, p.title.clone()))
    }

    /// All visits of the place with `guid`, oldest first
    pub fn visits_for_guid(&self, guid: &Guid) -> Vec<Visit> {
        let inner = self.inner.read().unwrap();
        let Some(place) = inner.places.values().find(|p| &p.guid == guid) else {
            return Vec::new();
        };
        let mut visits: Vec<Visit> = inner
            .visits
            .iter()
            .filter(|v| v.site_id == place.id)
            .map(|v| Visit::new(v.date, v.visit_type))
            .collect();
        visits.sort_by_key(|v| v.date);
        visits
    }
}

impl ResettableSyncStorage for InMemoryHistory {
    fn reset_client(&self) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        for place in inner.places.values_mut() {
            place.should_upload = true;
            place.server_modified = None;
        }
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        self.clear_history()
    }
}

impl SyncableHistory for InMemoryHistory {
    fn insert_or_update_place(&self, place: &Place, modified: Timestamp) -> Result<Guid> {
        let mut inner = self.inner.write().unwrap();

        let id = match (inner.id_by_guid(&place.guid), inner.id_by_url(&place.url)) {
            (Some(id), Some(other)) if id != other => {
                return Err(anyhow!("URL {} already belongs to another place", place.url));
            }
            (Some(id), _) | (None, Some(id)) => id,
            (None, None) => inner.insert_place(place.guid.clone(), &place.url, &place.title),
        };

        let row = inner.row(id)?;
        row.guid = place.guid.clone();
        row.url = Some(place.url.clone());
        row.title = place.title.clone();
        row.domain = normalized_host(&place.url);
        row.server_modified = Some(modified);
        row.is_deleted = false;
        Ok(row.guid.clone())
    }

    fn store_remote_visits(&self, visits: &[Visit], guid: &Guid) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        let site_id = inner
            .id_by_guid(guid)
            .ok_or_else(|| anyhow!("No place with GUID {}", guid))?;

        for visit in visits {
            inner.add_visit(site_id, visit.date, visit.visit_type, false);
        }
        Ok(())
    }

    fn delete_by_guid(&self, guid: &Guid, deleted_at: Timestamp) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        let Some(site_id) = inner.id_by_guid(guid) else {
            return Ok(());
        };
        inner.row(site_id)?.mark_deleted(false, deleted_at);
        inner.visits.retain(|v| v.site_id != site_id);
        Ok(())
    }

    fn done_applying_records_after_download(&self) -> Result<()> {
        self.inner.write().unwrap().downloads_applied += 1;
        Ok(())
    }

    fn modified_places_to_upload(&self) -> Result<Vec<(Place, Vec<Visit>)>> {
        let inner = self.inner.read().unwrap();
        let places = inner
            .places
            .values()
            .filter(|p| p.should_upload && !p.is_deleted)
            .filter_map(|p| {
                let url = p.url.as_ref()?;
                let mut visits: Vec<Visit> = inner
                    .visits
                    .iter()
                    .filter(|v| v.site_id == p.id)
                    .map(|v| Visit::new(v.date, v.visit_type))
                    .collect();
                visits.sort_by(|a, b| b.date.cmp(&a.date));
                visits.truncate(MAX_VISITS_PER_RECORD);
                Some((Place::new(p.guid.clone(), url.clone(), p.title.clone()), visits))
            })
            .collect();
        Ok(places)
    }

    fn deleted_places_to_upload(&self) -> Result<Vec<Guid>> {
        let inner = self.inner.read().unwrap();
        Ok(inner
            .places
            .values()
            .filter(|p| p.should_upload && p.is_deleted)
            .map(|p| p.guid.clone())
            .collect())
    }

    fn mark_as_synchronized(&self, guids: &[Guid], modified: Timestamp) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        let guids: HashSet<&Guid> = guids.iter().collect();
        inner
            .places
            .retain(|_, p| !(p.is_deleted && guids.contains(&p.guid)));
        for place in inner.places.values_mut() {
            if guids.contains(&place.guid) {
                place.should_upload = false;
                place.server_modified = Some(modified);
            }
        }
        Ok(())
    }

    fn has_synced_history(&self) -> Result<bool> {
        let inner = self.inner.read().unwrap();
        Ok(inner.places.values().any(|p| p.server_modified.is_some()))
    }
}

impl VisitStatsSource for InMemoryHistory {
    fn site_stats(&self, filter: Option<&SearchQuery>) -> Result<Vec<SiteStats>> {
        let inner = self.inner.read().unwrap();
        let mut stats = Vec::new();

        for place in inner.places.values().filter(|p| !p.is_deleted) {
            let Some(url) = place.url.as_deref() else {
                continue;
            };
            if filter.is_some_and(|q| !q.matches(&place.title, url)) {
                continue;
            }

            let mut entry = SiteStats {
                history_id: place.id,
                url: url.to_string(),
                title: place.title.clone(),
                guid: Some(place.guid.clone()),
                domain: place.domain.clone(),
                show_on_top_sites: place
                    .domain
                    .as_ref()
                    .is_some_and(|d| !inner.hidden_domains.contains(d)),
                ..Default::default()
            };

            for visit in inner.visits.iter().filter(|v| v.site_id == place.id) {
                if visit.is_local {
                    entry.local_visit_count += 1;
                    entry.local_visit_date = entry.local_visit_date.max(visit.date);
                } else {
                    entry.remote_visit_count += 1;
                    entry.remote_visit_date = entry.remote_visit_date.max(visit.date);
                }
            }

            if entry.local_visit_count + entry.remote_visit_count > 0 {
                stats.push(entry);
            }
        }

        Ok(stats)
    }
}

impl BrowserHistory for InMemoryHistory {
    fn add_local_visit(&self, visit: &SiteVisit) -> Result<()> {
        let url = visit.site.url.as_str();
        if is_ignored_url(url) {
            return Err(SyncError::IgnoredSite.into());
        }
        if normalized_host(url).is_none() {
            return Err(SyncError::Fatal(format!("Unable to update or insert site {}", url)).into());
        }

        let mut inner = self.inner.write().unwrap();
        let now = now_millis();
        let site_id = match inner.id_by_url(url) {
            Some(id) => id,
            None => {
                let guid = visit.site.guid.clone().unwrap_or_else(Guid::random);
                inner.insert_place(guid, url, &visit.site.title)
            }
        };
        let row = inner.row(site_id)?;
        row.title = visit.site.title.clone();
        row.local_modified = Some(now);
        row.should_upload = true;

        inner.add_visit(site_id, visit.date, visit.visit_type, true);
        Ok(())
    }

    fn clear_history(&self) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        inner.places.clear();
        inner.visits.clear();
        inner.hidden_domains.clear();
        Ok(())
    }

    fn remove_history_for_url(&self, url: &str) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        let Some(site_id) = inner.id_by_url(url) else {
            return Ok(());
        };
        inner.row(site_id)?.mark_deleted(true, now_millis());
        inner.visits.retain(|v| v.site_id != site_id);
        Ok(())
    }

    fn remove_history_from_date(&self, date: MicrosecondTimestamp) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        let doomed: HashSet<i64> = inner
            .visits
            .iter()
            .filter(|v| v.date > date)
            .map(|v| v.site_id)
            .collect();

        let now = now_millis();
        for id in &doomed {
            if let Some(row) = inner.places.get_mut(id) {
                row.mark_deleted(true, now);
            }
        }
        inner.visits.retain(|v| !doomed.contains(&v.site_id));
        Ok(())
    }

    fn remove_host_from_top_sites(&self, host: &str) -> Result<()> {
        self.inner
            .write()
            .unwrap()
            .hidden_domains
            .insert(host.to_string());
        Ok(())
    }

    fn get_sites_by_last_visit(&self, limit: usize, offset: usize) -> Result<Vec<Site>> {
        let inner = self.inner.read().unwrap();
        let mut sites: Vec<(MicrosecondTimestamp, Site)> = inner
            .places
            .values()
            .filter(|p| !p.is_deleted)
            .filter_map(|p| Some((inner.last_visit(p.id)?, p.to_site())))
            .collect();
        sites.sort_by(|a, b| b.0.cmp(&a.0));
        Ok(sites
            .into_iter()
            .skip(offset)
            .take(limit)
            .map(|(_, s)| s)
            .collect())
    }

    fn add_pinned_top_site(&self, site: &Site) -> Result<()> {
        let domain = normalized_host(&site.url)
            .filter(|_| site.guid.is_some())
            .ok_or_else(|| anyhow!("Invalid site {}", site.url))?;

        let mut inner = self.inner.write().unwrap();
        inner.hidden_domains.insert(domain.clone());
        inner.pin_seq += 1;
        let pinned_at = (now_millis(), inner.pin_seq);
        inner.pinned.retain(|p| p.site.url != site.url);
        inner.pinned.push(PinnedRow {
            site: site.clone(),
            domain,
            pinned_at,
        });
        Ok(())
    }

    fn remove_from_pinned_top_sites(&self, site: &Site) -> Result<()> {
        let domain =
            normalized_host(&site.url).ok_or_else(|| anyhow!("Invalid url for site {}", site.url))?;

        let mut inner = self.inner.write().unwrap();
        inner.pinned.retain(|p| p.domain != domain);
        inner.hidden_domains.remove(&domain);
        Ok(())
    }

    fn get_pinned_top_sites(&self) -> Result<Vec<Site>> {
        let inner = self.inner.read().unwrap();
        let mut pinned: Vec<&PinnedRow> = inner.pinned.iter().collect();
        pinned.sort_by(|a, b| b.pinned_at.cmp(&a.pinned_at));
        Ok(pinned.into_iter().map(|p| p.site.clone()).collect())
    }

    fn is_pinned_top_site(&self, url: &str) -> Result<bool> {
        let inner = self.inner.read().unwrap();
        Ok(inner.pinned.iter().any(|p| p.site.url == url))
    }
}

#[derive(Default)]
struct ClientsInner {
    clients: BTreeMap<Guid, RemoteClient>,
    tabs: Vec<RemoteTab>,
}

/// In-memory clients and tabs store
#[derive(Default)]
pub struct InMemoryClientsAndTabs {
    inner: RwLock<ClientsInner>,
}

impl InMemoryClientsAndTabs {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ResettableSyncStorage for InMemoryClientsAndTabs {
    fn reset_client(&self) -> Result<()> {
        self.clear()
    }

    fn clear(&self) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        inner.tabs.retain(|t| t.client_guid.is_none());
        inner.clients.clear();
        Ok(())
    }
}

impl RemoteClientsAndTabs for InMemoryClientsAndTabs {
    fn get_clients(&self) -> Result<Vec<RemoteClient>> {
        Ok(self.inner.read().unwrap().clients.values().cloned().collect())
    }

    fn get_client(&self, guid: &Guid) -> Result<Option<RemoteClient>> {
        Ok(self.inner.read().unwrap().clients.get(guid).cloned())
    }

    fn insert_or_update_client(&self, client: &RemoteClient) -> Result<()> {
        let guid = client
            .guid
            .clone()
            .ok_or_else(|| anyhow!("Remote client without GUID"))?;
        self.inner.write().unwrap().clients.insert(guid, client.clone());
        Ok(())
    }

    fn delete_client(&self, guid: &Guid) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        inner.clients.remove(guid);
        inner.tabs.retain(|t| t.client_guid.as_ref() != Some(guid));
        Ok(())
    }

    fn insert_or_update_tabs_for_client(
        &self,
        client_guid: Option<&Guid>,
        tabs: &[RemoteTab],
    ) -> Result<usize> {
        let mut inner = self.inner.write().unwrap();
        inner.tabs.retain(|t| t.client_guid.as_ref() != client_guid);
        inner.tabs.extend(
            tabs.iter()
                .map(|t| t.clone().with_client_guid(client_guid.cloned())),
        );
        Ok(tabs.len())
    }

    fn get_tabs_for_client(&self, client_guid: Option<&Guid>) -> Result<Vec<RemoteTab>> {
        let inner = self.inner.read().unwrap();
        Ok(inner
            .tabs
            .iter()
            .filter(|t| t.client_guid.as_ref() == client_guid)
            .cloned()
            .collect())
    }

    fn wipe_remote_tabs(&self) -> Result<()> {
        self.inner
            .write()
            .unwrap()
            .tabs
            .retain(|t| t.client_guid.is_none());
        Ok(())
    }

    fn wipe_tabs(&self) -> Result<()> {
        self.inner.write().unwrap().tabs.clear();
        Ok(())
    }
}
