//! SQLite-backed history storage

use std::sync::{Arc, Mutex};

use anyhow::{Result, anyhow, bail};
use rusqlite::{Connection, OptionalExtension, params};

use super::sqlite::BrowserDb;
use super::traits::{
    BrowserHistory, MAX_VISITS_PER_RECORD, ResettableSyncStorage, SyncableHistory, VisitStatsSource,
};
use crate::error::SyncError;
use crate::frecency::{SearchQuery, SiteStats};
use crate::models::{
    Guid, MicrosecondTimestamp, Place, Site, SiteVisit, Timestamp, Visit, VisitType, is_ignored_url,
    normalized_host, now_millis,
};

/// History stored in the browser database
pub struct SqliteHistory {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteHistory {
    pub fn new(db: &BrowserDb) -> Self {
        Self {
            conn: db.connection(),
        }
    }

    fn visits_for_site(conn: &Connection, site_id: i64, limit: usize) -> Result<Vec<Visit>> {
        let mut stmt = conn.prepare(
            "SELECT date, type FROM visits WHERE siteID = ? ORDER BY date DESC LIMIT ?",
        )?;

        let visits = stmt
            .query_map(params![site_id, limit as i64], |row| {
                let date: i64 = row.get(0)?;
                let visit_type: u8 = row.get(1)?;
                Ok(Visit::new(date as MicrosecondTimestamp, VisitType::from(visit_type)))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(visits)
    }

    fn site_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Site> {
        let guid: String = row.get(3)?;
        Ok(Site {
            id: Some(row.get(0)?),
            url: row.get(1)?,
            title: row.get(2)?,
            guid: Some(Guid::new(guid)),
        })
    }
}

impl ResettableSyncStorage for SqliteHistory {
    fn reset_client(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute("UPDATE history SET should_upload = 1, server_modified = NULL", [])?;
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        self.clear_history()
    }
}

impl SyncableHistory for SqliteHistory {
    fn insert_or_update_place(&self, place: &Place, modified: Timestamp) -> Result<Guid> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        let by_guid: Option<i64> = tx
            .query_row("SELECT id FROM history WHERE guid = ?", [place.guid.as_str()], |row| row.get(0))
            .optional()?;
        let by_url: Option<i64> = tx
            .query_row("SELECT id FROM history WHERE url = ?", [&place.url], |row| row.get(0))
            .optional()?;

        let host = normalized_host(&place.url);
        if let Some(host) = &host {
            tx.execute("INSERT OR IGNORE INTO domains (domain) VALUES (?)", [host])?;
        }

        match (by_guid, by_url) {
            (Some(id), Some(other)) if id != other => {
                bail!("URL {} already belongs to another place", place.url);
            }
            (Some(id), _) | (None, Some(id)) => {
                tx.execute(
                    "UPDATE history SET guid = ?, url = ?, title = ?, server_modified = ?,
                        is_deleted = 0, domain_id = (SELECT id FROM domains WHERE domain = ?)
                     WHERE id = ?",
                    params![place.guid.as_str(), place.url, place.title, modified as i64, host, id],
                )?;
            }
            (None, None) => {
                let inserted = tx.execute(
                    "INSERT INTO history
                        (guid, url, title, server_modified, is_deleted, should_upload, domain_id)
                     VALUES (?, ?, ?, ?, 0, 0, (SELECT id FROM domains WHERE domain = ?))",
                    params![place.guid.as_str(), place.url, place.title, modified as i64, host],
                )?;
                if inserted != 1 {
                    return Err(SyncError::Fatal(format!("Inserting place {} changed no rows", place.guid)).into());
                }
            }
        }

        tx.commit()?;
        Ok(place.guid.clone())
    }

    fn store_remote_visits(&self, visits: &[Visit], guid: &Guid) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        let site_id: i64 = tx
            .query_row("SELECT id FROM history WHERE guid = ?", [guid.as_str()], |row| row.get(0))
            .optional()?
            .ok_or_else(|| anyhow!("No place with GUID {}", guid))?;

        {
            let mut stmt = tx.prepare(
                "INSERT OR IGNORE INTO visits (siteID, date, type, is_local) VALUES (?, ?, ?, 0)",
            )?;
            for visit in visits {
                stmt.execute(params![site_id, visit.date as i64, u8::from(visit.visit_type)])?;
            }
        }

        tx.commit()?;
        Ok(())
    }

    fn delete_by_guid(&self, guid: &Guid, deleted_at: Timestamp) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        tx.execute(
            "DELETE FROM visits WHERE siteID = (SELECT id FROM history WHERE guid = ?)",
            [guid.as_str()],
        )?;
        tx.execute(
            "UPDATE history SET url = NULL, title = '', is_deleted = 1, should_upload = 0,
                server_modified = ?
             WHERE guid = ?",
            params![deleted_at as i64, guid.as_str()],
        )?;

        tx.commit()?;
        Ok(())
    }

    fn done_applying_records_after_download(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let pruned = conn.execute(
            "DELETE FROM domains WHERE showOnTopSites = 1 AND id NOT IN
                (SELECT domain_id FROM history WHERE domain_id IS NOT NULL)",
            [],
        )?;
        log::debug!("Pruned {} unused domains after download", pruned);
        Ok(())
    }

    fn modified_places_to_upload(&self) -> Result<Vec<(Place, Vec<Visit>)>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, guid, url, title FROM history
             WHERE should_upload = 1 AND is_deleted = 0 AND url IS NOT NULL",
        )?;

        let rows = stmt
            .query_map([], |row| {
                let id: i64 = row.get(0)?;
                let guid: String = row.get(1)?;
                let url: String = row.get(2)?;
                let title: String = row.get(3)?;
                Ok((id, Place::new(Guid::new(guid), url, title)))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(id, place)| {
                let visits = Self::visits_for_site(&conn, id, MAX_VISITS_PER_RECORD)?;
                Ok((place, visits))
            })
            .collect()
    }

    fn deleted_places_to_upload(&self) -> Result<Vec<Guid>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt =
            conn.prepare("SELECT guid FROM history WHERE should_upload = 1 AND is_deleted = 1")?;

        let guids = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .map(|r| r.map(Guid::new))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(guids)
    }

    fn mark_as_synchronized(&self, guids: &[Guid], modified: Timestamp) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        {
            let mut purge = tx.prepare("DELETE FROM history WHERE guid = ? AND is_deleted = 1")?;
            let mut mark = tx.prepare(
                "UPDATE history SET should_upload = 0, server_modified = ? WHERE guid = ?",
            )?;
            for guid in guids {
                purge.execute([guid.as_str()])?;
                mark.execute(params![modified as i64, guid.as_str()])?;
            }
        }

        tx.commit()?;
        Ok(())
    }

    fn has_synced_history(&self) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let synced: bool = conn.query_row(
            "SELECT EXISTS (SELECT 1 FROM history WHERE server_modified IS NOT NULL)",
            [],
            |row| row.get(0),
        )?;
        Ok(synced)
    }
}

impl VisitStatsSource for SqliteHistory {
    fn site_stats(&self, filter: Option<&SearchQuery>) -> Result<Vec<SiteStats>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT history.id, history.url, history.title, history.guid, history.domain_id,
                domains.domain, coalesce(domains.showOnTopSites, 0),
                coalesce(max(CASE visits.is_local WHEN 1 THEN visits.date ELSE 0 END), 0),
                coalesce(max(CASE visits.is_local WHEN 0 THEN visits.date ELSE 0 END), 0),
                coalesce(sum(visits.is_local), 0),
                coalesce(sum(CASE visits.is_local WHEN 1 THEN 0 ELSE 1 END), 0)
             FROM history
                INNER JOIN visits ON visits.siteID = history.id
                LEFT OUTER JOIN domains ON domains.id = history.domain_id
             WHERE history.is_deleted = 0 AND history.url IS NOT NULL
             GROUP BY history.id",
        )?;

        let stats = stmt
            .query_map([], |row| {
                let guid: String = row.get(3)?;
                let local_date: i64 = row.get(7)?;
                let remote_date: i64 = row.get(8)?;
                let local_count: i64 = row.get(9)?;
                let remote_count: i64 = row.get(10)?;
                Ok(SiteStats {
                    history_id: row.get(0)?,
                    url: row.get(1)?,
                    title: row.get(2)?,
                    guid: Some(Guid::new(guid)),
                    domain_id: row.get(4)?,
                    domain: row.get(5)?,
                    show_on_top_sites: row.get(6)?,
                    local_visit_date: local_date.max(0) as MicrosecondTimestamp,
                    remote_visit_date: remote_date.max(0) as MicrosecondTimestamp,
                    local_visit_count: local_count.max(0) as u64,
                    remote_visit_count: remote_count.max(0) as u64,
                    is_bookmarked: false,
                })
            })?
            .filter(|r| match (r, filter) {
                (Ok(s), Some(q)) => q.matches(&s.title, &s.url),
                _ => true,
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(stats)
    }
}

impl BrowserHistory for SqliteHistory {
    fn add_local_visit(&self, visit: &SiteVisit) -> Result<()> {
        let site = &visit.site;
        if is_ignored_url(&site.url) {
            return Err(SyncError::IgnoredSite.into());
        }
        let Some(host) = normalized_host(&site.url) else {
            return Err(SyncError::Fatal(format!("Unable to update or insert site {}", site.url)).into());
        };

        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let now = now_millis() as i64;

        tx.execute("INSERT OR IGNORE INTO domains (domain) VALUES (?)", [&host])?;

        let updated = tx.execute(
            "UPDATE history SET title = ?, local_modified = ?, should_upload = 1,
                domain_id = (SELECT id FROM domains WHERE domain = ?)
             WHERE url = ?",
            params![site.title, now, host, site.url],
        )?;

        if updated == 0 {
            let guid = site.guid.clone().unwrap_or_else(Guid::random);
            let inserted = tx.execute(
                "INSERT INTO history
                    (guid, url, title, local_modified, is_deleted, should_upload, domain_id)
                 SELECT ?, ?, ?, ?, 0, 1, id FROM domains WHERE domain = ?",
                params![guid.as_str(), site.url, site.title, now, host],
            )?;
            if inserted == 0 {
                let err = SyncError::Fatal(format!("Unable to update or insert site {}", site.url));
                log::error!("{}", err);
                return Err(err.into());
            }
        }

        tx.execute(
            "INSERT OR IGNORE INTO visits (siteID, date, type, is_local)
             VALUES ((SELECT id FROM history WHERE url = ?), ?, ?, 1)",
            params![site.url, visit.date as i64, u8::from(visit.visit_type)],
        )?;

        tx.commit()?;
        Ok(())
    }

    fn clear_history(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(
            "DELETE FROM visits;
             DELETE FROM history;
             DELETE FROM domains;",
        )?;
        Ok(())
    }

    fn remove_history_for_url(&self, url: &str) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        tx.execute(
            "DELETE FROM visits WHERE siteID = (SELECT id FROM history WHERE url = ?)",
            [url],
        )?;
        tx.execute(
            "UPDATE history SET url = NULL, is_deleted = 1, title = '', should_upload = 1,
                local_modified = ?
             WHERE url = ?",
            params![now_millis() as i64, url],
        )?;

        tx.commit()?;
        Ok(())
    }

    fn remove_history_from_date(&self, date: MicrosecondTimestamp) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        tx.execute(
            "UPDATE history SET url = NULL, is_deleted = 1, title = '', should_upload = 1,
                local_modified = ?
             WHERE id IN (SELECT siteID FROM visits WHERE date > ?)",
            params![now_millis() as i64, date as i64],
        )?;
        tx.execute(
            "DELETE FROM visits WHERE siteID IN (SELECT id FROM history WHERE is_deleted = 1)",
            [],
        )?;

        tx.commit()?;
        Ok(())
    }

    fn remove_host_from_top_sites(&self, host: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO domains (domain, showOnTopSites) VALUES (?, 0)
             ON CONFLICT(domain) DO UPDATE SET showOnTopSites = 0",
            [host],
        )?;
        Ok(())
    }

    fn get_sites_by_last_visit(&self, limit: usize, offset: usize) -> Result<Vec<Site>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT history.id, history.url, history.title, history.guid, max(visits.date) AS latest
             FROM history INNER JOIN visits ON visits.siteID = history.id
             WHERE history.is_deleted = 0
             GROUP BY history.id
             ORDER BY latest DESC
             LIMIT ? OFFSET ?",
        )?;

        let sites = stmt
            .query_map(params![limit as i64, offset as i64], Self::site_from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(sites)
    }

    fn add_pinned_top_site(&self, site: &Site) -> Result<()> {
        let (Some(guid), Some(host)) = (&site.guid, normalized_host(&site.url)) else {
            bail!("Invalid site {}", site.url);
        };

        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        // Pinned sites are kept out of the frecency-ranked top sites
        tx.execute(
            "INSERT INTO domains (domain, showOnTopSites) VALUES (?, 0)
             ON CONFLICT(domain) DO UPDATE SET showOnTopSites = 0",
            [&host],
        )?;
        tx.execute(
            "INSERT OR REPLACE INTO pinned_top_sites (url, pinDate, title, historyID, guid, domain)
             VALUES (?, ?, ?, ?, ?, ?)",
            params![site.url, now_millis() as i64, site.title, site.id, guid.as_str(), host],
        )?;

        tx.commit()?;
        Ok(())
    }

    fn remove_from_pinned_top_sites(&self, site: &Site) -> Result<()> {
        let host = normalized_host(&site.url)
            .ok_or_else(|| anyhow!("Invalid url for site {}", site.url))?;

        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM pinned_top_sites WHERE domain = ?", [&host])?;
        tx.execute("UPDATE domains SET showOnTopSites = 1 WHERE domain = ?", [&host])?;
        tx.commit()?;
        Ok(())
    }

    fn get_pinned_top_sites(&self) -> Result<Vec<Site>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT historyID, url, title, guid FROM pinned_top_sites
             ORDER BY pinDate DESC, rowid DESC",
        )?;

        let sites = stmt
            .query_map([], |row| {
                let guid: String = row.get(3)?;
                Ok(Site {
                    id: row.get(0)?,
                    url: row.get(1)?,
                    title: row.get(2)?,
                    guid: Some(Guid::new(guid)),
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(sites)
    }

    fn is_pinned_top_site(&self, url: &str) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let pinned: bool = conn.query_row(
            "SELECT EXISTS (SELECT 1 FROM pinned_top_sites WHERE url = ?)",
            [url],
            |row| row.get(0),
        )?;
        Ok(pinned)
    }
}
