//! SQLite-backed remote clients and tabs storage

use std::sync::{Arc, Mutex};

use anyhow::{Result, anyhow};
use rusqlite::{Connection, OptionalExtension, params};
use url::Url;

use super::sqlite::BrowserDb;
use super::traits::{RemoteClientsAndTabs, ResettableSyncStorage};
use crate::models::{Guid, RemoteClient, RemoteTab, decode_tab_history, encode_tab_history};

const CLIENT_COLUMNS: &str = "guid, name, modified, type, formfactor, os, version, fxaDeviceId";

/// Clients and tabs stored in the browser database
pub struct SqliteRemoteClientsAndTabs {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteRemoteClientsAndTabs {
    pub fn new(db: &BrowserDb) -> Self {
        Self {
            conn: db.connection(),
        }
    }

    fn client_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RemoteClient> {
        let guid: String = row.get(0)?;
        let modified: i64 = row.get(2)?;
        Ok(RemoteClient {
            guid: Some(Guid::new(guid)),
            name: row.get(1)?,
            modified: modified.max(0) as u64,
            client_type: row.get(3)?,
            form_factor: row.get(4)?,
            os: row.get(5)?,
            version: row.get(6)?,
            fxa_device_id: row.get(7)?,
        })
    }
}

impl ResettableSyncStorage for SqliteRemoteClientsAndTabs {
    fn reset_client(&self) -> Result<()> {
        self.clear()
    }

    /// Remove remote clients and their tabs; local tabs are kept
    fn clear(&self) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM tabs WHERE client_guid IS NOT NULL", [])?;
        tx.execute("DELETE FROM clients", [])?;
        tx.commit()?;
        Ok(())
    }
}

impl RemoteClientsAndTabs for SqliteRemoteClientsAndTabs {
    fn get_clients(&self) -> Result<Vec<RemoteClient>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM clients ORDER BY guid",
            CLIENT_COLUMNS
        ))?;

        let clients = stmt
            .query_map([], Self::client_from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(clients)
    }

    fn get_client(&self, guid: &Guid) -> Result<Option<RemoteClient>> {
        let conn = self.conn.lock().unwrap();
        let client = conn
            .query_row(
                &format!("SELECT {} FROM clients WHERE guid = ?", CLIENT_COLUMNS),
                [guid.as_str()],
                Self::client_from_row,
            )
            .optional()?;

        Ok(client)
    }

    fn insert_or_update_client(&self, client: &RemoteClient) -> Result<()> {
        let guid = client
            .guid
            .as_ref()
            .ok_or_else(|| anyhow!("Remote client without GUID"))?;

        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO clients
                (guid, name, modified, type, formfactor, os, version, fxaDeviceId)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                guid.as_str(),
                client.name,
                client.modified as i64,
                client.client_type,
                client.form_factor,
                client.os,
                client.version,
                client.fxa_device_id,
            ],
        )?;

        Ok(())
    }

    fn delete_client(&self, guid: &Guid) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM tabs WHERE client_guid = ?", [guid.as_str()])?;
        tx.execute("DELETE FROM clients WHERE guid = ?", [guid.as_str()])?;
        tx.commit()?;
        Ok(())
    }

    fn insert_or_update_tabs_for_client(
        &self,
        client_guid: Option<&Guid>,
        tabs: &[RemoteTab],
    ) -> Result<usize> {
        let client_guid = client_guid.map(Guid::as_str);

        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        let removed = tx.execute("DELETE FROM tabs WHERE client_guid IS ?", [client_guid])?;
        log::debug!("Replacing {} tabs for client {:?}", removed, client_guid);

        {
            let mut stmt = tx.prepare(
                "INSERT INTO tabs (client_guid, url, title, history, last_used, icon)
                 VALUES (?, ?, ?, ?, ?, ?)",
            )?;
            for tab in tabs {
                stmt.execute(params![
                    client_guid,
                    tab.url.as_str(),
                    tab.title,
                    encode_tab_history(&tab.history),
                    tab.last_used as i64,
                    tab.icon.as_ref().map(Url::as_str),
                ])?;
            }
        }

        tx.commit()?;
        Ok(tabs.len())
    }

    fn get_tabs_for_client(&self, client_guid: Option<&Guid>) -> Result<Vec<RemoteTab>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT url, title, history, last_used, icon FROM tabs
             WHERE client_guid IS ? ORDER BY id",
        )?;

        let rows = stmt
            .query_map([client_guid.map(Guid::as_str)], |row| {
                let url: String = row.get(0)?;
                let title: String = row.get(1)?;
                let history: String = row.get(2)?;
                let last_used: i64 = row.get(3)?;
                let icon: Option<String> = row.get(4)?;
                Ok((url, title, history, last_used, icon))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let tabs = rows
            .into_iter()
            .filter_map(|(url, title, history, last_used, icon)| {
                let url = match Url::parse(&url) {
                    Ok(url) => url,
                    Err(e) => {
                        log::warn!("Skipping stored tab with invalid URL {}: {}", url, e);
                        return None;
                    }
                };
                let tab = RemoteTab::new(url, title, decode_tab_history(&history), last_used.max(0) as u64)
                    .with_client_guid(client_guid.cloned());
                Some(match icon.and_then(|i| Url::parse(&i).ok()) {
                    Some(icon) => tab.with_icon(icon),
                    None => tab,
                })
            })
            .collect();

        Ok(tabs)
    }

    fn wipe_remote_tabs(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM tabs WHERE client_guid IS NOT NULL", [])?;
        Ok(())
    }

    fn wipe_tabs(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM tabs", [])?;
        Ok(())
    }
}
