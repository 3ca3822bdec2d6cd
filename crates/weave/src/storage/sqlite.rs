//! SQLite browser database shared by history and clients/tabs storage

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use rusqlite::Connection;
use rusqlite_migration::{M, Migrations};

/// File name of the browser database
pub const BROWSER_DB_NAME: &str = "browser.db";

/// Database migrations
///
/// Each migration is applied in order. The user_version pragma tracks which
/// migrations have been applied.
fn migrations() -> Migrations<'static> {
    Migrations::new(vec![
        // Migration 1: history
        M::up(
            r#"
            CREATE TABLE domains (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                domain TEXT NOT NULL UNIQUE,
                showOnTopSites INTEGER NOT NULL DEFAULT 1
            );

            -- Deleted places keep their row (url NULL) until the deletion is uploaded
            CREATE TABLE history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                guid TEXT NOT NULL UNIQUE,
                url TEXT UNIQUE,
                title TEXT NOT NULL,
                server_modified INTEGER,
                local_modified INTEGER,
                is_deleted INTEGER NOT NULL DEFAULT 0,
                should_upload INTEGER NOT NULL DEFAULT 0,
                domain_id INTEGER REFERENCES domains(id) ON DELETE CASCADE
            );

            CREATE INDEX idx_history_should_upload ON history(should_upload);

            CREATE TABLE visits (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                siteID INTEGER NOT NULL REFERENCES history(id) ON DELETE CASCADE,
                date INTEGER NOT NULL,
                type INTEGER NOT NULL,
                is_local INTEGER NOT NULL,
                UNIQUE (siteID, date, type)
            );

            CREATE INDEX idx_visits_site_date ON visits(siteID, date DESC);
            "#,
        ),
        // Migration 2: remote clients and tabs
        M::up(
            r#"
            CREATE TABLE clients (
                guid TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                modified INTEGER NOT NULL,
                type TEXT NOT NULL,
                formfactor TEXT,
                os TEXT,
                version TEXT,
                fxaDeviceId TEXT
            );

            -- client_guid NULL holds the local device's tabs
            CREATE TABLE tabs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                client_guid TEXT,
                url TEXT NOT NULL,
                title TEXT NOT NULL,
                history TEXT NOT NULL DEFAULT '[]',
                last_used INTEGER NOT NULL,
                icon TEXT
            );

            CREATE INDEX idx_tabs_client ON tabs(client_guid);
            "#,
        ),
        // Migration 3: pinned top sites
        M::up(
            r#"
            CREATE TABLE pinned_top_sites (
                url TEXT PRIMARY KEY,
                pinDate INTEGER NOT NULL,
                title TEXT NOT NULL,
                historyID INTEGER,
                guid TEXT NOT NULL,
                domain TEXT NOT NULL
            );
            "#,
        ),
    ])
}

/// Handle to the browser database
///
/// Cloning shares the underlying connection.
#[derive(Clone)]
pub struct BrowserDb {
    conn: Arc<Mutex<Connection>>,
    name: String,
    recreated: bool,
}

impl BrowserDb {
    /// Open (or create) the database at `path`.
    ///
    /// A file that cannot be opened as a database is moved aside and a fresh
    /// database is created in its place; [`was_recreated`](Self::was_recreated)
    /// then reports `true`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| BROWSER_DB_NAME.to_string());

        let (conn, recreated) = match Self::connect(path) {
            Ok(conn) => (conn, false),
            Err(e) if path.exists() => {
                log::warn!("Browser database {} unusable, recreating: {:#}", name, e);
                Self::move_aside(path)?;
                (Self::connect(path)?, true)
            }
            Err(e) => return Err(e),
        };

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            name,
            recreated,
        })
    }

    /// Open a private in-memory database
    pub fn open_in_memory() -> Result<Self> {
        let mut conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        Self::configure(&mut conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            name: BROWSER_DB_NAME.to_string(),
            recreated: false,
        })
    }

    /// File name of this database
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether opening had to discard an unusable file
    pub fn was_recreated(&self) -> bool {
        self.recreated
    }

    pub(crate) fn connection(&self) -> Arc<Mutex<Connection>> {
        Arc::clone(&self.conn)
    }

    fn connect(path: &Path) -> Result<Connection> {
        let mut conn = Connection::open(path)
            .with_context(|| format!("Failed to open database at {:?}", path))?;
        Self::configure(&mut conn)?;
        Ok(conn)
    }

    fn configure(conn: &mut Connection) -> Result<()> {
        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA temp_store = MEMORY;
            PRAGMA foreign_keys = ON;
            "#,
        )?;

        migrations()
            .to_latest(conn)
            .context("Failed to run database migrations")?;
        Ok(())
    }

    fn move_aside(path: &Path) -> Result<()> {
        let mut corrupt = path.as_os_str().to_owned();
        corrupt.push(".corrupt");
        std::fs::rename(path, PathBuf::from(&corrupt))
            .with_context(|| format!("Failed to move aside {:?}", path))?;

        for suffix in ["-wal", "-shm"] {
            let mut side = path.as_os_str().to_owned();
            side.push(suffix);
            let side = PathBuf::from(side);
            if side.exists() {
                std::fs::remove_file(&side)
                    .with_context(|| format!("Failed to remove {:?}", side))?;
            }
        }
        Ok(())
    }
}
