//! Sync engine configuration
//!
//! Loaded from (later sources override earlier ones):
//! 1. Built-in defaults
//! 2. JSON file (~/.config/weave/sync.json)
//! 3. Environment variables (`WEAVE_CLIENT_NAME`, `WEAVE_HISTORY_BATCH_SIZE`)

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Config filename in the Weave config directory
pub const CONFIG_FILE: &str = "sync.json";

const ONE_WEEK_SECS: u64 = 7 * 24 * 60 * 60;

/// Tunables for the sync engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Name this device advertises to other clients
    pub client_name: String,
    /// `"mobile"` or `"desktop"`
    pub client_type: String,
    /// Records requested per history download page
    pub history_batch_size: usize,
    /// Records per history upload request
    pub history_upload_batch_size: usize,
    /// Delay before handling a database-recreated event
    pub database_reset_delay_ms: u64,
    /// Record application failures tolerated per batch
    pub max_record_failures: usize,
    /// Keep syncing later collections after an interruption
    pub continue_after_interrupt: bool,
    /// Re-upload the local client record at least this often
    pub clients_upload_interval_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            client_name: "weave".to_string(),
            client_type: "mobile".to_string(),
            history_batch_size: 1000,
            history_upload_batch_size: 50,
            database_reset_delay_ms: 300,
            max_record_failures: 3,
            continue_after_interrupt: false,
            clients_upload_interval_secs: ONE_WEEK_SECS,
        }
    }
}

impl SyncConfig {
    /// Load from the config directory and environment
    pub fn load() -> Result<Self> {
        let base = if config::config_exists(CONFIG_FILE) {
            config::load_json(CONFIG_FILE)?
        } else {
            Self::default()
        };
        base.with_env_overrides()?.validated()
    }

    /// Load from a specific JSON file, then apply environment overrides
    pub fn from_file(path: &Path) -> Result<Self> {
        let base: Self = config::load_json_file(path)?;
        base.with_env_overrides()?.validated()
    }

    /// Parse from a JSON string; missing fields take their defaults
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json).context("Failed to parse sync config JSON")?;
        config.validated()
    }

    /// Reject values the sync engine cannot run with
    pub fn validated(self) -> Result<Self> {
        anyhow::ensure!(self.history_batch_size > 0, "history_batch_size must be positive");
        anyhow::ensure!(
            self.history_upload_batch_size > 0,
            "history_upload_batch_size must be positive"
        );
        Ok(self)
    }

    /// Persist to the config directory
    pub fn save(&self) -> Result<()> {
        config::save_json(CONFIG_FILE, self)
    }

    fn with_env_overrides(self) -> Result<Self> {
        self.apply_overrides(
            std::env::var("WEAVE_CLIENT_NAME").ok(),
            std::env::var("WEAVE_HISTORY_BATCH_SIZE").ok(),
        )
    }

    fn apply_overrides(mut self, client_name: Option<String>, batch_size: Option<String>) -> Result<Self> {
        if let Some(name) = client_name.filter(|n| !n.is_empty()) {
            self.client_name = name;
        }

        if let Some(size) = batch_size {
            let size: usize = size
                .parse()
                .with_context(|| format!("WEAVE_HISTORY_BATCH_SIZE is not a number: {}", size))?;
            anyhow::ensure!(size > 0, "WEAVE_HISTORY_BATCH_SIZE must be positive");
            self.history_batch_size = size;
        }

        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SyncConfig::default();
        assert_eq!(config.history_batch_size, 1000);
        assert_eq!(config.database_reset_delay_ms, 300);
        assert_eq!(config.max_record_failures, 3);
        assert!(!config.continue_after_interrupt);
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = SyncConfig::from_json(r#"{"client_name": "Tablet", "history_batch_size": 250}"#).unwrap();
        assert_eq!(config.client_name, "Tablet");
        assert_eq!(config.history_batch_size, 250);
        assert_eq!(config.client_type, "mobile");
    }

    #[test]
    fn test_overrides() {
        let config = SyncConfig::default()
            .apply_overrides(Some("Phone".into()), Some("10".into()))
            .unwrap();
        assert_eq!(config.client_name, "Phone");
        assert_eq!(config.history_batch_size, 10);

        assert!(SyncConfig::default().apply_overrides(None, Some("lots".into())).is_err());
        assert!(SyncConfig::default().apply_overrides(None, Some("0".into())).is_err());
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        std::fs::write(&path, r#"{"max_record_failures": 5}"#).unwrap();

        let config = SyncConfig::from_file(&path).unwrap();
        assert_eq!(config.max_record_failures, 5);

        std::fs::write(&path, r#"{"history_batch_size": 0}"#).unwrap();
        assert!(SyncConfig::from_file(&path).is_err());
    }

    #[test]
    fn test_zero_batch_sizes_rejected() {
        assert!(SyncConfig::from_json(r#"{"history_batch_size": 0}"#).is_err());
        assert!(SyncConfig::from_json(r#"{"history_upload_batch_size": 0}"#).is_err());
        assert!(SyncConfig::default().validated().is_ok());
    }
}
