//! Open tabs on remote devices

use serde::{Deserialize, Deserializer, Serialize};
use url::Url;

use super::{Guid, RemoteClient, Timestamp};

/// Schemes of pages internal to the browser, never synced
const INTERNAL_SCHEMES: &[&str] = &["about", "internal"];

/// A tab open on some device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTab {
    /// Owning client; `None` for the local device
    pub client_guid: Option<Guid>,
    pub url: Url,
    pub title: String,
    /// Navigation history, oldest first. The last entry is the current page.
    pub history: Vec<Url>,
    pub last_used: Timestamp,
    pub icon: Option<Url>,
}

impl RemoteTab {
    pub fn new(url: Url, title: impl Into<String>, history: Vec<Url>, last_used: Timestamp) -> Self {
        Self {
            client_guid: None,
            url,
            title: title.into(),
            history,
            last_used,
            icon: None,
        }
    }

    pub fn with_client_guid(self, client_guid: Option<Guid>) -> Self {
        Self {
            client_guid,
            ..self
        }
    }

    pub fn with_icon(self, icon: Url) -> Self {
        Self {
            icon: Some(icon),
            ..self
        }
    }

    /// Whether a URL may appear in a synced tab
    pub fn should_include_url(url: &Url) -> bool {
        if INTERNAL_SCHEMES.contains(&url.scheme()) {
            return false;
        }
        if url.scheme() == "javascript" {
            return false;
        }
        url.host_str().is_some()
    }

    /// Wire form of this tab, or `None` when no history entry survives filtering
    pub fn to_payload(&self) -> Option<TabPayload> {
        let url_history: Vec<String> = self
            .history
            .iter()
            .rev()
            .filter(|u| Self::should_include_url(u))
            .map(|u| u.to_string())
            .collect();

        if url_history.is_empty() {
            return None;
        }

        Some(TabPayload {
            title: self.title.clone(),
            url_history,
            icon: self.icon.as_ref().map(|u| u.to_string()),
            last_used: millis_to_decimal_seconds(self.last_used),
        })
    }
}

/// A remote client together with its open tabs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientAndTabs {
    pub client: RemoteClient,
    pub tabs: Vec<RemoteTab>,
}

impl ClientAndTabs {
    /// Most recent tab use on this client, 0 when it has no tabs
    pub fn approximate_last_sync_time(&self) -> Timestamp {
        self.tabs.iter().map(|t| t.last_used).max().unwrap_or(0)
    }
}

/// Storage form of a tab's history: a JSON array of URL strings
pub fn encode_tab_history(history: &[Url]) -> String {
    let strings: Vec<&str> = history.iter().map(Url::as_str).collect();
    serde_json::to_string(&strings).unwrap_or_else(|_| "[]".to_string())
}

/// Inverse of [`encode_tab_history`]. Unparseable entries are dropped.
pub fn decode_tab_history(encoded: &str) -> Vec<Url> {
    let strings: Vec<String> = match serde_json::from_str(encoded) {
        Ok(strings) => strings,
        Err(e) => {
            log::warn!("Discarding malformed tab history: {}", e);
            return Vec::new();
        }
    };

    strings
        .iter()
        .filter_map(|s| Url::parse(s).ok())
        .collect()
}

/// A `tabs` collection record: all open tabs of one client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TabsPayload {
    pub id: Guid,
    pub client_name: String,
    #[serde(default)]
    pub tabs: Vec<TabPayload>,
}

impl TabsPayload {
    /// Tabs of this record attributed to the sending client
    pub fn remote_tabs(&self) -> Vec<RemoteTab> {
        self.tabs
            .iter()
            .filter_map(|t| t.to_remote_tab(&self.id))
            .collect()
    }
}

/// One tab inside a [`TabsPayload`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TabPayload {
    pub title: String,
    /// Most recent first
    pub url_history: Vec<String>,
    #[serde(default)]
    pub icon: Option<String>,
    /// Decimal seconds since the epoch, e.g. `"1492316423.123"`
    #[serde(deserialize_with = "deserialize_last_used")]
    pub last_used: String,
}

impl TabPayload {
    fn to_remote_tab(&self, client: &Guid) -> Option<RemoteTab> {
        let mut history: Vec<Url> = self
            .url_history
            .iter()
            .filter_map(|s| Url::parse(s).ok())
            .collect();
        history.reverse();

        let url = history.last()?.clone();
        Some(RemoteTab {
            client_guid: Some(client.clone()),
            url,
            title: self.title.clone(),
            history,
            last_used: decimal_seconds_to_millis(&self.last_used).unwrap_or(0),
            icon: self.icon.as_deref().and_then(|s| Url::parse(s).ok()),
        })
    }
}

/// Some clients send `lastUsed` as a bare number
fn deserialize_last_used<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(match value {
        serde_json::Value::String(s) => s,
        serde_json::Value::Number(n) => n.to_string(),
        _ => "0".to_string(),
    })
}

/// Render milliseconds as decimal seconds with millisecond precision
pub fn millis_to_decimal_seconds(millis: Timestamp) -> String {
    format!("{}.{:03}", millis / 1000, millis % 1000)
}

/// Parse decimal seconds into milliseconds
pub fn decimal_seconds_to_millis(seconds: &str) -> Option<Timestamp> {
    let value: f64 = seconds.trim().parse().ok()?;
    if !value.is_finite() || value < 0.0 {
        return None;
    }
    Some((value * 1000.0).round() as Timestamp)
}
