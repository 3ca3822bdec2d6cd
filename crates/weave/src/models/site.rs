//! Local history entries and visits

use serde::{Deserialize, Serialize};
use url::Url;

use super::{Guid, MicrosecondTimestamp};

/// URL schemes never stored in history
const IGNORED_SCHEMES: &[&str] = &["about"];

/// Host prefixes stripped when grouping sites by domain
const HOST_PREFIXES: &[&str] = &["www.", "mobile.", "m."];

/// A history entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Site {
    /// Local row id, assigned by storage
    pub id: Option<i64>,
    pub url: String,
    pub title: String,
    pub guid: Option<Guid>,
}

impl Site {
    pub fn new(url: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: None,
            url: url.into(),
            title: title.into(),
            guid: None,
        }
    }

    pub fn with_guid(mut self, guid: Guid) -> Self {
        self.guid = Some(guid);
        self
    }

    /// Domain used for top-site grouping
    pub fn domain(&self) -> Option<String> {
        normalized_host(&self.url)
    }
}

/// How a visit came about. Serialized as its integer code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "u8", into = "u8")]
pub enum VisitType {
    Unknown = 0,
    Link = 1,
    Typed = 2,
    Bookmark = 3,
    Embed = 4,
    PermanentRedirect = 5,
    TemporaryRedirect = 6,
    Download = 7,
    FramedLink = 8,
    RecentlyClosed = 9,
}

impl From<u8> for VisitType {
    fn from(value: u8) -> Self {
        match value {
            1 => Self::Link,
            2 => Self::Typed,
            3 => Self::Bookmark,
            4 => Self::Embed,
            5 => Self::PermanentRedirect,
            6 => Self::TemporaryRedirect,
            7 => Self::Download,
            8 => Self::FramedLink,
            9 => Self::RecentlyClosed,
            _ => Self::Unknown,
        }
    }
}

impl From<VisitType> for u8 {
    fn from(value: VisitType) -> Self {
        value as u8
    }
}

/// A single visit as carried in history records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Visit {
    pub date: MicrosecondTimestamp,
    #[serde(rename = "type")]
    pub visit_type: VisitType,
}

impl Visit {
    pub fn new(date: MicrosecondTimestamp, visit_type: VisitType) -> Self {
        Self { date, visit_type }
    }
}

/// A local visit event. Append-only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SiteVisit {
    pub site: Site,
    pub date: MicrosecondTimestamp,
    pub visit_type: VisitType,
}

impl SiteVisit {
    pub fn new(site: Site, date: MicrosecondTimestamp, visit_type: VisitType) -> Self {
        Self {
            site,
            date,
            visit_type,
        }
    }
}

/// The synced identity of a history entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Place {
    pub guid: Guid,
    pub url: String,
    pub title: String,
}

impl Place {
    pub fn new(guid: Guid, url: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            guid,
            url: url.into(),
            title: title.into(),
        }
    }
}

/// Lower-cased host with `www.`, `mobile.` or `m.` removed
pub fn normalized_host(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    let host = parsed.host_str()?.to_lowercase();
    for prefix in HOST_PREFIXES {
        if let Some(stripped) = host.strip_prefix(prefix) {
            if !stripped.is_empty() {
                return Some(stripped.to_string());
            }
        }
    }
    Some(host)
}

/// Whether a URL should never be recorded or applied to history
pub fn is_ignored_url(url: &str) -> bool {
    let Ok(parsed) = Url::parse(url) else {
        return false;
    };

    if IGNORED_SCHEMES.contains(&parsed.scheme()) {
        return true;
    }

    parsed.host_str() == Some("localhost")
}
