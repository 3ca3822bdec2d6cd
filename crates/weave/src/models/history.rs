//! `history` collection records

use serde::{Deserialize, Serialize};

use super::{Guid, Place, Record, Visit};

/// Server-side lifetime of uploaded history records (60 days)
pub const HISTORY_TTL_SECONDS: u32 = 5_184_000;

/// Sort index given to uploaded history records
pub const HISTORY_SORTINDEX: i32 = 1;

/// Wire form of a `history` record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryPayload {
    pub id: Guid,
    #[serde(default)]
    pub hist_uri: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub visits: Vec<Visit>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub deleted: bool,
}

impl HistoryPayload {
    pub fn tombstone(id: Guid) -> Self {
        Self {
            id,
            hist_uri: String::new(),
            title: String::new(),
            visits: Vec::new(),
            deleted: true,
        }
    }

    pub fn as_place(&self) -> Place {
        Place::new(self.id.clone(), self.hist_uri.clone(), self.title.clone())
    }
}

/// Build the upload record for a place and its visits
pub fn make_history_record(place: &Place, visits: Vec<Visit>) -> Record<HistoryPayload> {
    let payload = HistoryPayload {
        id: place.guid.clone(),
        hist_uri: place.url.clone(),
        title: place.title.clone(),
        visits,
        deleted: false,
    };

    // modified is assigned by the server on upload
    Record::new(place.guid.clone(), payload, 0)
        .with_sortindex(HISTORY_SORTINDEX)
        .with_ttl(HISTORY_TTL_SECONDS)
}
