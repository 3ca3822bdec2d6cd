//! Versioned, timestamped records exchanged with the storage server

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Server timestamp in milliseconds since the Unix epoch
pub type Timestamp = u64;

/// Visit timestamp in microseconds since the Unix epoch
pub type MicrosecondTimestamp = u64;

/// Current time as a millisecond [`Timestamp`]
pub fn now_millis() -> Timestamp {
    Utc::now().timestamp_millis().max(0) as Timestamp
}

/// Current time as a [`MicrosecondTimestamp`]
pub fn now_micros() -> MicrosecondTimestamp {
    Utc::now().timestamp_micros().max(0) as MicrosecondTimestamp
}

/// Globally unique record identifier, stable across devices
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Guid(pub String);

impl Guid {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh 12-character url-safe GUID
    pub fn random() -> Self {
        let uuid = uuid::Uuid::new_v4();
        Self(URL_SAFE_NO_PAD.encode(&uuid.as_bytes()[..9]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for Guid {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for Guid {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl fmt::Display for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A record as stored on the server
///
/// Identity is `id`. Records are never mutated in place: a newer record with
/// the same id replaces the older one wholesale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record<T> {
    pub id: Guid,
    pub payload: T,
    /// Server modification time; ignored on upload
    #[serde(default)]
    pub modified: Timestamp,
    #[serde(default)]
    pub sortindex: i32,
    /// Server-side expiry in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<u32>,
}

impl<T> Record<T> {
    pub fn new(id: Guid, payload: T, modified: Timestamp) -> Self {
        Self {
            id,
            payload,
            modified,
            sortindex: 0,
            ttl: None,
        }
    }

    pub fn with_sortindex(self, sortindex: i32) -> Self {
        Self { sortindex, ..self }
    }

    pub fn with_ttl(self, ttl: u32) -> Self {
        Self {
            ttl: Some(ttl),
            ..self
        }
    }

    /// Build a new record carrying a different payload
    pub fn with_payload<U>(self, payload: U) -> Record<U> {
        Record {
            id: self.id,
            payload,
            modified: self.modified,
            sortindex: self.sortindex,
            ttl: self.ttl,
        }
    }
}

impl<T: Serialize> Record<T> {
    /// Convert to the untyped form the transport deals in
    pub fn encode(&self) -> serde_json::Result<Record<serde_json::Value>> {
        let payload = serde_json::to_value(&self.payload)?;
        Ok(Record {
            id: self.id.clone(),
            payload,
            modified: self.modified,
            sortindex: self.sortindex,
            ttl: self.ttl,
        })
    }
}

impl Record<serde_json::Value> {
    /// Decode the payload into a typed record
    pub fn decode<T: DeserializeOwned>(&self) -> serde_json::Result<Record<T>> {
        let payload = serde_json::from_value(self.payload.clone())?;
        Ok(Record {
            id: self.id.clone(),
            payload,
            modified: self.modified,
            sortindex: self.sortindex,
            ttl: self.ttl,
        })
    }

    /// Whether the payload is a tombstone (`{"deleted": true}`)
    pub fn is_deleted(&self) -> bool {
        self.payload
            .get("deleted")
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_random_guid_shape() {
        let guid = Guid::random();
        assert_eq!(guid.as_str().len(), 12);
        assert!(
            guid.as_str()
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        );
        assert_ne!(guid, Guid::random());
    }

    #[test]
    fn test_decode_typed_payload() {
        #[derive(Debug, Deserialize, PartialEq)]
        struct Payload {
            title: String,
        }

        let record = Record::new(Guid::new("abc"), json!({"title": "Hello"}), 1500);
        let typed: Record<Payload> = record.decode().unwrap();
        assert_eq!(typed.id.as_str(), "abc");
        assert_eq!(typed.modified, 1500);
        assert_eq!(typed.payload.title, "Hello");
    }

    #[test]
    fn test_is_deleted() {
        let tombstone = Record::new(Guid::new("a"), json!({"id": "a", "deleted": true}), 1);
        let live = Record::new(Guid::new("b"), json!({"id": "b"}), 1);
        assert!(tombstone.is_deleted());
        assert!(!live.is_deleted());
    }

    #[test]
    fn test_builders_keep_identity() {
        let record = Record::new(Guid::new("a"), 1u8, 10)
            .with_sortindex(5)
            .with_ttl(60);
        let replaced = record.clone().with_payload("x");
        assert_eq!(replaced.id, record.id);
        assert_eq!(replaced.sortindex, 5);
        assert_eq!(replaced.ttl, Some(60));
        assert_eq!(replaced.payload, "x");
    }
}
