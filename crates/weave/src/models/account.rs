//! Credentials handed over by the account layer

use std::collections::HashMap;
use std::fmt;

use anyhow::{Context, Result};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};

use super::Timestamp;

/// Symmetric key pair used to decrypt and verify one collection
#[derive(Clone, PartialEq, Eq)]
pub struct KeyBundle {
    pub enc_key: Vec<u8>,
    pub hmac_key: Vec<u8>,
}

impl KeyBundle {
    pub fn new(enc_key: Vec<u8>, hmac_key: Vec<u8>) -> Self {
        Self { enc_key, hmac_key }
    }

    /// Decode a bundle from its base64 transport form
    pub fn from_base64(enc_key: &str, hmac_key: &str) -> Result<Self> {
        Ok(Self {
            enc_key: STANDARD.decode(enc_key).context("Invalid encryption key")?,
            hmac_key: STANDARD.decode(hmac_key).context("Invalid HMAC key")?,
        })
    }

    /// A fresh bundle of 32-byte keys
    pub fn random() -> Self {
        Self {
            enc_key: random_key(),
            hmac_key: random_key(),
        }
    }
}

fn random_key() -> Vec<u8> {
    let mut out = Vec::with_capacity(32);
    out.extend_from_slice(uuid::Uuid::new_v4().as_bytes());
    out.extend_from_slice(uuid::Uuid::new_v4().as_bytes());
    out
}

impl fmt::Debug for KeyBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyBundle")
            .field("enc_key", &"[REDACTED]")
            .field("hmac_key", &"[REDACTED]")
            .finish()
    }
}

/// Default bundle plus per-collection overrides
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Keys {
    pub default: KeyBundle,
    pub collections: HashMap<String, KeyBundle>,
}

impl Keys {
    pub fn new(default: KeyBundle) -> Self {
        Self {
            default,
            collections: HashMap::new(),
        }
    }

    pub fn with_collection(mut self, collection: impl Into<String>, bundle: KeyBundle) -> Self {
        self.collections.insert(collection.into(), bundle);
        self
    }

    /// Bundle for a collection, falling back to the default
    pub fn for_collection(&self, collection: &str) -> &KeyBundle {
        self.collections.get(collection).unwrap_or(&self.default)
    }
}

/// Storage node credentials issued by the token server
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenServerToken {
    pub id: String,
    pub key: String,
    pub api_endpoint: String,
    pub uid: u64,
    pub hashed_fxa_uid: String,
    #[serde(rename = "duration")]
    pub duration_in_seconds: u64,
    #[serde(rename = "remoteTimestamp")]
    pub remote_timestamp: Timestamp,
}

impl TokenServerToken {
    /// Whether both tokens address the same user on the same storage node
    pub fn same_destination(&self, other: &TokenServerToken) -> bool {
        self.uid == other.uid && self.api_endpoint == other.api_endpoint
    }
}

impl fmt::Debug for TokenServerToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenServerToken")
            .field("id", &"[REDACTED]")
            .field("key", &"[REDACTED]")
            .field("api_endpoint", &self.api_endpoint)
            .field("uid", &self.uid)
            .field("duration_in_seconds", &self.duration_in_seconds)
            .field("remote_timestamp", &self.remote_timestamp)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token(uid: u64, endpoint: &str) -> TokenServerToken {
        TokenServerToken {
            id: "token-id".to_string(),
            key: "secret-key".to_string(),
            api_endpoint: endpoint.to_string(),
            uid,
            hashed_fxa_uid: "hashed".to_string(),
            duration_in_seconds: 300,
            remote_timestamp: 1_500_000_000_000,
        }
    }

    #[test]
    fn test_same_destination() {
        let a = token(1, "https://node1.example/1.5/1");
        assert!(a.same_destination(&token(1, "https://node1.example/1.5/1")));
        assert!(!a.same_destination(&token(2, "https://node1.example/1.5/1")));
        assert!(!a.same_destination(&token(1, "https://node2.example/1.5/1")));
    }

    #[test]
    fn test_token_json_names() {
        let json = serde_json::to_value(token(7, "https://node/")).unwrap();
        assert_eq!(json["duration"], 300);
        assert_eq!(json["remoteTimestamp"], 1_500_000_000_000u64);
        assert_eq!(json["hashed_fxa_uid"], "hashed");
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let debug = format!("{:?}", token(1, "https://node/"));
        assert!(!debug.contains("secret-key"));
        assert!(debug.contains("[REDACTED]"));

        let bundle = format!("{:?}", KeyBundle::random());
        assert!(bundle.contains("[REDACTED]"));
    }

    #[test]
    fn test_keys_fall_back_to_default() {
        let default = KeyBundle::random();
        let history = KeyBundle::random();
        let keys = Keys::new(default.clone()).with_collection("history", history.clone());
        assert_eq!(keys.for_collection("history"), &history);
        assert_eq!(keys.for_collection("tabs"), &default);
        assert_eq!(default.enc_key.len(), 32);
    }

    #[test]
    fn test_key_bundle_from_base64() {
        let bundle = KeyBundle::from_base64("AAEC", "AwQF").unwrap();
        assert_eq!(bundle.enc_key, vec![0, 1, 2]);
        assert_eq!(bundle.hmac_key, vec![3, 4, 5]);
        assert!(KeyBundle::from_base64("!!", "AA==").is_err());
    }
}
