//! Device identity records and the commands they carry

use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::Url;

use super::{Guid, Timestamp};

/// Sync protocol versions advertised by the local client
pub const SUPPORTED_PROTOCOLS: &[&str] = &["1.5"];

/// Command names that ask for local data to be wiped or reset
const WIPE_COMMANDS: &[&str] = &["wipeAll", "wipeEngine", "resetEngine", "resetAll"];

/// Another device attached to the same account
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteClient {
    pub guid: Option<Guid>,
    pub name: String,
    /// `"mobile"` or `"desktop"`
    pub client_type: String,
    pub version: Option<String>,
    pub os: Option<String>,
    pub form_factor: Option<String>,
    pub fxa_device_id: Option<String>,
    pub modified: Timestamp,
}

impl RemoteClient {
    pub fn new(
        guid: Guid,
        name: impl Into<String>,
        client_type: impl Into<String>,
        modified: Timestamp,
    ) -> Self {
        Self {
            guid: Some(guid),
            name: name.into(),
            client_type: client_type.into(),
            version: None,
            os: None,
            form_factor: None,
            fxa_device_id: None,
            modified,
        }
    }

    /// Build from a downloaded `clients` record
    pub fn from_payload(payload: &ClientPayload, modified: Timestamp) -> Self {
        Self {
            guid: Some(payload.id.clone()),
            name: payload.name.clone(),
            client_type: payload.client_type.clone(),
            version: payload.version.clone(),
            os: payload.os.clone(),
            form_factor: payload.form_factor.clone(),
            fxa_device_id: payload.fxa_device_id.clone(),
            modified,
        }
    }
}

/// Wire form of a `clients` collection record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientPayload {
    pub id: Guid,
    pub name: String,
    #[serde(rename = "type")]
    pub client_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default)]
    pub protocols: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os: Option<String>,
    #[serde(rename = "formfactor", default, skip_serializing_if = "Option::is_none")]
    pub form_factor: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fxa_device_id: Option<String>,
    #[serde(default)]
    pub commands: Vec<CommandPayload>,
}

/// A command queued on a client record by another device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandPayload {
    pub command: String,
    #[serde(default)]
    pub args: Vec<Value>,
}

impl CommandPayload {
    pub fn new(command: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            command: command.into(),
            args,
        }
    }
}

/// Commands this client knows how to interpret
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientCommand {
    /// Show a tab sent from another device
    DisplayUri {
        uri: Url,
        sender: Guid,
        title: String,
    },
    /// Wipe or reset request. Accepted and ignored.
    Wipe { command: String },
}

impl ClientCommand {
    /// Parse a command, returning `None` for unknown names or bad arguments
    pub fn parse(payload: &CommandPayload) -> Option<Self> {
        match payload.command.as_str() {
            "displayURI" => {
                let uri = payload.args.first()?.as_str()?;
                let sender = payload.args.get(1)?.as_str()?;
                let title = payload.args.get(2)?.as_str()?;
                Some(Self::DisplayUri {
                    uri: Url::parse(uri).ok()?,
                    sender: Guid::new(sender),
                    title: title.to_string(),
                })
            }
            name if WIPE_COMMANDS.contains(&name) => Some(Self::Wipe {
                command: name.to_string(),
            }),
            _ => None,
        }
    }
}
