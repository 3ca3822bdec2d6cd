//! Typed errors for the failures callers branch on
//!
//! Everything else travels as `anyhow::Error`.

use thiserror::Error;

/// Failure talking to the storage server
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ServerError {
    #[error("network unavailable")]
    Offline,

    #[error("server requested backoff for {remaining_seconds}s")]
    Backoff { remaining_seconds: u64 },

    #[error("storage token rejected")]
    Unauthorized,

    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },

    #[error("malformed server response: {0}")]
    Malformed(String),
}

/// Failure obtaining credentials from the account layer
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AccountError {
    #[error("no account signed in")]
    NoAccount,

    #[error("account not ready")]
    NotReady,

    #[error("account transport failure: {0}")]
    Transport(#[from] ServerError),
}

/// Sync failures that are not transport related
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    /// An invariant of local storage was violated
    #[error("fatal: {0}")]
    Fatal(String),

    #[error("ignored site")]
    IgnoredSite,

    #[error("unknown collection: {0}")]
    UnknownCollection(String),

    #[error("collection disabled: {0}")]
    EngineDisabled(String),
}

/// Find a [`ServerError`] anywhere in an error chain
pub fn server_error(err: &anyhow::Error) -> Option<&ServerError> {
    err.chain().find_map(|cause| {
        cause
            .downcast_ref::<ServerError>()
            .or_else(|| match cause.downcast_ref::<AccountError>() {
                Some(AccountError::Transport(inner)) => Some(inner),
                _ => None,
            })
    })
}
