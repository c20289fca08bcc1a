//! Common error types for Beacon components.

use thiserror::Error;

/// Errors surfaced by a key-value store adapter.
///
/// The variants are a closed set so that loops can dispatch on the kind
/// directly. Only [`StoreError::Transient`] is ever retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// Every endpoint failed or the cluster is degraded (quorum loss, election)
    #[error("Cluster unavailable: {0}")]
    Transient(String),

    /// A conditional write or delete found a different prior value
    #[error("Compare failed on {key}: {cause}")]
    PreconditionFailed { key: String, cause: String },

    /// A create-only write found the key already present
    #[error("Key already exists: {key}")]
    NodeExists { key: String },

    /// The key does not exist; `index` is the store index at the time
    #[error("Key not found: {key}")]
    KeyNotFound { key: String, index: u64 },

    /// A watch asked for an index the store no longer retains
    #[error("Watch index cleared on {key} (store index {index})")]
    IndexCleared { key: String, index: u64 },

    /// Credentials missing or rejected
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Any other error code reported by the store
    #[error("Store error {code} on {key}: {message}")]
    Api {
        code: u32,
        key: String,
        message: String,
    },

    /// Response could not be understood
    #[error("Malformed store response: {0}")]
    Protocol(String),
}

impl StoreError {
    /// Returns true if the operation should be re-issued unchanged
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Errors raised by the heartbeat, mirror and observer components
#[derive(Debug, Error)]
pub enum BeaconError {
    /// Invalid names, missing CA certificate, unreachable configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Another live instance holds the liveness slot
    #[error("Server {server} is already running")]
    AlreadyRegistered { server: String },

    /// The liveness slot was taken over after our lease lapsed
    #[error("Heartbeat token for {server} was superseded")]
    TokenSuperseded { server: String },

    /// Store operation failed
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl BeaconError {
    /// Returns true if the running mode must stop
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::Store(e) if e.is_transient())
    }
}

/// Result type alias for Beacon component operations
pub type Result<T> = std::result::Result<T, BeaconError>;
