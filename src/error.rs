//! Crate-wide error taxonomy (spec.md §7).
//!
//! Transient network failures inside tunnel loops are deliberately *not*
//! represented here — they are caught, logged, and recovered via backoff,
//! surfacing only through `Connected()`/`LastError()` on the tunnel itself.

use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, TwError>;

/// Top-level error type surfaced across component boundaries.
#[derive(Debug, thiserror::Error)]
pub enum TwError {
    /// Bad input caught before any I/O: missing relay host, no mappings,
    /// invalid user name, malformed proxy URL. Never retried.
    #[error("configuration error: {0}")]
    Config(String),

    #[error("transport error: {0}")]
    Transport(#[from] crate::transport::TransportError),

    #[error("ssh error: {0}")]
    Ssh(String),

    #[error("relay error: {0}")]
    Relay(String),

    /// FSM violation: Start while running/starting, Stop while not
    /// running/error. Refused, never mutates state.
    #[error("lifecycle refused: {0}")]
    Fsm(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
}

impl From<russh::Error> for TwError {
    fn from(e: russh::Error) -> Self {
        TwError::Ssh(e.to_string())
    }
}

impl From<russh_keys::Error> for TwError {
    fn from(e: russh_keys::Error) -> Self {
        TwError::Ssh(e.to_string())
    }
}

impl TwError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn ssh(msg: impl Into<String>) -> Self {
        Self::Ssh(msg.into())
    }

    pub fn relay(msg: impl Into<String>) -> Self {
        Self::Relay(msg.into())
    }

    pub fn fsm(msg: impl Into<String>) -> Self {
        Self::Fsm(msg.into())
    }

    /// True for the "cancelled" kind spec.md §7 asks be distinguished from
    /// failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, TwError::Cancelled)
    }
}
