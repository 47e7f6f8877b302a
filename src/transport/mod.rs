//! C2 Transport driver — the boundary to the encrypted-transport engine
//! (VLESS over splithttp over TLS) that spec.md §1 treats as an external,
//! pre-built library (see SPEC_FULL.md §3 for the design note).
//!
//! Rather than reimplement that wire protocol (explicit Non-goal) this
//! module renders the JSON config the engine binary expects and drives it
//! as a subprocess: [`ProcessEngine`] is one possible [`TransportEngine`],
//! the trait exists so a future in-process engine could replace it without
//! touching callers.

mod config;
mod engine;

pub use config::{
    build_config, TransportParams, TransportRole, CLIENT_TRANSPORT_PORT, CONTROL_TRANSPORT_PORT,
};
pub use engine::ProcessEngine;

use async_trait::async_trait;

#[derive(Debug)]
pub enum TransportError {
    ConnectionFailed,
    ConfigWrite(std::io::Error),
    Spawn(std::io::Error),
    NotRunning,
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportError::ConnectionFailed => write!(f, "transport engine failed to come up"),
            TransportError::ConfigWrite(e) => write!(f, "writing transport config: {e}"),
            TransportError::Spawn(e) => write!(f, "spawning transport engine: {e}"),
            TransportError::NotRunning => write!(f, "transport engine is not running"),
        }
    }
}

impl std::error::Error for TransportError {}

/// Lifecycle contract every transport engine implementation must satisfy.
/// `start` is idempotent; calling it while already running is a no-op.
#[async_trait]
pub trait TransportEngine: Send + Sync {
    async fn start(&mut self) -> Result<(), TransportError>;
    async fn stop(&mut self) -> Result<(), TransportError>;
    fn running(&self) -> bool;
}
