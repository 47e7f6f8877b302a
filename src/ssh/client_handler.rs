//! Outbound SSH client handler shared by ReverseTunnel, ForwardTunnel, and
//! RelayControl. All three dial the relay over the Transport's loopback
//! port and otherwise speak plain SSH (spec.md §4.3, §4.6).

use async_trait::async_trait;
use russh_keys::key::PublicKey;

use crate::error::TwError;

/// Accepts any relay host key by default — trust is anchored at the
/// transport layer (the splithttp/TLS leg), not here (spec.md §4.3). An
/// operator can opt into pinning a specific fingerprint (open question (b)
/// in spec.md §9); unset by default, never enabled implicitly.
#[derive(Clone, Default)]
pub struct ClientHandler {
    pinned_fingerprint: Option<String>,
}

impl ClientHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_pinned_fingerprint(fingerprint: impl Into<String>) -> Self {
        Self {
            pinned_fingerprint: Some(fingerprint.into()),
        }
    }
}

#[async_trait]
impl russh::client::Handler for ClientHandler {
    type Error = TwError;

    async fn check_server_key(&mut self, server_public_key: &PublicKey) -> Result<bool, Self::Error> {
        match &self.pinned_fingerprint {
            None => Ok(true),
            Some(expected) => Ok(&server_public_key.fingerprint() == expected),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unpinned_handler_accepts_any_key() {
        let mut handler = ClientHandler::new();
        let key = russh_keys::key::KeyPair::generate_ed25519()
            .unwrap()
            .clone_public_key()
            .unwrap();
        assert!(handler.check_server_key(&key).await.unwrap());
    }

    #[tokio::test]
    async fn pinned_handler_rejects_mismatched_fingerprint() {
        let mut handler = ClientHandler::with_pinned_fingerprint("not-a-real-fingerprint");
        let key = russh_keys::key::KeyPair::generate_ed25519()
            .unwrap()
            .clone_public_key()
            .unwrap();
        assert!(!handler.check_server_key(&key).await.unwrap());
    }
}
