//! C3 EmbeddedSSH — accepts only `direct-tcpip`, channel copy-splice with
//! half-close, `permitopen` enforcement, one-shot connect/disconnect hooks
//! (spec.md §4.2).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use russh::server::{Auth, Msg, Server as RusshServer};
use russh::Channel;
use russh_keys::key::PublicKey;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::error::{Result, TwError};
use crate::keystore::{AuthorizedKeyEntry, KeyStore};
use crate::ssh::io::splice_to_target;

pub type ConnectHook = Arc<dyn Fn(&str) + Send + Sync>;
pub type DisconnectHook = Arc<dyn Fn(&str) + Send + Sync>;

pub struct EmbeddedSsh {
    bind_addr: String,
    host_key: russh_keys::key::KeyPair,
    authorized_keys: Arc<RwLock<Vec<AuthorizedKeyEntry>>>,
    on_connect: ConnectHook,
    on_disconnect: DisconnectHook,
}

impl EmbeddedSsh {
    pub fn new(
        keystore: &KeyStore,
        ssh_port: u16,
        on_connect: ConnectHook,
        on_disconnect: DisconnectHook,
    ) -> Result<Self> {
        let host_key = keystore.load_host_key()?;
        let entries = keystore.load_authorized_keys()?;
        Ok(Self {
            bind_addr: format!("127.0.0.1:{ssh_port}"),
            host_key,
            authorized_keys: Arc::new(RwLock::new(entries)),
            on_connect,
            on_disconnect,
        })
    }

    /// Re-read `authorized_keys` from disk into the in-memory list. Not
    /// called automatically per connection (spec.md §4.2 only requires
    /// parsing at start); callers that want fresher state after a
    /// CreateUser/DeleteUser call this explicitly.
    pub async fn reload(&self, keystore: &KeyStore) -> Result<()> {
        let entries = keystore.load_authorized_keys()?;
        *self.authorized_keys.write().await = entries;
        Ok(())
    }

    pub async fn run(self) -> Result<()> {
        let config = russh::server::Config {
            keys: vec![self.host_key.clone()],
            ..Default::default()
        };
        let config = Arc::new(config);
        info!(addr = %self.bind_addr, "embedded SSH server listening");
        let addr = self.bind_addr.clone();
        russh::server::run(config, addr, self)
            .await
            .map_err(TwError::from)
    }
}

impl RusshServer for EmbeddedSsh {
    type Handler = ConnHandler;

    fn new_client(&mut self, peer: Option<std::net::SocketAddr>) -> ConnHandler {
        debug!(?peer, "accepted TCP connection");
        ConnHandler {
            authorized_keys: self.authorized_keys.clone(),
            matched: None,
            user: None,
            on_connect: self.on_connect.clone(),
            on_disconnect: self.on_disconnect.clone(),
            connected_fired: AtomicBool::new(false),
        }
    }
}

/// Per-connection state. One instance per accepted TCP connection; dropped
/// when that connection ends, which is how `OnDisconnect` fires exactly
/// once regardless of how many `direct-tcpip` channels it opened.
pub struct ConnHandler {
    authorized_keys: Arc<RwLock<Vec<AuthorizedKeyEntry>>>,
    matched: Option<AuthorizedKeyEntry>,
    user: Option<String>,
    on_connect: ConnectHook,
    on_disconnect: DisconnectHook,
    connected_fired: AtomicBool,
}

impl Drop for ConnHandler {
    fn drop(&mut self) {
        if self.connected_fired.load(Ordering::SeqCst) {
            if let Some(user) = &self.user {
                (self.on_disconnect)(user);
            }
        }
    }
}

#[async_trait]
impl russh::server::Handler for ConnHandler {
    type Error = TwError;

    async fn auth_publickey(&mut self, user: &str, key: &PublicKey) -> Result<Auth> {
        let keys = self.authorized_keys.read().await;
        match keys.iter().find(|e| &e.key == key) {
            Some(entry) => {
                self.matched = Some(entry.clone());
                self.user = Some(user.to_string());
                Ok(Auth::Accept)
            }
            None => {
                debug!(user, "public key not found in authorized_keys");
                Ok(Auth::Reject {
                    proceed_with_methods: None,
                })
            }
        }
    }

    async fn auth_password(&mut self, _user: &str, _password: &str) -> Result<Auth> {
        Ok(Auth::Reject {
            proceed_with_methods: None,
        })
    }

    async fn auth_keyboard_interactive(
        &mut self,
        _user: &str,
        _submethods: &str,
        _response: Option<russh::server::Response<'async_trait>>,
    ) -> Result<Auth> {
        Ok(Auth::Reject {
            proceed_with_methods: None,
        })
    }

    async fn channel_open_session(
        &mut self,
        _channel: Channel<Msg>,
        _session: &mut russh::server::Session,
    ) -> Result<bool> {
        debug!("rejecting session channel: unsupported channel type");
        Ok(false)
    }

    async fn channel_open_direct_tcpip(
        &mut self,
        channel: Channel<Msg>,
        host_to_connect: &str,
        port_to_connect: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut russh::server::Session,
    ) -> Result<bool> {
        let Some(entry) = self.matched.clone() else {
            warn!("direct-tcpip requested before successful authentication");
            return Ok(false);
        };

        let port = port_to_connect as u16;
        if !entry.permits(host_to_connect, port) {
            warn!(
                user = self.user.as_deref().unwrap_or("?"),
                target = %format!("{host_to_connect}:{port}"),
                "direct-tcpip refused: not in permitopen list"
            );
            return Ok(false);
        }

        if !self.connected_fired.swap(true, Ordering::SeqCst) {
            if let Some(user) = &self.user {
                (self.on_connect)(user);
            }
        }

        let target = format!("{host_to_connect}:{port}");
        debug!(
            user = self.user.as_deref().unwrap_or("?"),
            %target,
            origin = %format!("{originator_address}:{originator_port}"),
            "direct-tcpip accepted"
        );

        tokio::spawn(async move {
            let channel_stream = channel.into_stream();
            if let Err(e) = splice_to_target(channel_stream, &target).await {
                warn!(%target, error = %e, "direct-tcpip copy failed");
            }
        });

        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paths::ConfigPaths;

    #[tokio::test]
    async fn new_server_loads_host_key_and_authorized_keys() {
        let dir = tempfile::tempdir().unwrap();
        let paths = ConfigPaths::with_root(dir.path());
        let keystore = KeyStore::new(paths);
        keystore.ensure_keys().unwrap();

        let server = EmbeddedSsh::new(
            &keystore,
            2222,
            Arc::new(|_| {}),
            Arc::new(|_| {}),
        )
        .unwrap();
        assert_eq!(server.bind_addr, "127.0.0.1:2222");
    }

    #[tokio::test]
    async fn reload_picks_up_newly_appended_keys() {
        let dir = tempfile::tempdir().unwrap();
        let paths = ConfigPaths::with_root(dir.path());
        let keystore = KeyStore::new(paths);
        keystore.ensure_keys().unwrap();

        let server = EmbeddedSsh::new(&keystore, 2222, Arc::new(|_| {}), Arc::new(|_| {})).unwrap();
        let before = server.authorized_keys.read().await.len();

        let (_pem, pub_line) = keystore.generate_user_keypair().unwrap();
        keystore
            .append_user_key("alice", &pub_line, &[])
            .unwrap();
        server.reload(&keystore).await.unwrap();

        let after = server.authorized_keys.read().await.len();
        assert_eq!(after, before + 1);
    }
}
