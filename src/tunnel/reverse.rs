//! C4 ReverseTunnel — the server/relay-side leg: dial the relay's real
//! sshd through the local server-mode Transport, publish a remote forward
//! for the chosen relay port, and splice every inbound `forwarded-tcpip`
//! channel back to the embedded SSH server (spec.md §4.3).

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client::{self, Msg, Session};
use russh::{Channel, ChannelId};
use russh_keys::key::PublicKey;
use tokio::sync::{watch, Mutex, Notify};
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

use crate::error::{Result, TwError};
use crate::ssh::io::splice_to_target;
use crate::tunnel::common::{self, HANDSHAKE_TIMEOUT};

const SSH_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(15);
const BACKOFF_INITIAL: Duration = Duration::from_secs(2);
const BACKOFF_MAX: Duration = Duration::from_secs(30);

#[derive(Default)]
struct SharedState {
    connected: bool,
    last_error: Option<String>,
}

/// Dials `relay_addr` (a loopback address into the local server-mode
/// Transport instance), authenticates as `user` with the node's own
/// keypair, and asks the relay to forward `remote_port` back to us. Every
/// connection the relay forwards is spliced to `local_addr` — the embedded
/// SSH server's listen address.
#[derive(Clone)]
pub struct ReverseTunnel {
    relay_addr: String,
    user: String,
    key_path: PathBuf,
    remote_port: u16,
    local_addr: String,
    state: Arc<Mutex<SharedState>>,
}

impl ReverseTunnel {
    pub fn new(
        relay_addr: impl Into<String>,
        user: impl Into<String>,
        key_path: impl Into<PathBuf>,
        remote_port: u16,
        local_addr: impl Into<String>,
    ) -> Self {
        Self {
            relay_addr: relay_addr.into(),
            user: user.into(),
            key_path: key_path.into(),
            remote_port,
            local_addr: local_addr.into(),
            state: Arc::new(Mutex::new(SharedState::default())),
        }
    }

    pub async fn connected(&self) -> bool {
        self.state.lock().await.connected
    }

    pub async fn last_error(&self) -> Option<String> {
        self.state.lock().await.last_error.clone()
    }

    async fn set_connected(&self, v: bool) {
        self.state.lock().await.connected = v;
    }

    async fn set_error(&self, e: impl Into<String>) {
        self.state.lock().await.last_error = Some(e.into());
    }

    /// Runs sessions back-to-back with exponential backoff between them
    /// until `stop` fires. Never returns before `stop` does.
    pub async fn run(&self, mut stop: watch::Receiver<bool>) {
        let mut backoff = BACKOFF_INITIAL;
        loop {
            if *stop.borrow() {
                return;
            }

            match self.run_once(&mut stop).await {
                Ok(()) => backoff = BACKOFF_INITIAL,
                Err(e) => {
                    warn!(error = %e, relay = %self.relay_addr, "reverse tunnel session ended");
                    self.set_error(e.to_string()).await;
                    self.set_connected(false).await;

                    if *stop.borrow() {
                        return;
                    }
                    tokio::select! {
                        _ = sleep(backoff) => {}
                        _ = stop.changed() => if *stop.borrow() { return; },
                    }
                    backoff = (backoff * 2).min(BACKOFF_MAX);
                    continue;
                }
            }
            self.set_connected(false).await;
        }
    }

    async fn run_once(&self, stop: &mut watch::Receiver<bool>) -> Result<()> {
        let key = common::load_key(&self.key_path)?;
        let tcp = common::dial(&self.relay_addr).await?;

        let config = Arc::new(client::Config::default());
        let handler = ForwardingHandler::new(self.local_addr.clone());
        let mut handle = timeout(
            HANDSHAKE_TIMEOUT,
            client::connect_stream(config, tcp, handler),
        )
        .await
        .map_err(|_| TwError::ssh("ssh handshake to relay timed out"))??;

        let authenticated = handle
            .authenticate_publickey(&self.user, Arc::new(key))
            .await?;
        if !authenticated {
            return Err(TwError::ssh("relay refused publickey authentication"));
        }

        handle.tcpip_forward("0.0.0.0", self.remote_port as u32).await?;
        self.set_connected(true).await;
        debug!(relay = %self.relay_addr, remote_port = self.remote_port, "reverse tunnel established");

        let dead = Arc::new(Notify::new());
        let handle = Arc::new(Mutex::new(handle));
        let keepalive = tokio::spawn(run_keepalive(handle.clone(), dead.clone()));

        tokio::select! {
            _ = stop.changed() => {}
            _ = dead.notified() => {}
        }
        keepalive.abort();
        Ok(())
    }
}

/// Every 15s, probe the session by opening and dropping a throwaway
/// channel. The Handle doesn't expose a raw global-request send, so this
/// stands in for a `keepalive@tw` ping: failure means the connection is
/// dead either way.
async fn run_keepalive(handle: Arc<Mutex<client::Handle<ForwardingHandler>>>, dead: Arc<Notify>) {
    loop {
        sleep(SSH_KEEPALIVE_INTERVAL).await;
        let mut h = handle.lock().await;
        if h.channel_open_session().await.is_err() {
            dead.notify_one();
            return;
        }
    }
}

/// Client handler for the reverse tunnel's single long-lived session: trust
/// any relay host key (spec.md §4.3) and splice every `forwarded-tcpip`
/// channel the relay hands us back to the embedded SSH server.
struct ForwardingHandler {
    local_addr: String,
}

impl ForwardingHandler {
    fn new(local_addr: String) -> Self {
        Self { local_addr }
    }
}

#[async_trait]
impl client::Handler for ForwardingHandler {
    type Error = TwError;

    async fn check_server_key(&mut self, _server_public_key: &PublicKey) -> Result<bool> {
        Ok(true)
    }

    async fn channel_open_forwarded_tcpip(
        &mut self,
        channel: Channel<Msg>,
        connected_address: &str,
        connected_port: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut Session,
    ) -> Result<()> {
        debug!(
            %connected_address,
            connected_port,
            origin = %format!("{originator_address}:{originator_port}"),
            "forwarded-tcpip accepted"
        );
        let target = self.local_addr.clone();
        tokio::spawn(async move {
            let channel_stream = channel.into_stream();
            if let Err(e) = splice_to_target(channel_stream, &target).await {
                warn!(%target, error = %e, "forwarded-tcpip copy failed");
            }
        });
        Ok(())
    }

    async fn channel_close(&mut self, _channel: ChannelId, _session: &mut Session) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fresh_tunnel_reports_disconnected() {
        let tunnel = ReverseTunnel::new(
            "127.0.0.1:59000",
            "relay",
            "/nonexistent/id_ed25519",
            2222,
            "127.0.0.1:22",
        );
        assert!(!tunnel.connected().await);
        assert!(tunnel.last_error().await.is_none());
    }

    #[tokio::test]
    async fn run_once_surfaces_dial_failure_without_panicking() {
        let tunnel = ReverseTunnel::new(
            "127.0.0.1:1",
            "relay",
            "/nonexistent/id_ed25519",
            2222,
            "127.0.0.1:22",
        );
        let (_tx, rx) = watch::channel(false);
        let mut rx2 = rx.clone();
        let err = tunnel.run_once(&mut rx2).await;
        assert!(err.is_err());
    }
}
