//! C5 ForwardTunnel — the client-side leg: dial the server's embedded SSH
//! through the local client-mode Transport, then bind one local listener
//! per port mapping and splice every accepted connection through a
//! `direct-tcpip` channel on the shared session (spec.md §4.4).

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use russh::client;
use tokio::net::TcpListener;
use tokio::sync::{watch, Mutex, Notify};
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

use crate::error::{Result, TwError};
use crate::ssh::io::splice;
use crate::ssh::ClientHandler;
use crate::tunnel::common::{self, GraduatedBackoff, HANDSHAKE_TIMEOUT};
use crate::users::UserMapping;

const SSH_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(15);

#[derive(Default)]
struct SharedState {
    /// true only while every mapping's accept loop is alive.
    connected: bool,
    last_error: Option<String>,
}

/// Dials `remote_addr` (a loopback address into the local client-mode
/// Transport instance), authenticates as `user`, then binds a
/// `127.0.0.1:client_port` listener for every mapping. Open question (c)
/// in spec.md §9: if any one listener fails to bind, the whole session is
/// torn down rather than running the mappings that did succeed.
#[derive(Clone)]
pub struct ForwardTunnel {
    remote_addr: String,
    user: String,
    key_path: PathBuf,
    mappings: Vec<UserMapping>,
    state: Arc<Mutex<SharedState>>,
}

impl ForwardTunnel {
    pub fn new(
        remote_addr: impl Into<String>,
        user: impl Into<String>,
        key_path: impl Into<PathBuf>,
        mappings: Vec<UserMapping>,
    ) -> Self {
        Self {
            remote_addr: remote_addr.into(),
            user: user.into(),
            key_path: key_path.into(),
            mappings,
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

    /// Runs sessions back-to-back along the graduated backoff stair
    /// (spec.md §4.4) until `stop` fires.
    pub async fn run(&self, mut stop: watch::Receiver<bool>) {
        let mut backoff = GraduatedBackoff::new();
        loop {
            if *stop.borrow() {
                return;
            }

            match self.run_once(&mut stop).await {
                Ok(()) => backoff.reset(),
                Err(e) => {
                    warn!(error = %e, remote = %self.remote_addr, "forward tunnel session ended");
                    self.set_error(e.to_string()).await;
                }
            }
            self.set_connected(false).await;

            if *stop.borrow() {
                return;
            }
            tokio::select! {
                _ = sleep(backoff.next_delay()) => {}
                _ = stop.changed() => if *stop.borrow() { return; },
            }
        }
    }

    async fn run_once(&self, stop: &mut watch::Receiver<bool>) -> Result<()> {
        if self.mappings.is_empty() {
            return Err(TwError::config("forward tunnel has no port mappings"));
        }

        let key = common::load_key(&self.key_path)?;
        let tcp = common::dial(&self.remote_addr).await?;

        let config = Arc::new(client::Config::default());
        let handle = timeout(
            HANDSHAKE_TIMEOUT,
            client::connect_stream(config, tcp, ClientHandler::new()),
        )
        .await
        .map_err(|_| TwError::ssh("ssh handshake to server timed out"))??;

        let mut handle = handle;
        let authenticated = handle
            .authenticate_publickey(&self.user, Arc::new(key))
            .await?;
        if !authenticated {
            return Err(TwError::ssh("server refused publickey authentication"));
        }

        let mut listeners = Vec::with_capacity(self.mappings.len());
        for mapping in &self.mappings {
            let addr = format!("127.0.0.1:{}", mapping.client_port);
            let listener = TcpListener::bind(&addr)
                .await
                .map_err(|e| TwError::ssh(format!("bind {addr} failed: {e}")))?;
            listeners.push((listener, mapping.server_port));
        }

        self.set_connected(true).await;
        debug!(remote = %self.remote_addr, mappings = self.mappings.len(), "forward tunnel established");

        let dead = Arc::new(Notify::new());
        let handle = Arc::new(Mutex::new(handle));
        let keepalive = tokio::spawn(run_keepalive(handle.clone(), dead.clone()));

        let mut accept_tasks = Vec::with_capacity(listeners.len());
        for (listener, server_port) in listeners {
            let handle = handle.clone();
            let dead = dead.clone();
            accept_tasks.push(tokio::spawn(accept_loop(listener, server_port, handle, dead)));
        }

        tokio::select! {
            _ = stop.changed() => {}
            _ = dead.notified() => {}
        }
        // On a dead session, every listener closes before the connection
        // itself is dropped (spec.md §4.4): abort the accept loops first,
        // then the keepalive, then let `handle` drop at the end of scope.
        for task in accept_tasks {
            task.abort();
        }
        keepalive.abort();
        Ok(())
    }
}

/// Every 15s, probe the session by opening and dropping a throwaway
/// channel, same as `reverse.rs`'s keepalive — the Handle doesn't expose a
/// raw global-request send, so this stands in for a `keepalive@tw` ping.
async fn run_keepalive(handle: Arc<Mutex<client::Handle<ClientHandler>>>, dead: Arc<Notify>) {
    loop {
        sleep(SSH_KEEPALIVE_INTERVAL).await;
        let mut h = handle.lock().await;
        if h.channel_open_session().await.is_err() {
            dead.notify_one();
            return;
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    server_port: u16,
    handle: Arc<Mutex<client::Handle<ClientHandler>>>,
    dead: Arc<Notify>,
) {
    loop {
        let (conn, origin) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                warn!(error = %e, "forward tunnel accept loop died");
                dead.notify_one();
                return;
            }
        };

        let channel = {
            let h = handle.lock().await;
            h.channel_open_direct_tcpip(
                "127.0.0.1",
                server_port as u32,
                &origin.ip().to_string(),
                origin.port() as u32,
            )
            .await
        };
        let channel = match channel {
            Ok(channel) => channel,
            Err(e) => {
                warn!(error = %e, server_port, "direct-tcpip open failed, tearing down session");
                dead.notify_one();
                return;
            }
        };

        tokio::spawn(async move {
            let channel_stream = channel.into_stream();
            if let Err(e) = splice(channel_stream, conn).await {
                warn!(server_port, error = %e, "forward tunnel copy failed");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fresh_tunnel_reports_disconnected() {
        let tunnel = ForwardTunnel::new(
            "127.0.0.1:54001",
            "relay",
            "/nonexistent/id_ed25519",
            vec![UserMapping {
                client_port: 18022,
                server_port: 22,
            }],
        );
        assert!(!tunnel.connected().await);
        assert!(tunnel.last_error().await.is_none());
    }

    #[tokio::test]
    async fn run_once_rejects_empty_mappings() {
        let tunnel = ForwardTunnel::new("127.0.0.1:54001", "relay", "/nonexistent/id_ed25519", vec![]);
        let (_tx, rx) = watch::channel(false);
        let mut rx2 = rx.clone();
        let err = tunnel.run_once(&mut rx2).await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn run_once_surfaces_dial_failure_without_panicking() {
        let tunnel = ForwardTunnel::new(
            "127.0.0.1:1",
            "relay",
            "/nonexistent/id_ed25519",
            vec![UserMapping {
                client_port: 18022,
                server_port: 22,
            }],
        );
        let (_tx, rx) = watch::channel(false);
        let mut rx2 = rx.clone();
        let err = tunnel.run_once(&mut rx2).await;
        assert!(err.is_err());
    }
}
