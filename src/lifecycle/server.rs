//! C8 LifecycleManager (server side): Keys → EmbeddedSSH → [relay]
//! Transport(server-mode) → [relay] ReverseTunnel (spec.md §4.5).

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::warn;

use crate::config::{relay_configured, AppConfig};
use crate::error::{Result, TwError};
use crate::keystore::KeyStore;
use crate::lifecycle::fsm::{Fsm, LifecycleState};
use crate::lifecycle::ops::UserOps;
use crate::paths::{transport_binary_path, ConfigPaths};
use crate::progress::{ProgressEvent, ProgressSink};
use crate::relay::presence::AdminDialTarget;
use crate::relay::{AdminSession, PresenceTracker, RelayControl};
use crate::ssh::{ConnectHook, DisconnectHook, EmbeddedSsh};
use crate::stats::TunnelStats;
use crate::transport::{build_config, ProcessEngine, TransportEngine, TransportParams};
use crate::tunnel::ReverseTunnel;

/// Restart pads the Stop phase's final `total` past its real step count so
/// a consumer watching for `step==total && status==completed` doesn't close
/// the stream between Stop and the Start that immediately follows (spec.md
/// §4.5).
const RESTART_STOP_TOTAL_PADDING: u32 = 1;
const RESTART_PAUSE: Duration = Duration::from_secs(3);

/// Where PresenceTracker's refresh should dial: the server's own long-lived
/// Transport, at `127.0.0.1:<sshPort+1>`. Cleared on stop so a refresh
/// attempted after shutdown sees "no relay" rather than a stale address.
#[derive(Clone, Default)]
struct ServerAdminSession {
    target: Arc<std::sync::Mutex<Option<AdminDialTarget>>>,
}

impl ServerAdminSession {
    fn set(&self, target: Option<AdminDialTarget>) {
        *self.target.lock().unwrap() = target;
    }
}

impl AdminSession for ServerAdminSession {
    fn dial_target(&self) -> Option<AdminDialTarget> {
        self.target.lock().unwrap().clone()
    }
}

pub struct ServerManager {
    paths: ConfigPaths,
    config: RwLock<AppConfig>,
    fsm: Mutex<Fsm>,
    keystore: KeyStore,
    pub ops: UserOps,
    admin_session: ServerAdminSession,
    presence: Arc<PresenceTracker<ServerAdminSession>>,
    embedded_task: Mutex<Option<JoinHandle<()>>>,
    transport_engine: Mutex<Option<ProcessEngine>>,
    reverse_tunnel: Mutex<Option<(ReverseTunnel, watch::Sender<bool>, JoinHandle<()>)>>,
    relay_control: Mutex<Option<Arc<RelayControl>>>,
    stats: Arc<TunnelStats>,
}

impl ServerManager {
    pub fn new(paths: ConfigPaths, config: AppConfig) -> Self {
        let admin_session = ServerAdminSession::default();
        let presence = Arc::new(PresenceTracker::new(admin_session.clone()));
        Self {
            keystore: KeyStore::new(paths.clone()),
            ops: UserOps::new(paths.clone()),
            paths,
            config: RwLock::new(config),
            fsm: Mutex::new(Fsm::default()),
            admin_session,
            presence,
            embedded_task: Mutex::new(None),
            transport_engine: Mutex::new(None),
            reverse_tunnel: Mutex::new(None),
            relay_control: Mutex::new(None),
            stats: TunnelStats::new(),
        }
    }

    pub fn presence(&self) -> Arc<PresenceTracker<ServerAdminSession>> {
        self.presence.clone()
    }

    pub fn stats(&self) -> Arc<TunnelStats> {
        self.stats.clone()
    }

    pub async fn state(&self) -> LifecycleState {
        self.fsm.lock().await.state()
    }

    pub async fn config(&self) -> AppConfig {
        self.config.read().await.clone()
    }

    pub async fn start(&self, progress: &ProgressSink) -> Result<()> {
        self.fsm.lock().await.begin_start()?;

        match self.start_inner(progress).await {
            Ok(()) => {
                self.fsm.lock().await.finish_start_ok();
                self.kick_ensure_relay_stats().await;
                Ok(())
            }
            Err(e) => {
                self.fsm.lock().await.finish_start_err();
                Err(e)
            }
        }
    }

    async fn start_inner(&self, progress: &ProgressSink) -> Result<()> {
        let mut config = self.config.read().await.clone();
        let relay = relay_configured(&config);
        let total = if relay { 4 } else { 2 };

        if relay {
            if let Some(xray) = config.xray.as_mut() {
                if xray.uuid.is_empty() {
                    xray.uuid = uuid::Uuid::new_v4().to_string();
                    config.save(&self.paths)?;
                    *self.config.write().await = config.clone();
                }
            }
        }

        progress.emit(ProgressEvent::running(1, total, "keys"));
        if let Err(e) = self.keystore.ensure_keys() {
            progress.emit(ProgressEvent::failed(1, total, "keys", e.to_string()));
            return Err(e);
        }
        progress.emit(ProgressEvent::completed(1, total, "keys"));

        progress.emit(ProgressEvent::running(2, total, "embedded_ssh"));
        if let Err(e) = self.start_embedded_ssh(&config).await {
            progress.emit(ProgressEvent::failed(2, total, "embedded_ssh", e.to_string()));
            return Err(e);
        }
        progress.emit(ProgressEvent::completed(2, total, "embedded_ssh"));

        if !relay {
            return Ok(());
        }

        progress.emit(ProgressEvent::running(3, total, "transport"));
        let params = match self.start_transport(&config).await {
            Ok(params) => params,
            Err(e) => {
                progress.emit(ProgressEvent::failed(3, total, "transport", e.to_string()));
                return Err(e);
            }
        };
        progress.emit(ProgressEvent::completed(3, total, "transport"));

        progress.emit(ProgressEvent::running(4, total, "reverse_tunnel"));
        if let Err(e) = self.start_reverse_tunnel(&config, &params).await {
            progress.emit(ProgressEvent::failed(4, total, "reverse_tunnel", e.to_string()));
            return Err(e);
        }
        progress.emit(ProgressEvent::completed(4, total, "reverse_tunnel"));

        let xray = config.xray.clone().expect("relay_configured implies xray is set");
        let relay_control = RelayControl::new(
            config.server.relay_ssh_port,
            config.server.relay_ssh_user.clone(),
            self.paths.node_private_key(),
            xray,
            transport_binary_path(),
            self.paths.transport_config("control"),
            config.proxy.url.clone(),
        );
        *self.relay_control.lock().await = Some(Arc::new(relay_control));

        Ok(())
    }

    async fn start_embedded_ssh(&self, config: &AppConfig) -> Result<()> {
        let presence = self.presence.clone();
        let stats = self.stats.clone();
        let on_disconnect: DisconnectHook = Arc::new(move |_user: &str| {
            stats.tunnel_closed(0, 0);
            let presence = presence.clone();
            tokio::spawn(async move { presence.invalidate().await });
        });
        let presence = self.presence.clone();
        let stats = self.stats.clone();
        let on_connect: ConnectHook = Arc::new(move |_user: &str| {
            stats.tunnel_started();
            let presence = presence.clone();
            tokio::spawn(async move { presence.invalidate().await });
        });

        let embedded = EmbeddedSsh::new(&self.keystore, config.server.ssh_port, on_connect, on_disconnect)?;
        let task = tokio::spawn(async move {
            if let Err(e) = embedded.run().await {
                warn!(error = %e, "embedded SSH server exited");
            }
        });
        *self.embedded_task.lock().await = Some(task);
        Ok(())
    }

    async fn start_transport(&self, config: &AppConfig) -> Result<TransportParams> {
        let xray = config
            .xray
            .as_ref()
            .ok_or_else(|| TwError::config("relay configured without xray settings"))?;
        let params = TransportParams::for_server(
            config.server.ssh_port,
            config.server.relay_ssh_port,
            xray,
            config.proxy.url.clone(),
        );
        let cfg = build_config(&params);

        let mut engine = ProcessEngine::new(transport_binary_path(), self.paths.transport_config("server"));
        engine.write_config(&cfg)?;
        engine.start().await?;
        *self.transport_engine.lock().await = Some(engine);

        self.admin_session.set(Some(AdminDialTarget {
            addr: format!("127.0.0.1:{}", params.local_port),
            user: config.server.relay_ssh_user.clone(),
            key_path: self.paths.node_private_key(),
        }));

        Ok(params)
    }

    async fn start_reverse_tunnel(&self, config: &AppConfig, params: &TransportParams) -> Result<()> {
        let relay_addr = format!("127.0.0.1:{}", params.local_port);
        let local_addr = format!("127.0.0.1:{}", config.server.ssh_port);
        let reverse = ReverseTunnel::new(
            relay_addr,
            config.server.relay_ssh_user.clone(),
            self.paths.node_private_key(),
            config.server.remote_port,
            local_addr,
        );

        let (tx, rx) = watch::channel(false);
        let task = {
            let reverse = reverse.clone();
            tokio::spawn(async move { reverse.run(rx).await })
        };
        *self.reverse_tunnel.lock().await = Some((reverse, tx, task));
        Ok(())
    }

    /// "PresenceTracker's `EnsureRelayStats` runs once" (spec.md §4.5): the
    /// relay-side stats config check lives on `RelayControl` (§4.6);
    /// primes the presence cache right after so the first `GetOnlineUsers`
    /// call doesn't pay the 20s TTL wait.
    async fn kick_ensure_relay_stats(&self) {
        let control = self.relay_control.lock().await.clone();
        let presence = self.presence.clone();
        tokio::spawn(async move {
            if let Some(control) = control {
                if let Err(e) = control.ensure_stats().await {
                    warn!(error = %e, "ensure_stats failed after start");
                }
            }
            presence.prime().await;
        });
    }

    pub async fn stop(&self, progress: &ProgressSink) -> Result<()> {
        self.stop_with_total_padding(progress, 0).await
    }

    async fn stop_with_total_padding(&self, progress: &ProgressSink, pad: u32) -> Result<()> {
        self.fsm.lock().await.begin_stop()?;

        let has_reverse = self.reverse_tunnel.lock().await.is_some();
        let has_transport = self.transport_engine.lock().await.is_some();
        let real_total = 1 + has_reverse as u32 + has_transport as u32;
        let total = real_total + pad;
        let mut step = 0u32;

        if has_reverse {
            step += 1;
            progress.emit(ProgressEvent::running(step, total, "reverse_tunnel"));
            if let Some((_tunnel, tx, task)) = self.reverse_tunnel.lock().await.take() {
                let _ = tx.send(true);
                task.abort();
            }
            progress.emit(ProgressEvent::completed(step, total, "reverse_tunnel"));
        }

        if has_transport {
            step += 1;
            progress.emit(ProgressEvent::running(step, total, "transport"));
            if let Some(mut engine) = self.transport_engine.lock().await.take() {
                if let Err(e) = engine.stop().await {
                    warn!(error = %e, "transport engine failed to stop cleanly");
                }
            }
            self.admin_session.set(None);
            progress.emit(ProgressEvent::completed(step, total, "transport"));
        }

        step += 1;
        progress.emit(ProgressEvent::running(step, total, "embedded_ssh"));
        if let Some(task) = self.embedded_task.lock().await.take() {
            task.abort();
        }
        progress.emit(ProgressEvent::completed(step, total, "embedded_ssh"));

        *self.relay_control.lock().await = None;
        self.fsm.lock().await.finish_stop();
        Ok(())
    }

    /// "Stop, pause 3s, reload config, start" as one continuous progress
    /// stream (spec.md §4.5).
    pub async fn restart(&self, progress: &ProgressSink) -> Result<()> {
        self.stop_with_total_padding(progress, RESTART_STOP_TOTAL_PADDING).await?;
        sleep(RESTART_PAUSE).await;

        let reloaded = AppConfig::load(&self.paths)?;
        *self.config.write().await = reloaded;

        self.start(progress).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server_config(ssh_port: u16) -> AppConfig {
        let mut cfg = AppConfig::default();
        cfg.mode = crate::config::Mode::Server;
        cfg.server.ssh_port = ssh_port;
        cfg
    }

    #[tokio::test]
    async fn fresh_manager_is_stopped() {
        let dir = tempfile::tempdir().unwrap();
        let paths = ConfigPaths::with_root(dir.path());
        let manager = ServerManager::new(paths, server_config(0));
        assert_eq!(manager.state().await, LifecycleState::Stopped);
    }

    #[tokio::test]
    async fn stop_before_start_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let paths = ConfigPaths::with_root(dir.path());
        let manager = ServerManager::new(paths, server_config(0));
        let sink = ProgressSink::discard();
        assert!(manager.stop(&sink).await.is_err());
    }

    #[tokio::test]
    async fn no_relay_start_runs_only_keys_and_embedded_ssh() {
        let dir = tempfile::tempdir().unwrap();
        let paths = ConfigPaths::with_root(dir.path());
        let manager = ServerManager::new(paths, server_config(23456));
        let (sink, mut rx) = ProgressSink::channel(16);

        manager.start(&sink).await.unwrap();
        assert_eq!(manager.state().await, LifecycleState::Running);

        let mut labels = Vec::new();
        while let Ok(event) = rx.try_recv() {
            labels.push(event.label);
        }
        assert!(labels.contains(&"keys".to_string()));
        assert!(labels.contains(&"embedded_ssh".to_string()));
        assert!(!labels.contains(&"transport".to_string()));

        manager.stop(&ProgressSink::discard()).await.unwrap();
        assert_eq!(manager.state().await, LifecycleState::Stopped);
    }
}
