//! C8 LifecycleManager (client side): Keys → Transport(client-mode) →
//! ForwardTunnel (spec.md §4.5 cont.).

use std::time::Duration;

use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};

use crate::config::AppConfig;
use crate::error::{Result, TwError};
use crate::keystore::KeyStore;
use crate::lifecycle::fsm::{Fsm, LifecycleState};
use crate::paths::{transport_binary_path, ConfigPaths};
use crate::progress::{ProgressEvent, ProgressSink};
use crate::transport::{build_config, ProcessEngine, TransportEngine, TransportParams};
use crate::tunnel::ForwardTunnel;
use crate::users::UserMapping;

const TOTAL_STEPS: u32 = 3;

/// How long `start` waits for `ForwardTunnel::connected()` to flip true
/// before declaring the pipeline failed — the tunnel's own backoff loop
/// keeps retrying past this, but a manager-level `start` call needs a
/// bounded answer (spec.md §4.4: "`running` is declared once all initial
/// listeners are bound").
const CONNECT_POLL_TIMEOUT: Duration = Duration::from_secs(15);
const CONNECT_POLL_INTERVAL: Duration = Duration::from_millis(50);

pub struct ClientManager {
    paths: ConfigPaths,
    config: RwLock<AppConfig>,
    fsm: Mutex<Fsm>,
    keystore: KeyStore,
    transport_engine: Mutex<Option<ProcessEngine>>,
    forward_tunnel: Mutex<Option<(ForwardTunnel, watch::Sender<bool>, JoinHandle<()>)>>,
}

impl ClientManager {
    pub fn new(paths: ConfigPaths, config: AppConfig) -> Self {
        Self {
            keystore: KeyStore::new(paths.clone()),
            paths,
            config: RwLock::new(config),
            fsm: Mutex::new(Fsm::default()),
            transport_engine: Mutex::new(None),
            forward_tunnel: Mutex::new(None),
        }
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
                Ok(())
            }
            Err(e) => {
                self.fsm.lock().await.finish_start_err();
                Err(e)
            }
        }
    }

    async fn start_inner(&self, progress: &ProgressSink) -> Result<()> {
        let config = self.config.read().await.clone();
        config.validate_for_client()?;

        progress.emit(ProgressEvent::running(1, TOTAL_STEPS, "keys"));
        if let Err(e) = self.keystore.ensure_keys() {
            progress.emit(ProgressEvent::failed(1, TOTAL_STEPS, "keys", e.to_string()));
            return Err(e);
        }
        progress.emit(ProgressEvent::completed(1, TOTAL_STEPS, "keys"));

        progress.emit(ProgressEvent::running(2, TOTAL_STEPS, "transport"));
        let params = match self.start_transport(&config).await {
            Ok(params) => params,
            Err(e) => {
                progress.emit(ProgressEvent::failed(2, TOTAL_STEPS, "transport", e.to_string()));
                return Err(e);
            }
        };
        progress.emit(ProgressEvent::completed(2, TOTAL_STEPS, "transport"));

        progress.emit(ProgressEvent::running(3, TOTAL_STEPS, "forward_tunnel"));
        if let Err(e) = self.start_forward_tunnel(&config, &params).await {
            progress.emit(ProgressEvent::failed(3, TOTAL_STEPS, "forward_tunnel", e.to_string()));
            if let Some(mut engine) = self.transport_engine.lock().await.take() {
                let _ = engine.stop().await;
            }
            return Err(e);
        }
        progress.emit(ProgressEvent::completed(3, TOTAL_STEPS, "forward_tunnel"));

        Ok(())
    }

    async fn start_transport(&self, config: &AppConfig) -> Result<TransportParams> {
        let xray = config
            .xray
            .as_ref()
            .ok_or_else(|| TwError::config("client mode requires xray settings"))?;
        let params = TransportParams::for_client(config.client.server_ssh_port, xray, config.proxy.url.clone());
        let cfg = build_config(&params);

        let mut engine = ProcessEngine::new(transport_binary_path(), self.paths.transport_config("client"));
        engine.write_config(&cfg)?;
        engine.start().await?;
        *self.transport_engine.lock().await = Some(engine);
        Ok(params)
    }

    async fn start_forward_tunnel(&self, config: &AppConfig, params: &TransportParams) -> Result<()> {
        let remote_addr = format!("127.0.0.1:{}", params.local_port);
        let mappings: Vec<UserMapping> = config
            .client
            .tunnels
            .iter()
            .map(|t| UserMapping {
                client_port: t.local_port,
                server_port: t.remote_port,
            })
            .collect();

        let tunnel = ForwardTunnel::new(
            remote_addr,
            config.client.ssh_user.clone(),
            self.paths.node_private_key(),
            mappings,
        );

        let (tx, rx) = watch::channel(false);
        let task = {
            let tunnel = tunnel.clone();
            tokio::spawn(async move { tunnel.run(rx).await })
        };

        let deadline = Instant::now() + CONNECT_POLL_TIMEOUT;
        loop {
            if tunnel.connected().await {
                break;
            }
            if Instant::now() >= deadline {
                let last_error = tunnel.last_error().await.unwrap_or_else(|| "timed out waiting to connect".into());
                let _ = tx.send(true);
                task.abort();
                return Err(TwError::ssh(format!("forward tunnel failed to come up: {last_error}")));
            }
            sleep(CONNECT_POLL_INTERVAL).await;
        }

        *self.forward_tunnel.lock().await = Some((tunnel, tx, task));
        Ok(())
    }

    pub async fn stop(&self, progress: &ProgressSink) -> Result<()> {
        self.fsm.lock().await.begin_stop()?;

        let total = 2u32;
        progress.emit(ProgressEvent::running(1, total, "forward_tunnel"));
        if let Some((_tunnel, tx, task)) = self.forward_tunnel.lock().await.take() {
            let _ = tx.send(true);
            task.abort();
        }
        progress.emit(ProgressEvent::completed(1, total, "forward_tunnel"));

        progress.emit(ProgressEvent::running(2, total, "transport"));
        if let Some(mut engine) = self.transport_engine.lock().await.take() {
            if let Err(e) = engine.stop().await {
                tracing::warn!(error = %e, "client transport failed to stop cleanly");
            }
        }
        progress.emit(ProgressEvent::completed(2, total, "transport"));

        self.fsm.lock().await.finish_stop();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fresh_manager_is_stopped() {
        let dir = tempfile::tempdir().unwrap();
        let paths = ConfigPaths::with_root(dir.path());
        let manager = ClientManager::new(paths, AppConfig::default());
        assert_eq!(manager.state().await, LifecycleState::Stopped);
    }

    #[tokio::test]
    async fn start_without_relay_host_is_rejected_before_any_step() {
        let dir = tempfile::tempdir().unwrap();
        let paths = ConfigPaths::with_root(dir.path());
        let manager = ClientManager::new(paths, AppConfig::default());
        let sink = ProgressSink::discard();
        let err = manager.start(&sink).await.unwrap_err();
        assert!(matches!(err, TwError::Config(_)));
        assert_eq!(manager.state().await, LifecycleState::Error);
    }

    #[tokio::test]
    async fn stop_before_start_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let paths = ConfigPaths::with_root(dir.path());
        let manager = ClientManager::new(paths, AppConfig::default());
        assert!(manager.stop(&ProgressSink::discard()).await.is_err());
    }
}
