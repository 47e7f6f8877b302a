//! C6 RelayControl — every mutation of the relay's authenticated-user set
//! goes through one pattern: open Transport in control mode, SSH to the
//! relay, run the mutation inside that session, tear everything back down
//! (spec.md §4.6).

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use russh::client;
use russh::ChannelMsg;
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

use crate::config::XrayConfig;
use crate::error::{Result, TwError};
use crate::progress::{ProgressEvent, ProgressSink};
use crate::relay::{admin_api, json_doc};
use crate::ssh::ClientHandler;
use crate::transport::{build_config, ProcessEngine, TransportEngine, TransportParams};
use crate::tunnel::common;

const XRAY_CONFIG_PATH: &str = "/usr/local/etc/xray/config.json";
const DIAL_RETRIES: u32 = 15;
const DIAL_RETRY_INTERVAL: Duration = Duration::from_secs(1);
/// Longer than the reverse/forward tunnel handshake (spec.md §4.6): control
/// sessions dial a relay that may be slower to respond to than our own peer.
const CONTROL_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(15);

pub struct RelayControl {
    relay_ssh_port: u16,
    relay_ssh_user: String,
    key_path: PathBuf,
    xray: XrayConfig,
    transport_binary: PathBuf,
    transport_config_path: PathBuf,
    proxy_url: Option<String>,
}

impl RelayControl {
    pub fn new(
        relay_ssh_port: u16,
        relay_ssh_user: impl Into<String>,
        key_path: impl Into<PathBuf>,
        xray: XrayConfig,
        transport_binary: impl Into<PathBuf>,
        transport_config_path: impl Into<PathBuf>,
        proxy_url: Option<String>,
    ) -> Self {
        Self {
            relay_ssh_port,
            relay_ssh_user: relay_ssh_user.into(),
            key_path: key_path.into(),
            xray,
            transport_binary: transport_binary.into(),
            transport_config_path: transport_config_path.into(),
            proxy_url,
        }
    }

    pub async fn add_users(&self, ids: &[String]) -> Result<()> {
        self.mutate_clients(ids, true).await
    }

    pub async fn remove_users(&self, ids: &[String]) -> Result<()> {
        self.mutate_clients(ids, false).await
    }

    async fn mutate_clients(&self, ids: &[String], is_add: bool) -> Result<()> {
        let session = self.open_session().await?;
        let result = self.mutate_clients_inner(&session.handle, ids, is_add).await;
        self.close_session(session).await;
        result
    }

    async fn mutate_clients_inner(
        &self,
        handle: &client::Handle<ClientHandler>,
        ids: &[String],
        is_add: bool,
    ) -> Result<()> {
        let raw = exec_capture(handle, &format!("sudo cat {XRAY_CONFIG_PATH}")).await?;
        let mut config: serde_json::Value = serde_json::from_slice(&raw)?;

        let tag = {
            let inbound = json_doc::find_vless_inbound(&mut config)
                .ok_or_else(|| TwError::relay("relay config has no vless inbound"))?;
            if is_add {
                json_doc::add_clients(inbound, ids);
            } else {
                json_doc::remove_clients(inbound, ids);
            }
            inbound
                .get("tag")
                .and_then(serde_json::Value::as_str)
                .unwrap_or("vless-in")
                .to_string()
        };

        write_remote_file(handle, XRAY_CONFIG_PATH, &serde_json::to_vec_pretty(&config)?).await?;

        if let Err(e) = self.hot_apply(handle, &tag, ids, is_add).await {
            warn!(error = %e, "relay admin API call failed, restarting xray");
            exec_capture(handle, "sudo systemctl restart xray").await?;
        }

        Ok(())
    }

    async fn hot_apply(
        &self,
        handle: &client::Handle<ClientHandler>,
        tag: &str,
        ids: &[String],
        is_add: bool,
    ) -> Result<()> {
        let channel = handle
            .channel_open_direct_tcpip(
                crate::paths::RELAY_ADMIN_HOST,
                crate::paths::RELAY_ADMIN_PORT as u32,
                "127.0.0.1",
                0,
            )
            .await?;
        let grpc_channel = admin_api::connect_over(channel.into_stream()).await?;
        for id in ids {
            if is_add {
                admin_api::add_user(grpc_channel.clone(), tag, id).await?;
            } else {
                admin_api::remove_user(grpc_channel.clone(), tag, id).await?;
            }
        }
        Ok(())
    }

    pub async fn ensure_stats(&self) -> Result<()> {
        let session = self.open_session().await?;
        let result = self.ensure_stats_inner(&session.handle).await;
        self.close_session(session).await;
        result
    }

    async fn ensure_stats_inner(&self, handle: &client::Handle<ClientHandler>) -> Result<()> {
        let raw = exec_capture(handle, &format!("sudo cat {XRAY_CONFIG_PATH}")).await?;
        let mut config: serde_json::Value = serde_json::from_slice(&raw)?;

        let already_configured = json_doc::stats_configured(&config);
        if !already_configured {
            json_doc::ensure_stats(&mut config);
            write_remote_file(handle, XRAY_CONFIG_PATH, &serde_json::to_vec_pretty(&config)?).await?;
            exec_capture(handle, "sudo systemctl restart xray").await?;
            return Ok(());
        }

        // Config already claims stats are on; if the live API disagrees the
        // running process predates this config and needs a kick.
        let channel = handle
            .channel_open_direct_tcpip(
                crate::paths::RELAY_ADMIN_HOST,
                crate::paths::RELAY_ADMIN_PORT as u32,
                "127.0.0.1",
                0,
            )
            .await?;
        let grpc_channel = admin_api::connect_over(channel.into_stream()).await?;
        let stats = admin_api::query_stats(grpc_channel, "", false).await.unwrap_or_default();
        if stats.is_empty() {
            exec_capture(handle, "sudo systemctl restart xray").await?;
        }
        Ok(())
    }

    pub async fn read_cloud_init_log(&self, progress: &ProgressSink) -> Result<()> {
        let session = self.open_session().await?;
        let raw = exec_capture(&session.handle, "sudo cat /var/log/cloud-init-output.log").await;
        self.close_session(session).await;

        let raw = match raw {
            Ok(raw) => raw,
            Err(e) => {
                debug!(error = %e, "cloud-init log unavailable");
                return Ok(());
            }
        };
        for (i, line) in String::from_utf8_lossy(&raw).lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            progress.emit(
                ProgressEvent::running(i as u32, 0, "cloud-init").with_message(line.to_string()),
            );
        }
        Ok(())
    }

    async fn open_session(&self) -> Result<ControlSession> {
        let params = TransportParams::for_control(self.relay_ssh_port, &self.xray, self.proxy_url.clone());
        let config = build_config(&params);

        let mut engine = ProcessEngine::new(&self.transport_binary, &self.transport_config_path);
        engine.write_config(&config)?;
        engine.start().await?;

        let addr = format!("127.0.0.1:{}", params.local_port);
        let handle = match dial_with_retry(&addr, &self.key_path, &self.relay_ssh_user).await {
            Ok(handle) => handle,
            Err(e) => {
                let _ = engine.stop().await;
                return Err(e);
            }
        };

        Ok(ControlSession { engine, handle })
    }

    async fn close_session(&self, mut session: ControlSession) {
        drop(session.handle);
        if let Err(e) = session.engine.stop().await {
            warn!(error = %e, "control transport failed to stop cleanly");
        }
    }
}

struct ControlSession {
    engine: ProcessEngine,
    handle: client::Handle<ClientHandler>,
}

async fn dial_with_retry(
    addr: &str,
    key_path: &Path,
    user: &str,
) -> Result<client::Handle<ClientHandler>> {
    let key = common::load_key(key_path)?;
    let mut last_err = None;

    for attempt in 0..DIAL_RETRIES {
        match try_connect(addr, user, Arc::new(key.clone())).await {
            Ok(handle) => return Ok(handle),
            Err(e) => {
                debug!(attempt, %addr, error = %e, "control dial attempt failed");
                last_err = Some(e);
                sleep(DIAL_RETRY_INTERVAL).await;
            }
        }
    }

    Err(last_err.unwrap_or_else(|| TwError::ssh("control session dial retries exhausted")))
}

async fn try_connect(
    addr: &str,
    user: &str,
    key: Arc<russh_keys::key::KeyPair>,
) -> Result<client::Handle<ClientHandler>> {
    let tcp = common::dial(addr).await?;
    let config = Arc::new(client::Config::default());
    timeout(CONTROL_HANDSHAKE_TIMEOUT, async {
        let mut handle = client::connect_stream(config, tcp, ClientHandler::new()).await?;
        let authenticated = handle.authenticate_publickey(user, key).await?;
        if !authenticated {
            return Err(TwError::ssh("relay refused publickey authentication"));
        }
        Ok(handle)
    })
    .await
    .map_err(|_| TwError::ssh("ssh handshake to relay timed out"))?
}

async fn exec_capture(handle: &client::Handle<ClientHandler>, command: &str) -> Result<Vec<u8>> {
    let mut channel = handle.channel_open_session().await?;
    channel.exec(true, command).await?;

    let mut stdout = Vec::new();
    let mut exit_status = None;
    loop {
        match channel.wait().await {
            Some(ChannelMsg::Data { data }) => stdout.extend_from_slice(&data),
            Some(ChannelMsg::ExitStatus { exit_status: code }) => exit_status = Some(code),
            Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) => break,
            Some(_) => {}
            None => break,
        }
    }

    match exit_status {
        Some(0) | None => Ok(stdout),
        Some(code) => Err(TwError::relay(format!("`{command}` exited with status {code}"))),
    }
}

async fn write_remote_file(
    handle: &client::Handle<ClientHandler>,
    path: &str,
    content: &[u8],
) -> Result<()> {
    let mut channel = handle.channel_open_session().await?;
    channel.exec(true, format!("sudo tee {path} > /dev/null")).await?;
    channel.data(content).await?;
    channel.eof().await?;

    loop {
        match channel.wait().await {
            Some(ChannelMsg::ExitStatus { exit_status: 0 }) => return Ok(()),
            Some(ChannelMsg::ExitStatus { exit_status: code }) => {
                return Err(TwError::relay(format!("writing {path} exited with status {code}")))
            }
            Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None => return Ok(()),
            Some(_) => {}
        }
    }
}
