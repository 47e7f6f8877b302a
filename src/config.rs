//! On-disk `config.yaml` model (spec.md §6).

use serde::{Deserialize, Serialize};

use crate::error::{Result, TwError};
use crate::paths::ConfigPaths;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Server,
    Client,
    /// Unset. Open question (a) in spec.md §9: starting with neither role
    /// selected is an error at entry points, not silently resolved.
    #[serde(rename = "")]
    Unset,
}

impl Default for Mode {
    fn default() -> Self {
        Mode::Unset
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct XrayConfig {
    #[serde(default)]
    pub uuid: String,
    pub relay_host: String,
    #[serde(default = "default_relay_port")]
    pub relay_port: u16,
    #[serde(default = "default_path")]
    pub path: String,
}

fn default_relay_port() -> u16 {
    443
}

fn default_path() -> String {
    "/tw".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_ssh_port")]
    pub ssh_port: u16,
    #[serde(default)]
    pub api_port: u16,
    #[serde(default)]
    pub dashboard_port: u16,
    #[serde(default = "default_relay_ssh_port")]
    pub relay_ssh_port: u16,
    #[serde(default = "default_relay_ssh_user")]
    pub relay_ssh_user: String,
    #[serde(default = "default_remote_port")]
    pub remote_port: u16,
}

fn default_ssh_port() -> u16 {
    2222
}
fn default_relay_ssh_port() -> u16 {
    22
}
fn default_relay_ssh_user() -> String {
    "ubuntu".to_string()
}
fn default_remote_port() -> u16 {
    2222
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            ssh_port: default_ssh_port(),
            api_port: 0,
            dashboard_port: 0,
            relay_ssh_port: default_relay_ssh_port(),
            relay_ssh_user: default_relay_ssh_user(),
            remote_port: default_remote_port(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelMapping {
    pub local_port: u16,
    pub remote_host: String,
    pub remote_port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ClientConfig {
    #[serde(default = "default_ssh_user")]
    pub ssh_user: String,
    #[serde(default = "default_server_ssh_port")]
    pub server_ssh_port: u16,
    #[serde(default)]
    pub tunnels: Vec<TunnelMapping>,
}

fn default_ssh_user() -> String {
    "tw".to_string()
}
fn default_server_ssh_port() -> u16 {
    2222
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ProxyConfig {
    #[serde(default)]
    pub url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub mode: Mode,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub proxy: ProxyConfig,
    pub xray: Option<XrayConfig>,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub client: ClientConfig,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            mode: Mode::Unset,
            log_level: default_log_level(),
            proxy: ProxyConfig::default(),
            xray: None,
            server: ServerConfig::default(),
            client: ClientConfig::default(),
        }
    }
}

impl AppConfig {
    pub fn load(paths: &ConfigPaths) -> Result<Self> {
        let path = paths.config_yaml();
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(&path).map_err(|e| TwError::io(&path, e))?;
        Ok(serde_yaml::from_str(&raw)?)
    }

    pub fn save(&self, paths: &ConfigPaths) -> Result<()> {
        let path = paths.config_yaml();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| TwError::io(parent, e))?;
        }
        let raw = serde_yaml::to_string(self)?;
        std::fs::write(&path, raw).map_err(|e| TwError::io(&path, e))
    }

    /// Validate this config makes sense to start the given role.
    /// Open question (a): starting with no mode and no explicit role call
    /// is flagged here, not silently ignored.
    pub fn validate_for_server(&self) -> Result<()> {
        if self.server.relay_ssh_user.is_empty() {
            return Err(TwError::config("server.relay_ssh_user must not be empty"));
        }
        Ok(())
    }

    pub fn validate_for_client(&self) -> Result<()> {
        let xray = self
            .xray
            .as_ref()
            .ok_or_else(|| TwError::config("client mode requires xray.relay_host"))?;
        if xray.relay_host.is_empty() {
            return Err(TwError::config("relay host must be set"));
        }
        if self.client.tunnels.is_empty() {
            return Err(TwError::config("at least one mapping must be defined"));
        }
        Ok(())
    }

    /// A stable hash of the on-disk config, used by `ConfigChanged` (spec.md
    /// §4.5, invariant 6).
    pub fn content_hash(&self) -> Result<u64> {
        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};

        let raw = serde_yaml::to_string(self)?;
        let mut hasher = DefaultHasher::new();
        raw.hash(&mut hasher);
        Ok(hasher.finish())
    }
}

/// Whether a relay is configured at all (gates optional pipeline steps in
/// spec.md §4.5).
pub fn relay_configured(config: &AppConfig) -> bool {
    config
        .xray
        .as_ref()
        .map(|x| !x.relay_host.is_empty())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_yaml() {
        let mut cfg = AppConfig::default();
        cfg.mode = Mode::Server;
        cfg.xray = Some(XrayConfig {
            uuid: "abc".into(),
            relay_host: "relay.example.com".into(),
            relay_port: 443,
            path: "/tw".into(),
        });

        let dir = tempfile::tempdir().unwrap();
        let paths = ConfigPaths::with_root(dir.path());
        cfg.save(&paths).unwrap();

        let loaded = AppConfig::load(&paths).unwrap();
        assert_eq!(loaded.mode, Mode::Server);
        assert_eq!(loaded.xray.unwrap().relay_host, "relay.example.com");
    }

    #[test]
    fn missing_config_yields_default() {
        let dir = tempfile::tempdir().unwrap();
        let paths = ConfigPaths::with_root(dir.path());
        let cfg = AppConfig::load(&paths).unwrap();
        assert_eq!(cfg.mode, Mode::Unset);
    }

    #[test]
    fn content_hash_changes_with_content() {
        let a = AppConfig::default();
        let mut b = AppConfig::default();
        b.server.ssh_port = 3333;
        assert_ne!(a.content_hash().unwrap(), b.content_hash().unwrap());
    }

    #[test]
    fn client_validation_requires_relay_and_mapping() {
        let cfg = AppConfig::default();
        assert!(cfg.validate_for_client().is_err());
    }
}
