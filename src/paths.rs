//! Process-wide config root resolution (spec.md §6, §9).
//!
//! `TW_CONFIG_DIR` overrides the platform default. This is the single place
//! that touches the environment for this purpose — callers ask `ConfigPaths`
//! for a path, they never read `TW_CONFIG_DIR` themselves.

use std::path::{Path, PathBuf};

/// The relay's administrative API is always reached through the tunnel to
/// `127.0.0.1`, never routed — see spec.md §6 and §9.
pub const RELAY_ADMIN_HOST: &str = "127.0.0.1";
pub const RELAY_ADMIN_PORT: u16 = 10085;

#[cfg(unix)]
const DEFAULT_CONFIG_ROOT: &str = "/etc/tw/config";
#[cfg(windows)]
const DEFAULT_CONFIG_ROOT: &str = r"C:\ProgramData\tw\config";

/// Resolved on-disk layout under the config root.
#[derive(Debug, Clone)]
pub struct ConfigPaths {
    root: PathBuf,
}

impl ConfigPaths {
    /// Resolve the config root once: `TW_CONFIG_DIR` if set, else the
    /// platform default.
    pub fn resolve() -> Self {
        let root = std::env::var_os("TW_CONFIG_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_ROOT));
        Self { root }
    }

    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config_yaml(&self) -> PathBuf {
        self.root.join("config.yaml")
    }

    pub fn node_private_key(&self) -> PathBuf {
        self.root.join("id_ed25519")
    }

    pub fn node_public_key(&self) -> PathBuf {
        self.root.join("id_ed25519.pub")
    }

    pub fn authorized_keys(&self) -> PathBuf {
        self.root.join("authorized_keys")
    }

    pub fn ssh_host_key(&self) -> PathBuf {
        self.root.join("ssh_host_ed25519_key")
    }

    pub fn users_dir(&self) -> PathBuf {
        self.root.join("users")
    }

    pub fn user_dir(&self, name: &str) -> PathBuf {
        self.users_dir().join(name)
    }

    pub fn relay_dir(&self) -> PathBuf {
        self.root.join("relay")
    }

    pub fn relay_terraform_state(&self) -> PathBuf {
        self.relay_dir().join("terraform.tfstate")
    }

    pub fn relay_manual_marker(&self) -> PathBuf {
        self.relay_dir().join("manual-relay.json")
    }

    pub fn archive_dir(&self, domain: &str) -> PathBuf {
        self.root.join("archive").join(domain)
    }

    /// Rendered JSON config for one transport-engine instance. `role` is a
    /// short tag (`"server"`, `"client"`, `"control"`) — control-mode
    /// instances share one path since only one ever runs at a time.
    pub fn transport_config(&self, role: &str) -> PathBuf {
        self.root.join("transport").join(format!("{role}.json"))
    }
}

impl Default for ConfigPaths {
    fn default() -> Self {
        Self::resolve()
    }
}

/// Path to the transport-engine binary. `TW_TRANSPORT_BINARY` overrides the
/// default, which assumes it's on `PATH` like the node's own identity key
/// path assumes a resolved config root.
pub fn transport_binary_path() -> PathBuf {
    std::env::var_os("TW_TRANSPORT_BINARY")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("xray"))
}
