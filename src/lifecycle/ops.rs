//! User create/delete, serialised through one mutex alongside relay
//! mutations and config writes (spec.md §5: "the operations struct holds
//! one mutex serialising relay-mutation and user-mutation operations and
//! config mutation").

use tokio::sync::Mutex;
use tracing::warn;

use crate::config::AppConfig;
use crate::error::Result;
use crate::keystore::KeyStore;
use crate::paths::ConfigPaths;
use crate::relay::RelayControl;
use crate::users::{User, UserBundle, UserDirectory, UserMapping};

/// Everything a `CreateUser`/`DeleteUser` call touches: the user directory,
/// `authorized_keys`, and (if configured) the relay's client set. Held
/// behind one `Mutex` so two operations never interleave their filesystem
/// and relay writes.
pub struct UserOps {
    paths: ConfigPaths,
    keystore: KeyStore,
    users: UserDirectory,
    guard: Mutex<()>,
}

impl UserOps {
    pub fn new(paths: ConfigPaths) -> Self {
        let keystore = KeyStore::new(paths.clone());
        let users = UserDirectory::new(paths.clone());
        Self {
            paths,
            keystore,
            users,
            guard: Mutex::new(()),
        }
    }

    pub fn paths(&self) -> &ConfigPaths {
        &self.paths
    }

    pub fn list_users(&self) -> Result<Vec<User>> {
        self.users.list()
    }

    /// Generate UUID + key pair, register on the relay, append the
    /// `authorized_keys` line, then mark applied (spec.md §3 invariant 1).
    /// `relay` is `None` when no relay is configured — registration is
    /// skipped, the user is still usable for a directly-reachable server.
    pub async fn create_user(
        &self,
        name: &str,
        mappings: Vec<UserMapping>,
        relay: Option<&RelayControl>,
    ) -> Result<User> {
        let _guard = self.guard.lock().await;

        let (private_key_pem, pub_line) = self.keystore.generate_user_keypair()?;
        let mut user = User::new(name, mappings, pub_line.clone())?;
        self.users.save(&user, &private_key_pem)?;

        if let Some(relay) = relay {
            relay.add_users(&[user.uuid.to_string()]).await?;
        }

        self.keystore
            .append_user_key(&user.name, &pub_line, &user.mappings)?;
        self.users.mark_applied(&mut user)?;

        Ok(user)
    }

    /// Reverses all four steps of creation, relay first and best-effort,
    /// filesystem deletion last and authoritative (spec.md §3 invariant 2).
    pub async fn delete_user(&self, name: &str, relay: Option<&RelayControl>) -> Result<()> {
        let _guard = self.guard.lock().await;

        let user = self.users.load(name)?;

        if let Some(relay) = relay {
            if let Err(e) = relay.remove_users(&[user.uuid.to_string()]).await {
                warn!(user = name, error = %e, "relay user removal failed, continuing with local cleanup");
            }
        }

        self.keystore.remove_user_key(&user.pubkey)?;
        self.users.delete(name)?;
        Ok(())
    }

    /// Assembles the downloadable bundle for an already-created user:
    /// `config.yaml` + key pair, nothing else (spec.md §6).
    pub fn user_bundle(&self, name: &str, server: &AppConfig) -> Result<UserBundle> {
        let user = self.users.load(name)?;
        let key_path = self.paths.user_dir(name).join("id_ed25519");
        let private_key = std::fs::read(&key_path).map_err(|e| crate::error::TwError::io(&key_path, e))?;

        let mut client_config = AppConfig::default();
        client_config.mode = crate::config::Mode::Client;
        // Carry the relay's connection fields but not its uuid: each user
        // authenticates as their own registered identity, not the node's.
        client_config.xray = server.xray.as_ref().map(|xray| crate::config::XrayConfig {
            uuid: user.uuid.to_string(),
            relay_host: xray.relay_host.clone(),
            relay_port: xray.relay_port,
            path: xray.path.clone(),
        });
        client_config.client.ssh_user = user.name.clone();
        client_config.client.server_ssh_port = server.server.remote_port;
        client_config.client.tunnels = user
            .mappings
            .iter()
            .map(|m| crate::config::TunnelMapping {
                local_port: m.client_port,
                remote_host: "127.0.0.1".to_string(),
                remote_port: m.server_port,
            })
            .collect();

        let mut bundle = UserBundle::new();
        bundle.add("config.yaml", serde_yaml::to_string(&client_config)?.into_bytes())?;
        bundle.add("id_ed25519", private_key)?;
        bundle.add("id_ed25519.pub", user.pubkey.into_bytes())?;
        Ok(bundle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ops() -> (tempfile::TempDir, UserOps) {
        let dir = tempfile::tempdir().unwrap();
        let paths = ConfigPaths::with_root(dir.path());
        let ops = UserOps::new(paths);
        ops.keystore.ensure_keys().unwrap();
        (dir, ops)
    }

    #[tokio::test]
    async fn create_user_without_relay_is_applied_immediately() {
        let (_dir, ops) = ops();
        let mapping = UserMapping {
            client_port: 15000,
            server_port: 22000,
        };
        let user = ops.create_user("alice", vec![mapping], None).await.unwrap();
        assert!(user.applied);

        let entries = ops.keystore.load_authorized_keys().unwrap();
        assert!(entries.iter().any(|e| e.comment == "alice@tw"));
    }

    #[tokio::test]
    async fn delete_user_removes_directory_and_key_line() {
        let (_dir, ops) = ops();
        ops.create_user("bob", vec![], None).await.unwrap();
        assert_eq!(ops.list_users().unwrap().len(), 1);

        ops.delete_user("bob", None).await.unwrap();
        assert_eq!(ops.list_users().unwrap().len(), 0);
        let entries = ops.keystore.load_authorized_keys().unwrap();
        assert!(!entries.iter().any(|e| e.comment == "bob@tw"));
    }

    #[tokio::test]
    async fn bundle_contains_exactly_three_files() {
        let (_dir, ops) = ops();
        ops.create_user(
            "carol",
            vec![UserMapping {
                client_port: 15000,
                server_port: 22000,
            }],
            None,
        )
        .await
        .unwrap();

        let server_config = AppConfig::default();
        let bundle = ops.user_bundle("carol", &server_config).unwrap();
        let names: Vec<&str> = bundle.files.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["config.yaml", "id_ed25519", "id_ed25519.pub"]);
    }
}
