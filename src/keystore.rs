//! C1 KeyStore — node identity and `authorized_keys` management
//! (spec.md §4.8).

use std::fs;
use std::os::unix::fs::PermissionsExt;

use rand::rngs::OsRng;
use russh_keys::key::PublicKey as RusshPublicKey;
use ssh_key::{rand_core::OsRng as SshOsRng, Algorithm, LineEnding, PrivateKey};

use crate::error::{Result, TwError};
use crate::paths::ConfigPaths;
use crate::users::UserMapping;

/// One parsed line of `authorized_keys`: options, key, trailing comment.
#[derive(Debug, Clone)]
pub struct AuthorizedKeyEntry {
    pub permitopen: Vec<String>,
    pub key_type: String,
    pub body: String,
    pub comment: String,
    pub key: RusshPublicKey,
}

impl AuthorizedKeyEntry {
    fn parse(line: &str) -> Option<Self> {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return None;
        }

        let mut permitopen = Vec::new();
        let mut rest = line;

        // Options field: present when the line doesn't start with a known
        // key type directly.
        if !rest.starts_with("ssh-") {
            let (opts, remainder) = rest.split_once(char::is_whitespace)?;
            for opt in opts.split(',') {
                if let Some(target) = opt.strip_prefix("permitopen=") {
                    permitopen.push(target.trim_matches('"').to_string());
                }
            }
            rest = remainder.trim_start();
        }

        let mut fields = rest.splitn(3, char::is_whitespace);
        let key_type = fields.next()?.to_string();
        let body = fields.next()?.to_string();
        let comment = fields.next().unwrap_or("").to_string();

        let key = russh_keys::parse_public_key_base64(&body).ok()?;

        Some(Self {
            permitopen,
            key_type,
            body,
            comment,
            key,
        })
    }

    /// Is `target` (`host:port`) permitted for this key's `direct-tcpip`
    /// requests? Enforced by the upstream option parser in the real
    /// product (spec.md §4.2); this mirrors that contract for our own
    /// embedded server.
    pub fn permits(&self, host: &str, port: u16) -> bool {
        if self.permitopen.is_empty() {
            return true;
        }
        let target = format!("{host}:{port}");
        self.permitopen.iter().any(|p| p == &target)
    }
}

pub struct KeyStore {
    paths: ConfigPaths,
}

impl KeyStore {
    pub fn new(paths: ConfigPaths) -> Self {
        Self { paths }
    }

    pub fn paths(&self) -> &ConfigPaths {
        &self.paths
    }

    /// Idempotent: does nothing if the node's private key already exists.
    pub fn ensure_keys(&self) -> Result<()> {
        std::fs::create_dir_all(self.paths.root()).map_err(|e| TwError::io(self.paths.root(), e))?;

        if !self.paths.node_private_key().exists() {
            let (pem, pub_line) = generate_keypair("tw-node")?;
            write_private(&self.paths.node_private_key(), &pem)?;
            write_public(&self.paths.node_public_key(), &pub_line)?;
            seed_authorized_keys(&self.paths.authorized_keys(), &pub_line)?;
        }

        self.ensure_host_key()
    }

    /// The embedded SSH server (C3) needs its own host key, independent of
    /// the node's identity key.
    pub fn ensure_host_key(&self) -> Result<()> {
        let path = self.paths.ssh_host_key();
        if path.exists() {
            return Ok(());
        }
        let (pem, _pub_line) = generate_keypair("tw-host")?;
        write_private(&path, &pem)
    }

    pub fn load_host_key(&self) -> Result<russh_keys::key::KeyPair> {
        load_keypair(&self.paths.ssh_host_key())
    }

    /// Generate a fresh ed25519 keypair for a new user, returning the PEM
    /// body (never written unencrypted anywhere but the user's directory)
    /// and the single-line OpenSSH public key.
    pub fn generate_user_keypair(&self) -> Result<(String, String)> {
        generate_keypair(&format!("tw-user-{}", uuid::Uuid::new_v4()))
    }

    /// Append one `authorized_keys` line for a user: one `permitopen` per
    /// mapping, nothing else (spec.md invariant 1).
    pub fn append_user_key(
        &self,
        user: &str,
        pub_line: &str,
        mappings: &[UserMapping],
    ) -> Result<()> {
        let line = format_authorized_line(pub_line, user, mappings);
        append_line(&self.paths.authorized_keys(), &line)
    }

    /// Remove the `authorized_keys` line whose key body matches this
    /// user's public key (spec.md §4.8: identified by the key body field,
    /// not by username — usernames aren't stored verbatim per line).
    pub fn remove_user_key(&self, pub_line: &str) -> Result<()> {
        let body = extract_body(pub_line).unwrap_or(pub_line);
        let path = self.paths.authorized_keys();
        if !path.exists() {
            return Ok(());
        }
        let content = std::fs::read_to_string(&path).map_err(|e| TwError::io(&path, e))?;
        let filtered: String = content
            .lines()
            .filter(|line| !line_contains_body(line, body))
            .map(|line| format!("{line}\n"))
            .collect();
        write_private(&path, &filtered)
    }

    /// Parse the current `authorized_keys` file. EmbeddedSSH re-reads this
    /// on start and keeps it in memory (spec.md §4.2).
    pub fn load_authorized_keys(&self) -> Result<Vec<AuthorizedKeyEntry>> {
        let path = self.paths.authorized_keys();
        if !path.exists() {
            return Ok(Vec::new());
        }
        let content = std::fs::read_to_string(&path).map_err(|e| TwError::io(&path, e))?;
        Ok(content.lines().filter_map(AuthorizedKeyEntry::parse).collect())
    }
}

fn generate_keypair(comment: &str) -> Result<(String, String)> {
    let private = PrivateKey::random(&mut SshOsRng, Algorithm::Ed25519)
        .map_err(|e| TwError::ssh(format!("key generation failed: {e}")))?;
    let pem = private
        .to_openssh(LineEnding::LF)
        .map_err(|e| TwError::ssh(format!("key encoding failed: {e}")))?
        .to_string();

    let mut public = private.public_key().clone();
    public
        .set_comment(comment);
    let pub_line = public
        .to_openssh()
        .map_err(|e| TwError::ssh(format!("public key encoding failed: {e}")))?;

    Ok((pem, pub_line))
}

fn load_keypair(path: &std::path::Path) -> Result<russh_keys::key::KeyPair> {
    russh_keys::load_secret_key(path, None)
        .map_err(|e| TwError::ssh(format!("loading {}: {e}", path.display())))
}

fn write_private(path: &std::path::Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| TwError::io(parent, e))?;
    }
    fs::write(path, contents).map_err(|e| TwError::io(path, e))?;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600)).map_err(|e| TwError::io(path, e))
}

fn write_public(path: &std::path::Path, contents: &str) -> Result<()> {
    fs::write(path, contents).map_err(|e| TwError::io(path, e))?;
    fs::set_permissions(path, fs::Permissions::from_mode(0o644)).map_err(|e| TwError::io(path, e))
}

fn seed_authorized_keys(path: &std::path::Path, pub_line: &str) -> Result<()> {
    let mut content = String::new();
    content.push_str(pub_line.trim());
    content.push('\n');
    write_private(path, &content)
}

fn append_line(path: &std::path::Path, line: &str) -> Result<()> {
    use std::io::Write;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| TwError::io(parent, e))?;
    }
    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| TwError::io(path, e))?;
    file.write_all(line.as_bytes()).map_err(|e| TwError::io(path, e))?;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600)).map_err(|e| TwError::io(path, e))
}

fn format_authorized_line(pub_line: &str, user: &str, mappings: &[UserMapping]) -> String {
    let (key_type, body) = split_type_body(pub_line);
    let options = mappings
        .iter()
        .map(|m| format!("permitopen=\"127.0.0.1:{}\"", m.server_port))
        .collect::<Vec<_>>()
        .join(",");
    format!("{options} {key_type} {body} {user}@tw\n")
}

fn split_type_body(pub_line: &str) -> (&str, &str) {
    let mut parts = pub_line.trim().splitn(3, char::is_whitespace);
    let key_type = parts.next().unwrap_or("ssh-ed25519");
    let body = parts.next().unwrap_or("");
    (key_type, body)
}

fn extract_body(pub_line: &str) -> Option<&str> {
    let (_type, body) = split_type_body(pub_line);
    if body.is_empty() {
        None
    } else {
        Some(body)
    }
}

fn line_contains_body(line: &str, body: &str) -> bool {
    line.split_whitespace().any(|field| field == body)
}

/// Kept for callers that only need the ephemeral-key path (control-mode
/// sessions never persist to disk).
pub fn ephemeral_seed() -> u64 {
    use rand::RngCore;
    OsRng.next_u64()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::users::UserMapping;

    fn store() -> (tempfile::TempDir, KeyStore) {
        let dir = tempfile::tempdir().unwrap();
        let paths = ConfigPaths::with_root(dir.path());
        (dir, KeyStore::new(paths))
    }

    #[test]
    fn ensure_keys_is_idempotent() {
        let (_dir, ks) = store();
        ks.ensure_keys().unwrap();
        let first = std::fs::read(ks.paths().node_private_key()).unwrap();
        ks.ensure_keys().unwrap();
        let second = std::fs::read(ks.paths().node_private_key()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn user_key_roundtrip_has_one_permitopen_per_mapping() {
        let (_dir, ks) = store();
        ks.ensure_keys().unwrap();
        let (_pem, pub_line) = ks.generate_user_keypair().unwrap();
        let mappings = vec![
            UserMapping {
                client_port: 15000,
                server_port: 22000,
            },
            UserMapping {
                client_port: 15001,
                server_port: 22001,
            },
        ];
        ks.append_user_key("alice", &pub_line, &mappings).unwrap();

        let entries = ks.load_authorized_keys().unwrap();
        let alice = entries
            .iter()
            .find(|e| e.comment == "alice@tw")
            .expect("alice entry present");
        assert_eq!(alice.permitopen.len(), 2);
        assert!(alice.permits("127.0.0.1", 22000));
        assert!(alice.permits("127.0.0.1", 22001));
        assert!(!alice.permits("127.0.0.1", 22002));
    }

    #[test]
    fn delete_user_removes_only_that_line() {
        let (_dir, ks) = store();
        ks.ensure_keys().unwrap();
        let (_pem_a, pub_a) = ks.generate_user_keypair().unwrap();
        let (_pem_b, pub_b) = ks.generate_user_keypair().unwrap();
        let mapping = vec![UserMapping {
            client_port: 1,
            server_port: 2,
        }];
        ks.append_user_key("alice", &pub_a, &mapping).unwrap();
        ks.append_user_key("bob", &pub_b, &mapping).unwrap();

        ks.remove_user_key(&pub_a).unwrap();

        let entries = ks.load_authorized_keys().unwrap();
        assert!(!entries.iter().any(|e| e.comment == "alice@tw"));
        assert!(entries.iter().any(|e| e.comment == "bob@tw"));
    }

    #[test]
    fn no_permitopen_means_unrestricted() {
        let entry = AuthorizedKeyEntry {
            permitopen: Vec::new(),
            key_type: "ssh-ed25519".into(),
            body: "AAAA".into(),
            comment: "tw-node@tw".into(),
            key: russh_keys::parse_public_key_base64(
                &ssh_key::PrivateKey::random(&mut SshOsRng, Algorithm::Ed25519)
                    .unwrap()
                    .public_key()
                    .to_openssh()
                    .unwrap()
                    .split_whitespace()
                    .nth(1)
                    .unwrap(),
            )
            .unwrap(),
        };
        assert!(entry.permits("127.0.0.1", 9999));
    }
}
