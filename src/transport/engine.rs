use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::process::{Child, Command};
use tracing::{debug, warn};

use super::{TransportEngine, TransportError};

/// Drives the transport engine binary as a child process: render config to
/// disk, spawn, poll for early exit, and keep the handle around for an
/// idempotent stop. This is the only implementation of [`TransportEngine`]
/// today; the trait exists so a future in-process engine doesn't require
/// touching `ServerManager`/`ClientManager`.
pub struct ProcessEngine {
    binary: PathBuf,
    config_path: PathBuf,
    child: Mutex<Option<Child>>,
}

impl ProcessEngine {
    pub fn new(binary: impl Into<PathBuf>, config_path: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            config_path: config_path.into(),
            child: Mutex::new(None),
        }
    }

    pub fn write_config(&self, config: &Value) -> Result<(), TransportError> {
        if let Some(parent) = self.config_path.parent() {
            std::fs::create_dir_all(parent).map_err(TransportError::ConfigWrite)?;
        }
        let raw = serde_json::to_vec_pretty(config).expect("Value always serializes");
        std::fs::write(&self.config_path, raw).map_err(TransportError::ConfigWrite)
    }
}

#[async_trait]
impl TransportEngine for ProcessEngine {
    async fn start(&mut self) -> Result<(), TransportError> {
        if self.running() {
            return Ok(());
        }

        let child = Command::new(&self.binary)
            .arg("-config")
            .arg(&self.config_path)
            .kill_on_drop(true)
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .spawn()
            .map_err(TransportError::Spawn)?;

        *self.child.lock().unwrap() = Some(child);

        // Give the engine a moment to fail fast on a bad config before we
        // report success; a long-lived process never reaches try_wait's
        // Some(_) branch here.
        tokio::time::sleep(Duration::from_millis(200)).await;

        if !self.running() {
            warn!(binary = %self.binary.display(), "transport engine exited immediately");
            return Err(TransportError::ConnectionFailed);
        }

        debug!(binary = %self.binary.display(), config = %self.config_path.display(), "transport engine started");
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), TransportError> {
        let child = self.child.lock().unwrap().take();
        if let Some(mut child) = child {
            let _ = child.start_kill();
            let _ = child.wait().await;
        }
        Ok(())
    }

    fn running(&self) -> bool {
        let mut guard = self.child.lock().unwrap();
        match guard.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn write_config_creates_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("nested/config.json");
        let engine = ProcessEngine::new("/bin/true", &config_path);
        engine.write_config(&json!({"a": 1})).unwrap();
        assert!(config_path.exists());
    }

    #[tokio::test]
    async fn stop_without_start_is_a_noop() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = ProcessEngine::new("/bin/true", dir.path().join("config.json"));
        assert!(!engine.running());
        engine.stop().await.unwrap();
    }

    #[tokio::test]
    async fn start_reports_failure_when_binary_exits_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = ProcessEngine::new("/bin/false", dir.path().join("config.json"));
        engine.write_config(&json!({})).unwrap();
        assert!(engine.start().await.is_err());
    }
}
