//! C7 PresenceTracker — per-user online signal with a 20s TTL cache
//! (spec.md §4.7). Refreshes over the server's long-lived Transport (not a
//! control tunnel, no dial retries) for speed: it dials
//! `127.0.0.1:<sshPort+1>` directly, the same loopback port the server's
//! own ReverseTunnel already uses.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use russh::client;
use tokio::sync::{Mutex, RwLock};
use tracing::warn;

use crate::error::{Result, TwError};
use crate::relay::admin_api;
use crate::ssh::ClientHandler;
use crate::tunnel::common;

const CACHE_TTL: Duration = Duration::from_secs(20);

struct Cache {
    online: HashMap<String, bool>,
    fetched_at: Option<Instant>,
}

impl Default for Cache {
    fn default() -> Self {
        Self {
            online: HashMap::new(),
            fetched_at: None,
        }
    }
}

/// Where and how to reach the relay's admin API through the server's own
/// Transport. Returning `None` (no relay configured, or the server
/// Transport isn't `Running()`) makes `GetOnlineUsers` return an empty map
/// (spec.md §4.7).
#[derive(Clone)]
pub struct AdminDialTarget {
    pub addr: String,
    pub user: String,
    pub key_path: PathBuf,
}

pub trait AdminSession: Send + Sync {
    fn dial_target(&self) -> Option<AdminDialTarget>;
}

pub struct PresenceTracker<S: AdminSession> {
    session: S,
    cache: RwLock<Cache>,
    refreshing: Mutex<()>,
    /// Primed by the first traffic-counter query, per spec.md §4.7's
    /// `trafficReset` latch: that first call only resets counters and
    /// yields no usable data.
    traffic_reset_primed: Mutex<bool>,
}

impl<S: AdminSession> PresenceTracker<S> {
    pub fn new(session: S) -> Self {
        Self {
            session,
            cache: RwLock::new(Cache::default()),
            refreshing: Mutex::new(()),
            traffic_reset_primed: Mutex::new(false),
        }
    }

    /// Invalidates the cache immediately. Called from EmbeddedSSH's
    /// connect/disconnect hooks (spec.md §4.7).
    pub async fn invalidate(&self) {
        self.cache.write().await.fetched_at = None;
    }

    pub async fn get_online_users(&self) -> HashMap<String, bool> {
        {
            let cache = self.cache.read().await;
            if let Some(fetched_at) = cache.fetched_at {
                if fetched_at.elapsed() < CACHE_TTL {
                    return cache.online.clone();
                }
            }
        }

        match self.refreshing.try_lock() {
            Ok(_guard) => {
                if let Err(e) = self.refresh().await {
                    warn!(error = %e, "presence refresh failed, serving stale snapshot");
                }
            }
            Err(_) => {
                // Someone else is already refreshing; serve what's cached.
            }
        }

        self.cache.read().await.online.clone()
    }

    /// `EnsureRelayStats`-style priming call made once after server start
    /// (spec.md §4.5): warms the cache without the caller waiting on the
    /// TTL to expire first.
    pub async fn prime(&self) {
        let _ = self.get_online_users().await;
    }

    async fn refresh(&self) -> Result<()> {
        let Some(target) = self.session.dial_target() else {
            let mut cache = self.cache.write().await;
            cache.online.clear();
            cache.fetched_at = Some(Instant::now());
            return Ok(());
        };

        let online = self.query_online(&target).await?;

        let mut cache = self.cache.write().await;
        cache.online = online;
        cache.fetched_at = Some(Instant::now());
        Ok(())
    }

    async fn query_online(&self, target: &AdminDialTarget) -> Result<HashMap<String, bool>> {
        let key = common::load_key(&target.key_path)?;
        let tcp = common::dial(&target.addr).await?;
        let config = std::sync::Arc::new(client::Config::default());
        let mut handle = client::connect_stream(config, tcp, ClientHandler::new()).await?;
        let authenticated = handle
            .authenticate_publickey(&target.user, std::sync::Arc::new(key))
            .await?;
        if !authenticated {
            return Err(TwError::ssh("presence dial: publickey authentication refused"));
        }

        let channel = handle
            .channel_open_direct_tcpip(
                crate::paths::RELAY_ADMIN_HOST,
                crate::paths::RELAY_ADMIN_PORT as u32,
                "127.0.0.1",
                0,
            )
            .await?;
        let grpc_channel = admin_api::connect_over(channel.into_stream()).await?;

        let online_stats = admin_api::query_stats(grpc_channel.clone(), "online", false).await?;
        if !online_stats.is_empty() {
            return Ok(parse_online_stats(&online_stats));
        }

        let mut primed = self.traffic_reset_primed.lock().await;
        let traffic_stats = admin_api::query_stats(grpc_channel, "user>>>", true).await?;
        if !*primed {
            *primed = true;
            return Ok(HashMap::new());
        }
        Ok(parse_traffic_stats(&traffic_stats))
    }
}

/// `user>>><id>>>>online` with value > 0 marks that user online.
fn parse_online_stats(stats: &[admin_api::Stat]) -> HashMap<String, bool> {
    let mut result = HashMap::new();
    for stat in stats {
        let parts: Vec<&str> = stat.name.split(">>>").collect();
        if parts.len() >= 4 && parts[0] == "user" && parts[2] == "online" {
            result.insert(parts[1].to_string(), stat.value > 0);
        }
    }
    result
}

/// Any user with a positive uplink/downlink delta since the last reset is
/// treated as online.
fn parse_traffic_stats(stats: &[admin_api::Stat]) -> HashMap<String, bool> {
    let mut result: HashMap<String, bool> = HashMap::new();
    for stat in stats {
        let parts: Vec<&str> = stat.name.split(">>>").collect();
        if parts.len() >= 2 && parts[0] == "user" {
            let entry = result.entry(parts[1].to_string()).or_insert(false);
            *entry = *entry || stat.value > 0;
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoRelay;
    impl AdminSession for NoRelay {
        fn dial_target(&self) -> Option<AdminDialTarget> {
            None
        }
    }

    #[tokio::test]
    async fn no_relay_session_yields_empty_map() {
        let tracker = PresenceTracker::new(NoRelay);
        let online = tracker.get_online_users().await;
        assert!(online.is_empty());
    }

    #[tokio::test]
    async fn cache_is_stable_within_the_ttl_window() {
        let tracker = PresenceTracker::new(NoRelay);
        let first = tracker.get_online_users().await;
        tracker.cache.write().await.online.insert("ghost".into(), true);
        let second = tracker.get_online_users().await;
        assert_eq!(first.len(), 0);
        assert_eq!(second.len(), 1);
    }

    #[tokio::test]
    async fn invalidate_forces_a_refresh() {
        let tracker = PresenceTracker::new(NoRelay);
        tracker.get_online_users().await;
        tracker.cache.write().await.online.insert("ghost".into(), true);
        tracker.invalidate().await;
        let after = tracker.get_online_users().await;
        assert!(after.is_empty());
    }

    #[test]
    fn parses_online_marker_stats() {
        let stats = vec![
            admin_api::Stat {
                name: "user>>>alice>>>online>>>".into(),
                value: 1,
            },
            admin_api::Stat {
                name: "user>>>bob>>>online>>>".into(),
                value: 0,
            },
        ];
        let online = parse_online_stats(&stats);
        assert_eq!(online.get("alice"), Some(&true));
        assert_eq!(online.get("bob"), Some(&false));
    }

    #[test]
    fn parses_traffic_delta_stats() {
        let stats = vec![
            admin_api::Stat {
                name: "user>>>alice>>>traffic>>>uplink".into(),
                value: 42,
            },
            admin_api::Stat {
                name: "user>>>alice>>>traffic>>>downlink".into(),
                value: 0,
            },
        ];
        let online = parse_traffic_stats(&stats);
        assert_eq!(online.get("alice"), Some(&true));
    }
}
