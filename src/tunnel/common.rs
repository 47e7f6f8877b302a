//! Dial/backoff helpers shared by ReverseTunnel and ForwardTunnel — both
//! connect to the relay the same way, only what happens with the resulting
//! session differs (spec.md §4.3, §4.4).

use std::path::Path;
use std::time::Duration;

use russh_keys::key::KeyPair;
use socket2::{Socket, TcpKeepalive};
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::error::{Result, TwError};

pub(crate) const DIAL_TIMEOUT: Duration = Duration::from_secs(10);
pub(crate) const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
pub(crate) const TCP_KEEPALIVE: Duration = Duration::from_secs(30);

pub(crate) async fn dial(relay_addr: &str) -> Result<TcpStream> {
    let tcp = timeout(DIAL_TIMEOUT, TcpStream::connect(relay_addr))
        .await
        .map_err(|_| TwError::ssh("dial to relay transport timed out"))??;
    apply_keepalive(tcp)
}

fn apply_keepalive(tcp: TcpStream) -> Result<TcpStream> {
    tcp.set_nodelay(true)
        .map_err(|e| TwError::ssh(format!("set_nodelay failed: {e}")))?;
    let std_stream = tcp
        .into_std()
        .map_err(|e| TwError::ssh(format!("into_std failed: {e}")))?;
    let socket = Socket::from(std_stream);
    socket
        .set_tcp_keepalive(&TcpKeepalive::new().with_time(TCP_KEEPALIVE))
        .map_err(|e| TwError::ssh(format!("set_tcp_keepalive failed: {e}")))?;
    TcpStream::from_std(socket.into()).map_err(|e| TwError::ssh(format!("from_std failed: {e}")))
}

pub(crate) fn load_key(key_path: &Path) -> Result<KeyPair> {
    russh_keys::load_secret_key(key_path, None).map_err(TwError::from)
}

/// Graduated backoff stair used by ForwardTunnel's reconnect loop
/// (spec.md §4.4): 8 steps at 2s, 4 at 4s, 4 at 8s, 4 at 16s, then 30s
/// indefinitely. `ReverseTunnel` uses a plain doubling backoff instead
/// (spec.md §4.3) and doesn't need this.
pub(crate) struct GraduatedBackoff {
    steps: &'static [(u32, Duration)],
    step_idx: usize,
    step_count: u32,
}

impl GraduatedBackoff {
    pub(crate) fn new() -> Self {
        const STEPS: &[(u32, Duration)] = &[
            (8, Duration::from_secs(2)),
            (4, Duration::from_secs(4)),
            (4, Duration::from_secs(8)),
            (4, Duration::from_secs(16)),
        ];
        Self {
            steps: STEPS,
            step_idx: 0,
            step_count: 0,
        }
    }

    pub(crate) fn next_delay(&mut self) -> Duration {
        if self.step_idx >= self.steps.len() {
            return Duration::from_secs(30);
        }
        let (limit, delay) = self.steps[self.step_idx];
        self.step_count += 1;
        if self.step_count >= limit {
            self.step_idx += 1;
            self.step_count = 0;
        }
        delay
    }

    pub(crate) fn reset(&mut self) {
        self.step_idx = 0;
        self.step_count = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn graduated_backoff_walks_the_stair_then_plateaus() {
        let mut b = GraduatedBackoff::new();
        for _ in 0..8 {
            assert_eq!(b.next_delay(), Duration::from_secs(2));
        }
        for _ in 0..4 {
            assert_eq!(b.next_delay(), Duration::from_secs(4));
        }
        for _ in 0..4 {
            assert_eq!(b.next_delay(), Duration::from_secs(8));
        }
        for _ in 0..4 {
            assert_eq!(b.next_delay(), Duration::from_secs(16));
        }
        for _ in 0..3 {
            assert_eq!(b.next_delay(), Duration::from_secs(30));
        }
    }

    #[test]
    fn reset_returns_to_the_first_step() {
        let mut b = GraduatedBackoff::new();
        for _ in 0..20 {
            b.next_delay();
        }
        b.reset();
        assert_eq!(b.next_delay(), Duration::from_secs(2));
    }
}
