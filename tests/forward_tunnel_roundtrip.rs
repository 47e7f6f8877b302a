//! End-to-end: a created user's key authenticates through ForwardTunnel,
//! over EmbeddedSSH's `direct-tcpip`, to a plain TCP echo target — the
//! same path a real client/server pair drives, minus the transport engine
//! in between (spec.md §8, scenario "forward tunnel + embedded SSH +
//! local echo returns identical bytes").

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::time::{sleep, timeout};

use tunnel_whisperer::keystore::KeyStore;
use tunnel_whisperer::lifecycle::UserOps;
use tunnel_whisperer::paths::ConfigPaths;
use tunnel_whisperer::ssh::EmbeddedSsh;
use tunnel_whisperer::tunnel::ForwardTunnel;
use tunnel_whisperer::users::UserMapping;

async fn echo_server(addr: &str) {
    let listener = TcpListener::bind(addr).await.unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut conn, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                loop {
                    match conn.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => {
                            if conn.write_all(&buf[..n]).await.is_err() {
                                return;
                            }
                        }
                    }
                }
            });
        }
    });
}

#[tokio::test]
async fn round_trip_returns_identical_bytes() {
    let dir = tempfile::tempdir().unwrap();
    let paths = ConfigPaths::with_root(dir.path());
    let keystore = KeyStore::new(paths.clone());
    keystore.ensure_keys().unwrap();

    let ssh_port = 28122u16;
    let server_port = 28180u16;
    let client_port = 28181u16;

    echo_server(&format!("127.0.0.1:{server_port}")).await;

    let ops = UserOps::new(paths.clone());
    let mapping = UserMapping {
        client_port,
        server_port,
    };
    ops.create_user("alice", vec![mapping.clone()], None)
        .await
        .unwrap();

    let on_connect = Arc::new(|_user: &str| {});
    let on_disconnect = Arc::new(|_user: &str| {});
    let embedded = EmbeddedSsh::new(&keystore, ssh_port, on_connect, on_disconnect).unwrap();
    tokio::spawn(async move {
        let _ = embedded.run().await;
    });

    let key_path = paths.user_dir("alice").join("id_ed25519");
    let tunnel = ForwardTunnel::new(
        format!("127.0.0.1:{ssh_port}"),
        "alice",
        key_path,
        vec![mapping],
    );
    let (_tx, rx) = watch::channel(false);
    let tunnel_clone = tunnel.clone();
    tokio::spawn(async move { tunnel_clone.run(rx).await });

    let deadline = Duration::from_secs(10);
    let connected = timeout(deadline, async {
        loop {
            if tunnel.connected().await {
                return;
            }
            sleep(Duration::from_millis(50)).await;
        }
    })
    .await;
    assert!(connected.is_ok(), "forward tunnel never came up: {:?}", tunnel.last_error().await);

    let payload = b"the quick brown fox jumps over the lazy dog";
    let mut conn = timeout(
        Duration::from_secs(5),
        tokio::net::TcpStream::connect(format!("127.0.0.1:{client_port}")),
    )
    .await
    .unwrap()
    .unwrap();
    conn.write_all(payload).await.unwrap();

    let mut buf = vec![0u8; payload.len()];
    timeout(Duration::from_secs(5), conn.read_exact(&mut buf))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(&buf, payload);
}
