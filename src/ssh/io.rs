//! Shared copy-splice helper for both `direct-tcpip` (server side) and
//! `forwarded-tcpip` (client side of a reverse tunnel) channels — the
//! byte-shuffling is identical either way, only who opened the channel
//! differs (spec.md §4.2, §4.3).

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

pub(crate) async fn splice_to_target<S>(channel_stream: S, target: &str) -> std::io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let tcp = TcpStream::connect(target).await?;
    splice(channel_stream, tcp).await
}

pub(crate) async fn splice<S>(mut channel_stream: S, mut tcp: TcpStream) -> std::io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut tcp_r, mut tcp_w) = tcp.split();
    let (mut ch_r, mut ch_w) = tokio::io::split(&mut channel_stream);

    let to_channel = async {
        tokio::io::copy(&mut tcp_r, &mut ch_w).await?;
        ch_w.shutdown().await
    };
    let to_tcp = async {
        tokio::io::copy(&mut ch_r, &mut tcp_w).await?;
        tcp_w.shutdown().await
    };

    let (a, b) = tokio::join!(to_channel, to_tcp);
    a?;
    b?;
    Ok(())
}
