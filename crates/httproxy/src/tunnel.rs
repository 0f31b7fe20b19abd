//! The CONNECT Tunnel Engine (C5, spec.md §4.5), grounded on the
//! `rproxy::start::tunnel` race-then-half-close pattern: a single EOF in
//! either direction must not truncate the other, still-flowing direction.

use std::net::Shutdown;

use smol::future;
use smol::io::AsyncWriteExt;
use smol::net::TcpStream;

use crate::error::{ProxyError, Result};

/// Writes the 200 status line that turns the downstream connection into an
/// opaque tunnel, then copies bytes in both directions until each side has
/// seen EOF. Idempotent with respect to the connection it was given: called
/// once per CONNECT, it owns `downstream` for the remainder of its life.
pub async fn run_tunnel(mut downstream: TcpStream, upstream: TcpStream) -> Result<()> {
    downstream
        .write_all(b"HTTP/1.1 200 Connection established\r\n\r\n")
        .await
        .map_err(ProxyError::Io)?;
    downstream.flush().await.map_err(ProxyError::Io)?;

    copy_bidirectional(downstream, upstream).await
}

/// Races the two copy directions; whichever finishes first half-closes its
/// destination for writes and waits for the other direction to drain,
/// preserving TCP half-close semantics instead of truncating a still-open
/// side (spec.md §4.5's "teardown symmetry" invariant).
async fn copy_bidirectional(downstream: TcpStream, upstream: TcpStream) -> Result<()> {
    let down_rx = downstream.clone();
    let down_tx = downstream.clone();
    let up_rx = upstream.clone();
    let up_tx = upstream.clone();

    let mut down_to_up = smol::spawn(async move { smol::io::copy(down_rx, up_tx).await });
    let mut up_to_down = smol::spawn(async move { smol::io::copy(up_rx, down_tx).await });

    enum Finished {
        DownToUp,
        UpToDown,
    }

    let (finished, first) = future::race(
        async { (Finished::DownToUp, (&mut down_to_up).await) },
        async { (Finished::UpToDown, (&mut up_to_down).await) },
    )
    .await;

    match finished {
        Finished::DownToUp => {
            let _ = upstream.shutdown(Shutdown::Write);
            let _ = up_to_down.await;
        }
        Finished::UpToDown => {
            let _ = downstream.shutdown(Shutdown::Write);
            let _ = down_to_up.await;
        }
    }

    first.map(|_| ()).map_err(|_| ProxyError::TunnelPeerClosed)
}

#[cfg(test)]
mod tests {
    use smol::io::{AsyncReadExt, AsyncWriteExt};
    use smol::net::{TcpListener, TcpStream};

    use super::*;

    #[test]
    fn tunnel_sends_established_then_pipes_bytes_both_ways() {
        smol::block_on(async {
            let down_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let down_addr = down_listener.local_addr().unwrap();
            let up_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let up_addr = up_listener.local_addr().unwrap();

            let client_task = smol::spawn(async move { TcpStream::connect(down_addr).await.unwrap() });
            let (downstream, _) = down_listener.accept().await.unwrap();
            let mut client = client_task.await;

            let origin_task = smol::spawn(async move { TcpStream::connect(up_addr).await.unwrap() });
            let (upstream, _) = up_listener.accept().await.unwrap();
            let mut origin = origin_task.await;

            let tunnel_task = smol::spawn(async move { run_tunnel(downstream, upstream).await });

            let mut established = [0u8; 39];
            client.read_exact(&mut established).await.unwrap();
            assert_eq!(&established, b"HTTP/1.1 200 Connection established\r\n\r\n");

            client.write_all(b"client-hello").await.unwrap();
            let mut buf = [0u8; 12];
            origin.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"client-hello");

            origin.write_all(b"origin-hello").await.unwrap();
            let mut buf = [0u8; 12];
            client.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"origin-hello");

            drop(client);
            drop(origin);
            let _ = tunnel_task.await;
        });
    }
}
