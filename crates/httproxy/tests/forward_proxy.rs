//! End-to-end coverage of the forward path (C1/C3/C4) against real loopback
//! sockets: an in-test "client" writes raw bytes at one side of a connected
//! pair, `handle_connection` drives the other side, and a tiny in-test origin
//! server stands in for the upstream.

use std::net::SocketAddr;
use std::time::Duration;

use httproxy::connection::{ConnectionConfig, handle_connection};
use httproxy::headers::build_chain;
use httproxy::upstream::UpstreamClient;
use smol::io::{AsyncReadExt, AsyncWriteExt};
use smol::net::{TcpListener, TcpStream};

async fn connected_pair() -> (TcpStream, TcpStream, SocketAddr) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let client_task = smol::spawn(async move { TcpStream::connect(addr).await.unwrap() });
    let (server_side, peer) = listener.accept().await.unwrap();
    let client_side = client_task.await;
    (server_side, client_side, peer)
}

fn default_config() -> ConnectionConfig {
    ConnectionConfig { server_software: None, keep_alive: Duration::from_millis(200) }
}

/// Reads a response head terminated by `\r\n\r\n`, then exactly
/// `Content-Length` more bytes if that header is present.
async fn read_response(stream: &mut TcpStream) -> (String, Vec<u8>) {
    let mut buf = Vec::new();
    let mut tmp = [0u8; 4096];
    let header_end = loop {
        let n = stream.read(&mut tmp).await.unwrap();
        assert!(n > 0, "peer closed before sending a full response head");
        buf.extend_from_slice(&tmp[..n]);
        if let Some(pos) = find(&buf, b"\r\n\r\n") {
            break pos + 4;
        }
    };
    let head = String::from_utf8_lossy(&buf[..header_end]).into_owned();
    let mut body = buf[header_end..].to_vec();

    let content_length = head
        .lines()
        .find(|l| l.to_ascii_lowercase().starts_with("content-length:"))
        .and_then(|l| l.split_once(':'))
        .and_then(|(_, v)| v.trim().parse::<usize>().ok());

    if let Some(len) = content_length {
        while body.len() < len {
            let n = stream.read(&mut tmp).await.unwrap();
            assert!(n > 0, "peer closed before sending the full body");
            body.extend_from_slice(&tmp[..n]);
        }
        body.truncate(len);
    }

    (head, body)
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Reads a response head, then decodes a `Transfer-Encoding: chunked` body
/// until the terminating zero-size chunk, returning the concatenated chunk
/// data.
async fn read_chunked_response(stream: &mut TcpStream) -> (String, Vec<u8>) {
    let mut buf = Vec::new();
    let mut tmp = [0u8; 4096];
    let header_end = loop {
        let n = stream.read(&mut tmp).await.unwrap();
        assert!(n > 0, "peer closed before sending a full response head");
        buf.extend_from_slice(&tmp[..n]);
        if let Some(pos) = find(&buf, b"\r\n\r\n") {
            break pos + 4;
        }
    };
    let head = String::from_utf8_lossy(&buf[..header_end]).into_owned();
    let mut rest = buf[header_end..].to_vec();

    let mut body = Vec::new();
    loop {
        while find(&rest, b"\r\n").is_none() {
            let n = stream.read(&mut tmp).await.unwrap();
            assert!(n > 0, "peer closed mid chunk-size line");
            rest.extend_from_slice(&tmp[..n]);
        }
        let line_end = find(&rest, b"\r\n").unwrap();
        let size = usize::from_str_radix(String::from_utf8_lossy(&rest[..line_end]).trim(), 16).unwrap();
        rest.drain(..line_end + 2);

        if size == 0 {
            while rest.len() < 2 {
                let n = stream.read(&mut tmp).await.unwrap();
                assert!(n > 0, "peer closed before the final chunk terminator");
                rest.extend_from_slice(&tmp[..n]);
            }
            assert_eq!(&rest[..2], b"\r\n", "missing final chunk terminator");
            break;
        }

        while rest.len() < size + 2 {
            let n = stream.read(&mut tmp).await.unwrap();
            assert!(n > 0, "peer closed mid chunk data");
            rest.extend_from_slice(&tmp[..n]);
        }
        body.extend_from_slice(&rest[..size]);
        assert_eq!(&rest[size..size + 2], b"\r\n", "missing chunk trailer CRLF");
        rest.drain(..size + 2);
    }

    (head, body)
}

/// Scenario: `GET http://<origin>/path` against an origin that answers
/// `200 OK` with a 5-byte body and a hop-by-hop `Connection` header the
/// proxy must not forward.
#[test]
fn forward_get_streams_body_and_strips_hop_headers() {
    smol::block_on(async {
        let origin_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let origin_addr = origin_listener.local_addr().unwrap();

        let origin_task = smol::spawn(async move {
            let (mut origin, _) = origin_listener.accept().await.unwrap();
            let mut buf = Vec::new();
            let mut tmp = [0u8; 4096];
            loop {
                let n = origin.read(&mut tmp).await.unwrap();
                buf.extend_from_slice(&tmp[..n]);
                if find(&buf, b"\r\n\r\n").is_some() {
                    break;
                }
            }
            origin
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\nConnection: close\r\n\r\nhello")
                .await
                .unwrap();
            origin.flush().await.unwrap();
        });

        let (server_side, mut client, peer) = connected_pair().await;
        let client_obj = UpstreamClient::new();
        let middlewares = build_chain(&[]);
        let config = default_config();

        let conn_task = smol::spawn(async move { handle_connection(server_side, peer, &client_obj, &middlewares, &config).await });

        let request = format!("GET http://127.0.0.1:{}/path HTTP/1.1\r\nHost: 127.0.0.1:{}\r\n\r\n", origin_addr.port(), origin_addr.port());
        client.write_all(request.as_bytes()).await.unwrap();
        client.flush().await.unwrap();

        let (head, body) = read_response(&mut client).await;
        assert!(head.starts_with("HTTP/1.1 200 OK\r\n"), "unexpected status line: {head}");
        assert!(!head.to_ascii_lowercase().contains("connection:"), "hop-by-hop header leaked: {head}");
        assert_eq!(body, b"hello");

        origin_task.await;
        drop(client);
        conn_task.await.unwrap();
    });
}

/// Scenario: the origin answers with no `Content-Length` at all (chunked
/// upstream framing). The proxy must give the downstream client a terminal
/// framing of its own — re-chunking the decoded body — rather than streaming
/// raw bytes with nothing to delimit them.
#[test]
fn chunked_upstream_response_is_rechunked_for_downstream() {
    smol::block_on(async {
        let origin_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let origin_addr = origin_listener.local_addr().unwrap();

        let origin_task = smol::spawn(async move {
            let (mut origin, _) = origin_listener.accept().await.unwrap();
            let mut buf = Vec::new();
            let mut tmp = [0u8; 4096];
            loop {
                let n = origin.read(&mut tmp).await.unwrap();
                buf.extend_from_slice(&tmp[..n]);
                if find(&buf, b"\r\n\r\n").is_some() {
                    break;
                }
            }
            origin
                .write_all(b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n4\r\nWiki\r\n5\r\npedia\r\n0\r\n\r\n")
                .await
                .unwrap();
            origin.flush().await.unwrap();
        });

        let (server_side, mut client, peer) = connected_pair().await;
        let client_obj = UpstreamClient::new();
        let middlewares = build_chain(&[]);
        let config = default_config();

        let conn_task = smol::spawn(async move { handle_connection(server_side, peer, &client_obj, &middlewares, &config).await });

        let request = format!("GET http://127.0.0.1:{}/path HTTP/1.1\r\nHost: 127.0.0.1:{}\r\n\r\n", origin_addr.port(), origin_addr.port());
        client.write_all(request.as_bytes()).await.unwrap();
        client.flush().await.unwrap();

        let (head, body) = read_chunked_response(&mut client).await;
        assert!(head.starts_with("HTTP/1.1 200 OK\r\n"), "unexpected status line: {head}");
        assert!(head.to_ascii_lowercase().contains("transfer-encoding: chunked"), "missing re-chunked framing: {head}");
        assert!(!head.to_ascii_lowercase().contains("content-length"), "must not claim a content-length it never had: {head}");
        assert_eq!(body, b"Wikipedia");

        origin_task.await;
        drop(client);
        conn_task.await.unwrap();
    });
}

/// Scenario: the origin flushes headers (`Content-Length: 10`) and only 3
/// of the 10 promised body bytes before its socket vanishes. Because
/// `start_response` has already fired, the proxy cannot retract the status
/// line — the downstream connection must be torn down rather than reused
/// for a further keep-alive request on a now-desynced socket.
#[test]
fn upstream_drop_mid_body_after_headers_closes_downstream_connection() {
    smol::block_on(async {
        let origin_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let origin_addr = origin_listener.local_addr().unwrap();

        let origin_task = smol::spawn(async move {
            let (mut origin, _) = origin_listener.accept().await.unwrap();
            let mut buf = Vec::new();
            let mut tmp = [0u8; 4096];
            loop {
                let n = origin.read(&mut tmp).await.unwrap();
                buf.extend_from_slice(&tmp[..n]);
                if find(&buf, b"\r\n\r\n").is_some() {
                    break;
                }
            }
            origin.write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\nabc").await.unwrap();
            origin.flush().await.unwrap();
            // `origin` drops here, taking the socket down before the other 7
            // promised body bytes ever arrive.
        });

        let (server_side, mut client, peer) = connected_pair().await;
        let client_obj = UpstreamClient::new();
        let middlewares = build_chain(&[]);
        let config = default_config();

        let conn_task = smol::spawn(async move { handle_connection(server_side, peer, &client_obj, &middlewares, &config).await });

        let request = format!("GET http://127.0.0.1:{}/path HTTP/1.1\r\nHost: 127.0.0.1:{}\r\n\r\n", origin_addr.port(), origin_addr.port());
        client.write_all(request.as_bytes()).await.unwrap();
        client.flush().await.unwrap();

        let mut received = Vec::new();
        let mut tmp = [0u8; 4096];
        loop {
            let n = client.read(&mut tmp).await.unwrap();
            if n == 0 {
                break;
            }
            received.extend_from_slice(&tmp[..n]);
        }
        let text = String::from_utf8_lossy(&received);
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"), "unexpected response: {text}");
        assert!(text.ends_with("abc"), "the 3 bytes that did arrive must still reach the client: {text}");

        origin_task.await;
        let result = conn_task.await;
        assert!(result.is_err(), "connection must be torn down rather than treated as cleanly served");
    });
}

/// Scenario: an origin-form request target (`GET /foo`) is rejected before
/// any upstream dial is attempted.
#[test]
fn origin_form_target_is_rejected_with_404() {
    smol::block_on(async {
        let (server_side, mut client, peer) = connected_pair().await;
        let client_obj = UpstreamClient::new();
        let middlewares = build_chain(&[]);
        let config = default_config();

        let conn_task = smol::spawn(async move { handle_connection(server_side, peer, &client_obj, &middlewares, &config).await });

        client.write_all(b"GET /foo HTTP/1.1\r\nHost: x\r\n\r\n").await.unwrap();
        client.flush().await.unwrap();

        let (head, _) = read_response(&mut client).await;
        assert!(head.starts_with("HTTP/1.1 404"), "unexpected status line: {head}");

        drop(client);
        conn_task.await.unwrap();
    });
}
