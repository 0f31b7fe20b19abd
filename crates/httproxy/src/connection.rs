//! Per-connection handling: read a request head off the downstream socket,
//! classify it (C3), dispatch to the forward pipeline (C4/C7) or the CONNECT
//! tunnel engine (C5), render errors (C6), and loop for the next request on
//! the same connection until it should close (C8, spec.md §5's ordering
//! guarantee: "the next request is not read until the previous response is
//! done").

use std::net::SocketAddr;
use std::time::Duration;

use smol::Timer;
use smol::future;
use smol::io::{AsyncReadExt, AsyncWriteExt};
use smol::net::TcpStream;

use crate::error::{ProxyError, Result};
use crate::error_render::render_upstream_error;
use crate::headers::HeaderMiddleware;
use crate::pipeline::{self, DeferredBody, DownstreamEvent, InboundBody};
use crate::request::{self, ParsedHead, Target};
use crate::tunnel;
use crate::upstream::UpstreamClient;
use crate::util::find_subslice;

const MAX_HEADER_BYTES: usize = 32 * 1024;
const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;
const CHUNK_QUEUE_DEPTH: usize = 32;

pub struct ConnectionConfig {
    pub server_software: Option<String>,
    pub keep_alive: Duration,
}

/// Drives one downstream TCP connection through as many requests as the
/// client and `keep_alive` policy allow.
pub async fn handle_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    client: &UpstreamClient,
    middlewares: &[Box<dyn HeaderMiddleware>],
    config: &ConnectionConfig,
) -> Result<()> {
    let mut first_request = true;

    loop {
        let Some((head_bytes, pre_body)) = read_head(&mut stream, config.keep_alive, first_request).await? else {
            return Ok(());
        };
        first_request = false;

        let parsed = match request::parse_head(&head_bytes) {
            Ok(p) => p,
            Err(err) => {
                write_plain(&mut stream, 400, "Bad Request", "text/plain", format!("Bad Request: {err}")).await?;
                return Ok(());
            }
        };

        let target = match request::classify(&parsed) {
            Ok(t) => t,
            Err(ProxyError::BadTarget(uri)) => {
                write_plain(&mut stream, 404, "Not Found", "text/plain", format!("Not Found: {uri}")).await?;
                return Ok(());
            }
            Err(err) => return Err(err),
        };

        if let Target::Forward { .. } = &target {
            if parsed.chunked {
                write_plain(&mut stream, 501, "Not Implemented", "text/plain", "chunked request body not supported".to_string()).await?;
                return Ok(());
            }
        }

        match target {
            Target::Connect { host, port } => {
                return handle_connect(stream, peer, client, &host, port, pre_body).await;
            }
            Target::Forward { url } => {
                let forced_close = handle_forward(&mut stream, peer, client, middlewares, config, &parsed, &url, pre_body).await?;
                log::info!("peer={peer} {} {} -> {url}", parsed.method, parsed.protocol_version());
                if forced_close || should_close(&parsed) {
                    return Ok(());
                }
            }
        }
    }
}

async fn handle_connect(
    mut downstream: TcpStream,
    peer: SocketAddr,
    client: &UpstreamClient,
    host: &str,
    port: u16,
    pre_body: Vec<u8>,
) -> Result<()> {
    let mut upstream = match client.dial(host, port).await {
        Ok(s) => s,
        Err(err) => {
            log::debug!("peer={peer} CONNECT {host}:{port} failed: {err}");
            write_plain(&mut downstream, 502, "Bad Gateway", "text/plain", format!("CONNECT failed: {err}")).await?;
            return Ok(());
        }
    };

    if !pre_body.is_empty() {
        upstream.write_all(&pre_body).await.map_err(ProxyError::Io)?;
        upstream.flush().await.ok();
    }

    log::info!("peer={peer} CONNECT {host}:{port}");
    tunnel::run_tunnel(downstream, upstream).await
}

/// Drives one forward request to completion. Returns whether the downstream
/// connection must be closed after this response regardless of the
/// request's own keep-alive wishes (forced when the upstream response had
/// no terminal framing downstream could use while staying open, or when the
/// pipeline failed after headers were already flushed).
#[allow(clippy::too_many_arguments)]
async fn handle_forward(
    stream: &mut TcpStream,
    peer: SocketAddr,
    client: &UpstreamClient,
    middlewares: &[Box<dyn HeaderMiddleware>],
    config: &ConnectionConfig,
    parsed: &ParsedHead,
    url: &str,
    pre_body: Vec<u8>,
) -> Result<bool> {
    let outbound_headers = request::build_outbound_headers(parsed, peer, middlewares);

    // Bytes already read off the socket alongside the header block (`pre_body`)
    // belong to this request's body whichever path we take below — they must
    // never be dropped, or a body that arrives bundled with the headers would
    // desync the connection onto the next pipelined request.
    let (immediate_body, deferred_prefetched, deferred_len) = if parsed.expects_100 {
        (None, pre_body, parsed.content_length.unwrap_or(0))
    } else {
        let body = read_body_now(stream, pre_body, parsed.content_length).await?;
        (Some(body), Vec::new(), 0)
    };

    let forward_result = client
        .forward(&parsed.method, url, &outbound_headers, immediate_body.as_deref(), parsed.protocol_version())
        .await;

    let accept = parsed.headers.get("accept").map(str::to_string);

    let handle = match forward_result {
        Ok(h) => h,
        Err(err) => {
            log::debug!("peer={peer} upstream error for {url}: {err}");
            render_error_response(stream, &err, accept.as_deref(), url).await?;
            return Ok(false);
        }
    };

    let inbound_body = if parsed.expects_100 {
        InboundBody::Deferred(DeferredBody::new(stream.clone(), deferred_len, deferred_prefetched))
    } else {
        InboundBody::Sent
    };

    stream_forward_response(stream, handle, inbound_body, config, accept.as_deref(), url, parsed.http_minor_version).await
}

/// Whether the downstream writer must re-chunk-encode the body itself
/// because the upstream response carried no `Content-Length` (chunked or
/// until-close framing) — the queue only ever hands over raw decoded
/// bytes (`upstream.rs`'s decoder terminates framing on its own side), so
/// without re-chunking (or closing) downstream has no way to delimit the
/// body (spec.md §8).
enum DownstreamFraming {
    /// `Content-Length` was present upstream; chunks are written verbatim.
    Raw,
    /// No `Content-Length` upstream, but the downstream client speaks
    /// HTTP/1.1: re-chunk-encode and keep the connection alive.
    Rechunk,
    /// No `Content-Length` upstream and the downstream client is HTTP/1.0,
    /// which cannot receive `Transfer-Encoding: chunked`: stream raw bytes
    /// delimited by closing the connection after `Done`.
    RawThenClose,
}

#[allow(clippy::too_many_arguments)]
async fn stream_forward_response(
    stream: &mut TcpStream,
    handle: crate::upstream::ForwardHandle,
    inbound_body: InboundBody,
    config: &ConnectionConfig,
    accept: Option<&str>,
    url: &str,
    downstream_http_minor_version: u8,
) -> Result<bool> {
    let (tx, rx) = async_channel::bounded(CHUNK_QUEUE_DEPTH);
    let pump = smol::spawn(pipeline::run_forward_pipeline(handle, inbound_body, tx));

    let mut started = false;
    let mut framing = DownstreamFraming::Raw;
    let result: Result<()> = loop {
        match rx.recv().await {
            Ok(DownstreamEvent::Start(mut outcome)) => {
                started = true;
                if let Some(software) = &config.server_software {
                    outcome.headers.set("server", software.clone());
                }
                if !outcome.headers.contains("content-length") {
                    if downstream_http_minor_version >= 1 {
                        outcome.headers.set("transfer-encoding", "chunked");
                        framing = DownstreamFraming::Rechunk;
                    } else {
                        outcome.headers.set("connection", "close");
                        framing = DownstreamFraming::RawThenClose;
                    }
                }
                if let Err(err) = write_status_and_headers(stream, outcome.status, &outcome.reason, &outcome.headers).await {
                    break Err(err);
                }
            }
            Ok(DownstreamEvent::Chunk(chunk)) => {
                let write_result = match framing {
                    DownstreamFraming::Raw | DownstreamFraming::RawThenClose => stream.write_all(&chunk).await,
                    DownstreamFraming::Rechunk => write_chunked_piece(stream, &chunk).await,
                };
                if let Err(err) = write_result {
                    break Err(ProxyError::Io(err));
                }
            }
            Ok(DownstreamEvent::Done) => {
                if matches!(framing, DownstreamFraming::Rechunk) {
                    if let Err(err) = stream.write_all(b"0\r\n\r\n").await {
                        break Err(ProxyError::Io(err));
                    }
                }
                break Ok(());
            }
            Err(_) => break Ok(()),
        }
    };

    if let Err(err) = pump.await {
        if !started {
            render_error_response(stream, &err, accept, url).await?;
            return Ok(false);
        }
        // Headers were already flushed downstream when the pipeline failed:
        // no correcting status line can be sent, so the connection cannot
        // be reused for a further keep-alive request (spec.md §5, §7).
        return Err(err);
    }

    stream.flush().await.map_err(ProxyError::Io)?;
    result?;
    Ok(matches!(framing, DownstreamFraming::RawThenClose))
}

async fn write_chunked_piece(stream: &mut TcpStream, chunk: &[u8]) -> std::io::Result<()> {
    stream.write_all(format!("{:x}\r\n", chunk.len()).as_bytes()).await?;
    stream.write_all(chunk).await?;
    stream.write_all(b"\r\n").await
}

/// Writes the Error Renderer's (C6) output. Only reachable before any
/// response bytes have been written (spec.md §4.6's `started == false`
/// gate) — callers must not invoke this after `DownstreamEvent::Start`.
async fn render_error_response(stream: &mut TcpStream, err: &ProxyError, accept: Option<&str>, uri: &str) -> Result<()> {
    if !err.is_recoverable_as_response() {
        return Err(ProxyError::InternalInvariant(err.to_string()));
    }
    let rendered = render_upstream_error(accept, uri);
    let body = rendered.body.into_bytes();
    let mut head = format!("HTTP/1.1 {} {}\r\n", rendered.status, status_reason(rendered.status));
    if let Some(ct) = rendered.content_type {
        head.push_str(&format!("Content-Type: {ct}; charset=utf-8\r\n"));
    }
    head.push_str(&format!("Content-Length: {}\r\n\r\n", body.len()));
    stream.write_all(head.as_bytes()).await.map_err(ProxyError::Io)?;
    stream.write_all(&body).await.map_err(ProxyError::Io)?;
    stream.flush().await.map_err(ProxyError::Io)?;
    Ok(())
}

fn status_reason(status: u16) -> &'static str {
    match status {
        404 => "Not Found",
        504 => "Gateway Timeout",
        _ => "Error",
    }
}

async fn write_status_and_headers(stream: &mut TcpStream, status: u16, reason: &str, headers: &crate::headers::HeaderList) -> Result<()> {
    let mut out = format!("HTTP/1.1 {status} {reason}\r\n");
    for (name, value) in headers.iter() {
        out.push_str(name);
        out.push_str(": ");
        out.push_str(value);
        out.push_str("\r\n");
    }
    out.push_str("\r\n");
    stream.write_all(out.as_bytes()).await.map_err(ProxyError::Io)
}

async fn read_body_now(stream: &mut TcpStream, pre_body: Vec<u8>, content_length: Option<usize>) -> Result<Vec<u8>> {
    let Some(len) = content_length else {
        return Ok(Vec::new());
    };
    if len > MAX_BODY_BYTES {
        return Err(ProxyError::UpstreamProtocol(format!("request body too large: {len} bytes")));
    }
    let mut body = pre_body;
    let mut tmp = [0u8; 8192];
    while body.len() < len {
        let n = stream.read(&mut tmp).await.map_err(ProxyError::Io)?;
        if n == 0 {
            return Err(ProxyError::DownstreamLost);
        }
        body.extend_from_slice(&tmp[..n]);
    }
    body.truncate(len);
    Ok(body)
}

/// Reads bytes until a complete header block is buffered. Between requests
/// (`is_first == false`) an idle read races against `keep_alive`; a timeout
/// or clean EOF before any byte arrives ends the connection gracefully
/// rather than as an error (C8).
async fn read_head(stream: &mut TcpStream, keep_alive: Duration, is_first: bool) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
    let mut buf: Vec<u8> = Vec::with_capacity(4096);
    let mut tmp = [0u8; 4096];

    loop {
        let n = if is_first {
            stream.read(&mut tmp).await.map_err(ProxyError::Io)?
        } else {
            let read_fut = async { Some(stream.read(&mut tmp).await) };
            let timeout_fut = async {
                Timer::after(keep_alive).await;
                None
            };
            match future::or(read_fut, timeout_fut).await {
                Some(r) => r.map_err(ProxyError::Io)?,
                None => return Ok(None),
            }
        };

        if n == 0 {
            if buf.is_empty() {
                return Ok(None);
            }
            return Err(ProxyError::DownstreamLost);
        }

        buf.extend_from_slice(&tmp[..n]);
        if buf.len() > MAX_HEADER_BYTES {
            return Err(ProxyError::UpstreamProtocol("request headers too large".into()));
        }
        if let Some(pos) = find_subslice(&buf, b"\r\n\r\n") {
            let header_end = pos + 4;
            let pre_body = buf.split_off(header_end);
            return Ok(Some((buf, pre_body)));
        }
    }
}

/// Whether the connection should close after the current response, per the
/// hop-by-hop `Connection` header and HTTP/1.0 default semantics (spec.md §6).
fn should_close(parsed: &ParsedHead) -> bool {
    match parsed.headers.get("connection") {
        Some(v) if v.eq_ignore_ascii_case("close") => true,
        Some(v) if v.eq_ignore_ascii_case("keep-alive") => false,
        _ => parsed.http_minor_version == 0,
    }
}

async fn write_plain(stream: &mut TcpStream, status: u16, reason: &str, content_type: &str, body: String) -> Result<()> {
    let bytes = format!(
        "HTTP/1.1 {status} {reason}\r\nContent-Type: {content_type}; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    stream.write_all(bytes.as_bytes()).await.map_err(ProxyError::Io)?;
    stream.flush().await.map_err(ProxyError::Io)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn head(method: &str, minor: u8, connection: Option<&str>) -> ParsedHead {
        let mut raw = format!("{method} http://x/ HTTP/1.{minor}\r\nHost: x\r\n");
        if let Some(c) = connection {
            raw.push_str(&format!("Connection: {c}\r\n"));
        }
        raw.push_str("\r\n");
        request::parse_head(raw.as_bytes()).unwrap()
    }

    #[test]
    fn http11_defaults_to_keep_alive() {
        assert!(!should_close(&head("GET", 1, None)));
    }

    #[test]
    fn http10_defaults_to_close() {
        assert!(should_close(&head("GET", 0, None)));
    }

    #[test]
    fn http10_with_keep_alive_header_stays_open() {
        assert!(!should_close(&head("GET", 0, Some("keep-alive"))));
    }

    #[test]
    fn explicit_close_always_closes() {
        assert!(should_close(&head("GET", 1, Some("close"))));
    }
}
