//! Request Context (spec.md §3), the Request Classifier (C3, spec.md §4.1),
//! and outbound header construction (C1, spec.md §4.2).

use std::net::SocketAddr;

use crate::error::{ProxyError, Result};
use crate::headers::{HeaderList, HeaderMiddleware, MiddlewareContext, is_hop_by_hop};

const MAX_HEADERS: usize = 64;

/// What the wire parser handed back, before the body (if any) is read.
#[derive(Debug, Clone)]
pub struct ParsedHead {
    pub method: String,
    pub raw_target: String,
    /// `1` for HTTP/1.1, `0` for HTTP/1.0, mirrored onto the outbound
    /// request line verbatim (spec.md §6).
    pub http_minor_version: u8,
    pub headers: HeaderList,
    pub content_length: Option<usize>,
    pub chunked: bool,
    pub expects_100: bool,
}

impl ParsedHead {
    pub fn protocol_version(&self) -> &'static str {
        if self.http_minor_version == 0 { "HTTP/1.0" } else { "HTTP/1.1" }
    }

    pub fn is_connect(&self) -> bool {
        self.method.eq_ignore_ascii_case("CONNECT")
    }
}

/// Parses a complete header block (request line + headers, terminated by the
/// blank line) using `httparse`, the same wire-parser dependency already
/// used elsewhere in this workspace.
pub fn parse_head(head: &[u8]) -> Result<ParsedHead> {
    let mut raw_headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut raw_headers);

    match req.parse(head).map_err(|e| ProxyError::UpstreamProtocol(e.to_string()))? {
        httparse::Status::Complete(_) => {}
        httparse::Status::Partial => return Err(ProxyError::UpstreamProtocol("incomplete request head".into())),
    }

    let method = req.method.ok_or_else(|| ProxyError::UpstreamProtocol("missing method".into()))?.to_string();
    let raw_target = req.path.ok_or_else(|| ProxyError::UpstreamProtocol("missing request target".into()))?.to_string();
    let http_minor_version = req.version.ok_or_else(|| ProxyError::UpstreamProtocol("missing version".into()))?;

    let mut headers = HeaderList::new();
    for h in req.headers.iter() {
        headers.push(h.name.to_string(), String::from_utf8_lossy(h.value).into_owned());
    }

    let chunked = headers
        .get("transfer-encoding")
        .is_some_and(|v| v.rsplit(',').next().is_some_and(|last| last.trim().eq_ignore_ascii_case("chunked")));

    let content_length = match headers.get("content-length") {
        Some(v) => {
            let n: usize = v.trim().parse().map_err(|_| ProxyError::UpstreamProtocol(format!("bad content-length: {v}")))?;
            Some(n)
        }
        None => None,
    };

    let expects_100 = headers.get("expect").is_some_and(|v| v.eq_ignore_ascii_case("100-continue"));

    Ok(ParsedHead {
        method,
        raw_target,
        http_minor_version,
        headers,
        content_length,
        chunked,
        expects_100,
    })
}

/// The outcome of the Request Classifier (C3).
#[derive(Debug, Clone)]
pub enum Target {
    /// `CONNECT host:port` — route to the tunnel engine.
    Connect { host: String, port: u16 },
    /// An absolute-URI request — route to the forward pipeline.
    Forward { url: String },
}

/// Rejects missing/origin-form targets, then routes CONNECT vs forward.
/// Does not enforce scheme — that is left to the upstream client (spec.md
/// §4.1).
pub fn classify(head: &ParsedHead) -> Result<Target> {
    if head.raw_target.is_empty() || head.raw_target.starts_with('/') {
        return Err(ProxyError::BadTarget(head.raw_target.clone()));
    }

    if head.is_connect() {
        let (host, port) = parse_authority(&head.raw_target)?;
        Ok(Target::Connect { host, port })
    } else {
        Ok(Target::Forward { url: head.raw_target.clone() })
    }
}

fn parse_authority(authority: &str) -> Result<(String, u16)> {
    // IPv6 literals are bracketed: `[::1]:443`.
    if let Some(rest) = authority.strip_prefix('[') {
        let (host, rest) = rest
            .split_once(']')
            .ok_or_else(|| ProxyError::BadTarget(authority.to_string()))?;
        let port = rest
            .strip_prefix(':')
            .ok_or_else(|| ProxyError::BadTarget(authority.to_string()))?
            .parse()
            .map_err(|_| ProxyError::BadTarget(authority.to_string()))?;
        return Ok((format!("[{host}]"), port));
    }

    let (host, port) = authority.rsplit_once(':').ok_or_else(|| ProxyError::BadTarget(authority.to_string()))?;
    let port: u16 = port.parse().map_err(|_| ProxyError::BadTarget(authority.to_string()))?;
    Ok((host.to_string(), port))
}

/// Header construction for the forward path (C1, spec.md §4.2): copy every
/// inbound header in order (stripping hop-by-hop both directions, per
/// spec.md §9's resolved open question), then run the middleware chain.
pub fn build_outbound_headers(head: &ParsedHead, remote_addr: SocketAddr, middlewares: &[Box<dyn HeaderMiddleware>]) -> HeaderList {
    let mut headers = HeaderList::new();
    for (name, value) in head.headers.iter() {
        if is_hop_by_hop(name) {
            continue;
        }
        headers.push(name.to_string(), value.to_string());
    }

    for middleware in middlewares {
        middleware.apply(MiddlewareContext { remote_addr: &remote_addr }, &mut headers);
    }

    headers
}
