//! The Upstream Client Contract (C2, spec.md §4.3), satisfied directly on
//! `smol::net::TcpStream` with `httparse`-driven incremental response
//! decoding, rather than wrapping a blocking client like `ureq` (see
//! DESIGN.md for why that dependency was dropped).

use smol::io::{AsyncReadExt, AsyncWriteExt};
use smol::net::TcpStream;

use crate::error::{ProxyError, Result};
use crate::headers::HeaderList;
use crate::util::find_subslice;

/// An event out of the incremental response decoder, mirroring the
/// `data_processed` event table of spec.md §4.4.
#[derive(Debug)]
pub enum Event {
    /// Upstream sent an interim `100 Continue` status line.
    Interim100,
    /// The final status line and headers are available.
    HeadersComplete { status: u16, reason: String, headers: HeaderList },
    /// The next slice of response body, in wire order.
    BodyChunk(Vec<u8>),
    /// The response is fully received.
    MessageComplete,
}

enum ChunkedState {
    Size,
    Data(usize),
    Trailer,
}

enum BodyFraming {
    ContentLength(usize),
    Chunked(ChunkedState),
    UntilClose,
}

enum DecoderState {
    Head,
    Body(BodyFraming),
    Done,
}

/// Pure (no I/O) incremental HTTP/1.x response parser. Kept separate from
/// the socket so the framing logic can be exercised with plain byte slices.
struct ResponseDecoder {
    buf: Vec<u8>,
    state: DecoderState,
}

impl ResponseDecoder {
    fn new() -> Self {
        Self { buf: Vec::new(), state: DecoderState::Head }
    }

    fn feed(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    fn on_eof(&mut self) -> Result<()> {
        match self.state {
            DecoderState::Body(BodyFraming::UntilClose) => {
                self.state = DecoderState::Done;
                Ok(())
            }
            DecoderState::Done => Ok(()),
            _ => Err(ProxyError::UpstreamUnreachable("upstream closed connection unexpectedly".into())),
        }
    }

    /// Returns the next event decodable purely from already-buffered bytes,
    /// or `None` when more bytes must be read off the socket first.
    fn poll_event(&mut self) -> Result<Option<Event>> {
        loop {
            match &mut self.state {
                DecoderState::Head => {
                    let Some(header_end) = find_subslice(&self.buf, b"\r\n\r\n") else {
                        return Ok(None);
                    };
                    let head_bytes: Vec<u8> = self.buf.drain(..header_end + 4).collect();
                    let (status, reason, headers) = parse_response_head(&head_bytes)?;

                    if status == 100 {
                        self.state = DecoderState::Head;
                        return Ok(Some(Event::Interim100));
                    }

                    let chunked = headers.get("transfer-encoding").is_some_and(|v| {
                        v.rsplit(',').next().is_some_and(|last| last.trim().eq_ignore_ascii_case("chunked"))
                    });
                    let content_length = headers.get("content-length").and_then(|v| v.trim().parse::<usize>().ok());

                    self.state = if chunked {
                        DecoderState::Body(BodyFraming::Chunked(ChunkedState::Size))
                    } else {
                        match content_length {
                            Some(0) => DecoderState::Done,
                            Some(len) => DecoderState::Body(BodyFraming::ContentLength(len)),
                            None => DecoderState::Body(BodyFraming::UntilClose),
                        }
                    };
                    return Ok(Some(Event::HeadersComplete { status, reason, headers }));
                }
                DecoderState::Body(BodyFraming::ContentLength(remaining)) => {
                    if *remaining == 0 {
                        self.state = DecoderState::Done;
                        continue;
                    }
                    if self.buf.is_empty() {
                        return Ok(None);
                    }
                    let take = (*remaining).min(self.buf.len());
                    let chunk: Vec<u8> = self.buf.drain(..take).collect();
                    *remaining -= take;
                    return Ok(Some(Event::BodyChunk(chunk)));
                }
                DecoderState::Body(BodyFraming::UntilClose) => {
                    if self.buf.is_empty() {
                        return Ok(None);
                    }
                    return Ok(Some(Event::BodyChunk(std::mem::take(&mut self.buf))));
                }
                DecoderState::Body(BodyFraming::Chunked(chunk_state)) => match chunk_state {
                    ChunkedState::Size => {
                        let Some(pos) = find_subslice(&self.buf, b"\r\n") else {
                            return Ok(None);
                        };
                        let line: Vec<u8> = self.buf.drain(..pos + 2).collect();
                        let size_str = std::str::from_utf8(&line[..line.len() - 2]).unwrap_or("").split(';').next().unwrap_or("").trim();
                        let size = usize::from_str_radix(size_str, 16)
                            .map_err(|_| ProxyError::UpstreamProtocol(format!("bad chunk size: {size_str}")))?;
                        *chunk_state = if size == 0 { ChunkedState::Trailer } else { ChunkedState::Data(size) };
                    }
                    ChunkedState::Data(remaining) => {
                        if *remaining == 0 {
                            if self.buf.len() < 2 {
                                return Ok(None);
                            }
                            self.buf.drain(..2);
                            *chunk_state = ChunkedState::Size;
                            continue;
                        }
                        if self.buf.is_empty() {
                            return Ok(None);
                        }
                        let take = (*remaining).min(self.buf.len());
                        let chunk: Vec<u8> = self.buf.drain(..take).collect();
                        *remaining -= take;
                        return Ok(Some(Event::BodyChunk(chunk)));
                    }
                    ChunkedState::Trailer => {
                        if let Some(pos) = find_subslice(&self.buf, b"\r\n\r\n") {
                            self.buf.drain(..pos + 4);
                            self.state = DecoderState::Done;
                            continue;
                        }
                        if self.buf.starts_with(b"\r\n") {
                            self.buf.drain(..2);
                            self.state = DecoderState::Done;
                            continue;
                        }
                        return Ok(None);
                    }
                },
                DecoderState::Done => return Ok(Some(Event::MessageComplete)),
            }
        }
    }
}

fn parse_response_head(head: &[u8]) -> Result<(u16, String, HeaderList)> {
    let mut raw_headers = [httparse::EMPTY_HEADER; 64];
    let mut resp = httparse::Response::new(&mut raw_headers);
    match resp.parse(head).map_err(|e| ProxyError::UpstreamProtocol(e.to_string()))? {
        httparse::Status::Complete(_) => {}
        httparse::Status::Partial => return Err(ProxyError::UpstreamProtocol("incomplete response head".into())),
    }
    let status = resp.code.ok_or_else(|| ProxyError::UpstreamProtocol("missing status code".into()))?;
    let reason = resp.reason.unwrap_or("").to_string();
    let mut headers = HeaderList::new();
    for h in resp.headers.iter() {
        headers.push(h.name.to_string(), String::from_utf8_lossy(h.value).into_owned());
    }
    Ok((status, reason, headers))
}

/// A live request/response cycle against an upstream origin server.
pub struct ForwardHandle {
    stream: TcpStream,
    decoder: ResponseDecoder,
}

impl ForwardHandle {
    fn new(stream: TcpStream) -> Self {
        Self { stream, decoder: ResponseDecoder::new() }
    }

    /// Writes bytes directly to the upstream transport — used for the
    /// deferred Expect-Continue body upload (spec.md §4.7).
    pub async fn transport_write(&mut self, bytes: &[u8]) -> Result<()> {
        self.stream.write_all(bytes).await.map_err(|e| ProxyError::UpstreamUnreachable(e.to_string()))?;
        self.stream.flush().await.ok();
        Ok(())
    }

    /// Drives the decoder, reading more bytes off the socket only when the
    /// already-buffered bytes cannot produce another event.
    pub async fn next_event(&mut self) -> Result<Event> {
        let mut read_buf = [0u8; 8192];
        loop {
            if let Some(event) = self.decoder.poll_event()? {
                return Ok(event);
            }
            let n = self.stream.read(&mut read_buf).await.map_err(|e| ProxyError::UpstreamProtocol(e.to_string()))?;
            if n == 0 {
                self.decoder.on_eof()?;
                continue;
            }
            self.decoder.feed(&read_buf[..n]);
        }
    }
}

/// A parsed `http://host[:port]/path?query` absolute URI. Only `http` is
/// supported — the classifier (C3) does not enforce scheme, so an
/// unsupported scheme surfaces here as an `UpstreamProtocol` error instead
/// (spec.md §4.1: "The classifier does not enforce scheme").
struct UpstreamUrl {
    host: String,
    port: u16,
    path_and_query: String,
}

impl UpstreamUrl {
    fn parse(url: &str) -> Result<Self> {
        let rest = url.strip_prefix("http://").ok_or_else(|| {
            ProxyError::UpstreamProtocol(format!("unsupported or missing scheme in target: {url}"))
        })?;

        let (authority, path_and_query) = match rest.find('/') {
            Some(idx) => (&rest[..idx], rest[idx..].to_string()),
            None => (rest, "/".to_string()),
        };

        let (host, port) = if let Some(after_bracket) = authority.strip_prefix('[') {
            let (host, remainder) = after_bracket
                .split_once(']')
                .ok_or_else(|| ProxyError::UpstreamProtocol(format!("malformed IPv6 authority: {authority}")))?;
            let port = remainder
                .strip_prefix(':')
                .map(|p| p.parse::<u16>().map_err(|_| ProxyError::UpstreamProtocol(format!("bad port: {p}"))))
                .transpose()?
                .unwrap_or(80);
            (format!("[{host}]"), port)
        } else if let Some((host, port)) = authority.rsplit_once(':') {
            let port = port.parse().map_err(|_| ProxyError::UpstreamProtocol(format!("bad port: {port}")))?;
            (host.to_string(), port)
        } else {
            (authority.to_string(), 80)
        };

        if host.is_empty() {
            return Err(ProxyError::UpstreamProtocol(format!("missing host in target: {url}")));
        }

        Ok(Self { host, port, path_and_query })
    }

    fn host_header(&self) -> String {
        if self.port == 80 { self.host.clone() } else { format!("{}:{}", self.host, self.port) }
    }
}

pub struct UpstreamClient;

impl UpstreamClient {
    pub fn new() -> Self {
        Self
    }

    /// Opens a bare TCP connection for a CONNECT tunnel (C5). No HTTP
    /// request is ever written on it — "dial without a request" is
    /// structural here rather than a callback suppressing one (spec.md §9).
    /// `host` may be bracketed (`[::1]`) or bare; brackets are stripped
    /// before resolution.
    pub async fn dial(&self, host: &str, port: u16) -> Result<TcpStream> {
        let host = host.trim_start_matches('[').trim_end_matches(']');
        TcpStream::connect((host, port)).await.map_err(|e| ProxyError::UpstreamUnreachable(format!("connect {host}:{port}: {e}")))
    }

    /// Opens (or is handed) a connection, writes the request line/headers
    /// immediately, writes `body` now only if present (Expect-Continue
    /// passes `None` and uploads later via `ForwardHandle::transport_write`,
    /// spec.md §4.7), and returns a handle streaming the response.
    pub async fn forward(&self, method: &str, url: &str, headers: &HeaderList, body: Option<&[u8]>, version: &str) -> Result<ForwardHandle> {
        let target = UpstreamUrl::parse(url)?;
        let mut stream = self.dial(&target.host, target.port).await?;

        let mut request = format!("{method} {} {version}\r\n", target.path_and_query);
        let mut host_written = false;
        for (name, value) in headers.iter() {
            if name.eq_ignore_ascii_case("host") {
                host_written = true;
            }
            request.push_str(name);
            request.push_str(": ");
            request.push_str(value);
            request.push_str("\r\n");
        }
        if !host_written {
            request.push_str("Host: ");
            request.push_str(&target.host_header());
            request.push_str("\r\n");
        }
        if let Some(body) = body {
            if !headers.contains("content-length") {
                request.push_str(&format!("Content-Length: {}\r\n", body.len()));
            }
        }
        request.push_str("\r\n");

        stream.write_all(request.as_bytes()).await.map_err(|e| ProxyError::UpstreamUnreachable(e.to_string()))?;
        if let Some(body) = body {
            stream.write_all(body).await.map_err(|e| ProxyError::UpstreamUnreachable(e.to_string()))?;
        }
        stream.flush().await.ok();

        Ok(ForwardHandle::new(stream))
    }
}

impl Default for UpstreamClient {
    fn default() -> Self {
        Self::new()
    }
}
