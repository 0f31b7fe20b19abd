//! Forward Response Pipeline (C4, spec.md §4.4) and the Expect/100-Continue
//! Handler (C7, spec.md §4.7). The two are implemented together because C7
//! is purely a reaction to the `Interim100` event C4 already observes.

use smol::io::AsyncReadExt;
use smol::net::TcpStream;

use crate::error::{ProxyError, Result};
use crate::headers::HeaderList;
use crate::upstream::{Event, ForwardHandle};

/// What `start_response` needs: status line plus hop-by-hop-stripped
/// headers (spec.md §4.4's "Hop-by-hop filter").
#[derive(Debug)]
pub struct ForwardOutcome {
    pub status: u16,
    pub reason: String,
    pub headers: HeaderList,
}

/// What reaches the downstream writer, in order. `chunk_queue` from spec.md
/// §3 is this channel: bounded, single-producer/single-consumer, not
/// restartable.
#[derive(Debug)]
pub enum DownstreamEvent {
    Start(ForwardOutcome),
    Chunk(Vec<u8>),
    Done,
}

/// An inbound body the client sent with `Expect: 100-continue`, not yet
/// read off the downstream socket. `read_all` consumes `self`, so the type
/// system enforces "read at most once" (spec.md §8). Holds a *cloned*
/// `TcpStream` handle (shared-socket clone, the same pattern `tunnel.rs`
/// uses) rather than a borrow, because the downstream response writer needs
/// its own concurrent access to the same socket.
pub struct DeferredBody {
    stream: TcpStream,
    content_length: usize,
    prefetched: Vec<u8>,
}

impl DeferredBody {
    pub fn new(stream: TcpStream, content_length: usize, prefetched: Vec<u8>) -> Self {
        Self { stream, content_length, prefetched }
    }

    async fn read_all(mut self) -> Result<Vec<u8>> {
        let mut body = self.prefetched;
        let mut buf = [0u8; 8192];
        while body.len() < self.content_length {
            let n = self.stream.read(&mut buf).await.map_err(|_| ProxyError::DownstreamLost)?;
            if n == 0 {
                return Err(ProxyError::DownstreamLost);
            }
            body.extend_from_slice(&buf[..n]);
        }
        body.truncate(self.content_length);
        Ok(body)
    }
}

/// Either there is nothing left to upload (no body, or it was already sent
/// eagerly with the initial request) or an `Expect: 100-continue` body is
/// waiting to be read on demand.
pub enum InboundBody {
    Sent,
    Deferred(DeferredBody),
}

/// Drives the upstream response event stream, forwarding `Start`/`Chunk`/
/// `Done` events to the downstream writer and performing the deferred
/// Expect-Continue upload when observed. Runs until the response is
/// complete or an error occurs.
pub async fn run_forward_pipeline(
    mut handle: ForwardHandle,
    mut inbound_body: InboundBody,
    tx: async_channel::Sender<DownstreamEvent>,
) -> Result<()> {
    let mut headers_flushed = false;

    loop {
        let event = handle.next_event().await?;
        match event {
            Event::Interim100 => {
                // The `100 Continue` line itself is never propagated
                // downstream (spec.md §4.4, §4.7).
                if matches!(inbound_body, InboundBody::Deferred(_)) {
                    if let InboundBody::Deferred(deferred) = std::mem::replace(&mut inbound_body, InboundBody::Sent) {
                        let body = deferred.read_all().await?;
                        handle.transport_write(&body).await?;
                    }
                }
            }
            Event::HeadersComplete { status, reason, mut headers } => {
                if !headers_flushed {
                    headers.strip_hop_by_hop();
                    tx.send(DownstreamEvent::Start(ForwardOutcome { status, reason, headers })).await.map_err(|_| ProxyError::DownstreamLost)?;
                    headers_flushed = true;
                }
            }
            Event::BodyChunk(chunk) => {
                if !chunk.is_empty() {
                    tx.send(DownstreamEvent::Chunk(chunk)).await.map_err(|_| ProxyError::DownstreamLost)?;
                }
            }
            Event::MessageComplete => {
                let _ = tx.send(DownstreamEvent::Done).await;
                return Ok(());
            }
        }
    }
}
