//! The closed error taxonomy a forward proxy needs to branch on: whether a
//! failure is recoverable into a user-visible response or fatal for the
//! downstream connection. `anyhow` is still used at the bootstrap/IO
//! boundary (`run()`, CLI init) the way the rest of this workspace uses it;
//! this enum exists because the response pipeline and tunnel engine need to
//! match on *kind*, not just propagate an opaque error upward.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProxyError {
    /// Missing or origin-form request-target on a non-CONNECT request.
    #[error("bad request target: {0}")]
    BadTarget(String),

    /// DNS/connect failure, or the upstream connection dropped before any
    /// response bytes arrived.
    #[error("upstream unreachable: {0}")]
    UpstreamUnreachable(String),

    /// The upstream sent a response HTTP could not make sense of.
    #[error("malformed upstream response: {0}")]
    UpstreamProtocol(String),

    /// The downstream socket went away while we were streaming a response.
    #[error("downstream connection lost")]
    DownstreamLost,

    /// One side of a CONNECT tunnel closed; not itself an error condition,
    /// carried as a variant so call sites can log it at a low level.
    #[error("tunnel peer closed")]
    TunnelPeerClosed,

    /// A state-machine invariant was violated (`start_response` called
    /// twice, a chunk enqueued after `done`, ...). Always a bug.
    #[error("internal invariant violated: {0}")]
    InternalInvariant(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ProxyError {
    /// Whether this error can still be rendered as a downstream HTTP
    /// response (i.e. we have not started writing one yet).
    pub fn is_recoverable_as_response(&self) -> bool {
        matches!(
            self,
            ProxyError::BadTarget(_) | ProxyError::UpstreamUnreachable(_) | ProxyError::UpstreamProtocol(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, ProxyError>;
