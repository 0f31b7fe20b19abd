//! Ordered, case-insensitive, duplicate-preserving header container, the
//! hop-by-hop header set (spec.md §6), and the header middleware chain (C1).

use std::net::SocketAddr;

/// Headers meaningful only for the current TCP hop; never forwarded in
/// either direction (RFC 7230 §6.1, spec.md §9's "dual hop-header filtering"
/// resolution).
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP.iter().any(|h| h.eq_ignore_ascii_case(name))
}

/// An ordered multi-map of header name/value pairs. Order and duplicates are
/// preserved, per the Request Context invariant in spec.md §3 ("Order
/// preserved for forwarding").
#[derive(Debug, Clone, Default)]
pub struct HeaderList(Vec<(String, String)>);

impl HeaderList {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn push(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.push((name.into(), value.into()));
    }

    /// Replace every existing occurrence of `name` with a single entry,
    /// preserving the position of the first occurrence (or appending if
    /// absent). Used by `user-agent-override`, which replaces rather than
    /// appends (spec.md §4.2).
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        let mut replaced = false;
        let mut i = 0;
        while i < self.0.len() {
            if self.0[i].0.eq_ignore_ascii_case(&name) {
                if !replaced {
                    self.0[i].1 = value.clone();
                    replaced = true;
                    i += 1;
                } else {
                    self.0.remove(i);
                }
            } else {
                i += 1;
            }
        }
        if !replaced {
            self.0.push((name, value));
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.iter().any(|(k, _)| k.eq_ignore_ascii_case(name))
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.iter().find(|(k, _)| k.eq_ignore_ascii_case(name)).map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Strip every hop-by-hop header. Applied to both inbound-derived
    /// outbound-request headers and upstream-derived downstream-response
    /// headers (spec.md §9).
    pub fn strip_hop_by_hop(&mut self) {
        self.0.retain(|(k, _)| !is_hop_by_hop(k));
    }
}

impl FromIterator<(String, String)> for HeaderList {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// What a middleware needs to know about the request it is rewriting
/// headers for. Kept separate from `request::RequestContext` so this module
/// has no dependency on request parsing.
#[derive(Debug, Clone, Copy)]
pub struct MiddlewareContext<'a> {
    pub remote_addr: &'a SocketAddr,
}

pub trait HeaderMiddleware: Send + Sync {
    fn apply(&self, ctx: MiddlewareContext<'_>, headers: &mut HeaderList);
}

/// Appends a header whose value is the peer's address (spec.md §4.2).
pub struct XForwardedFor;

impl HeaderMiddleware for XForwardedFor {
    fn apply(&self, ctx: MiddlewareContext<'_>, headers: &mut HeaderList) {
        headers.push("x-forwarded-for", ctx.remote_addr.ip().to_string());
    }
}

/// Replaces (not appends) `User-Agent` (spec.md §4.2).
pub struct UserAgentOverride(String);

impl UserAgentOverride {
    pub fn new(agent: impl Into<String>) -> Self {
        Self(agent.into())
    }
}

impl HeaderMiddleware for UserAgentOverride {
    fn apply(&self, _ctx: MiddlewareContext<'_>, headers: &mut HeaderList) {
        headers.set("user-agent", self.0.clone());
    }
}

/// Builds a middleware chain from CLI-supplied names, e.g.
/// `["x-forwarded-for", "user-agent-override=my-agent/1.0"]`. Unknown names
/// are skipped with a warning log rather than failing startup.
pub fn build_chain(names: &[String]) -> Vec<Box<dyn HeaderMiddleware>> {
    let mut chain: Vec<Box<dyn HeaderMiddleware>> = Vec::new();
    for name in names {
        match name.split_once('=') {
            Some(("user-agent-override", agent)) => chain.push(Box::new(UserAgentOverride::new(agent))),
            _ if name.eq_ignore_ascii_case("x-forwarded-for") => chain.push(Box::new(XForwardedFor)),
            _ if name.eq_ignore_ascii_case("user-agent-override") => {
                log::warn!("middleware `user-agent-override` requires a value, e.g. user-agent-override=foo; skipping")
            }
            other => log::warn!("unknown header middleware `{other}`, skipping"),
        }
    }
    chain
}
