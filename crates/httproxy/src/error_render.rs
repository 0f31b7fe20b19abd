//! The Error Renderer (C6, spec.md §4.6): content-negotiated failure
//! responses for upstream errors observed before any response bytes have
//! reached the downstream connection.

/// A rendered error response, ready to be written verbatim.
pub struct RenderedError {
    pub status: u16,
    pub content_type: Option<&'static str>,
    pub body: String,
}

/// Matches `accept` against `text/html` then `text/plain`, per spec.md
/// §4.6. Unlike the reference renderer this implementation is distilled
/// from, the `text/plain` branch is sent with `Content-Type: text/plain`
/// rather than the reference's `text/html` — a deliberate fix, not a carried
/// deviation (see DESIGN.md).
pub fn render_upstream_error(accept: Option<&str>, uri: &str) -> RenderedError {
    let accept = accept.unwrap_or("");
    let message = format!("Could not find {uri}");

    if accept_contains(accept, "text/html") {
        RenderedError {
            status: 504,
            content_type: Some("text/html"),
            body: format!("<h1>{message}</h1>"),
        }
    } else if accept_contains(accept, "text/plain") {
        RenderedError {
            status: 504,
            content_type: Some("text/plain"),
            body: message,
        }
    } else {
        RenderedError { status: 504, content_type: None, body: String::new() }
    }
}

fn accept_contains(accept: &str, media_type: &str) -> bool {
    accept.split(',').any(|part| part.split(';').next().unwrap_or("").trim().eq_ignore_ascii_case(media_type))
}
