//! Header filtering shared by both gateways

use reqwest::header::{self, HeaderMap, HeaderName, HeaderValue};

/// Headers to strip before forwarding (hop-by-hop per RFC 2616 Section 13.5.1)
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Caller headers never forwarded upstream: caller credentials, and headers
/// the HTTP client recomputes for the rewritten request.
const CALLER_ONLY_HEADERS: &[&str] = &[
    "authorization",
    "x-api-key",
    "host",
    "content-length",
    "accept-encoding",
    "x-gateway-credential",
];

/// Check if a header is hop-by-hop (should be stripped before forwarding)
pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP_HEADERS
        .iter()
        .any(|h| h.eq_ignore_ascii_case(name))
}

/// Copy caller headers minus hop-by-hop and caller-only headers.
pub fn filter_request_headers(incoming: &HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::with_capacity(incoming.len());
    for (name, value) in incoming {
        let name_str = name.as_str();
        if is_hop_by_hop(name_str)
            || CALLER_ONLY_HEADERS
                .iter()
                .any(|h| h.eq_ignore_ascii_case(name_str))
        {
            continue;
        }
        out.append(name.clone(), value.clone());
    }
    out
}

/// Copy upstream response headers minus hop-by-hop and `content-length`
/// (the body may be re-framed on the way back).
pub fn filter_response_headers(incoming: &HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::with_capacity(incoming.len());
    for (name, value) in incoming {
        if is_hop_by_hop(name.as_str()) || name == header::CONTENT_LENGTH {
            continue;
        }
        out.append(name.clone(), value.clone());
    }
    out
}

/// Overlay resolved credential headers; these always win over caller headers.
pub fn apply_auth_headers(headers: &mut HeaderMap, auth: &HeaderMap) {
    for (name, value) in auth {
        headers.insert(name.clone(), value.clone());
    }
}

/// Whether a response declares a server-sent-event body.
pub fn is_event_stream(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| {
            ct.starts_with("text/event-stream")
                || ct.starts_with("application/vnd.amazon.eventstream")
        })
}

/// Build a header value holding a secret, flagged sensitive.
pub fn sensitive_value(value: &str) -> Option<HeaderValue> {
    let mut v = HeaderValue::from_str(value).ok()?;
    v.set_sensitive(true);
    Some(v)
}

pub(crate) const ANTHROPIC_BETA: HeaderName = HeaderName::from_static("anthropic-beta");
pub(crate) const ANTHROPIC_VERSION: HeaderName = HeaderName::from_static("anthropic-version");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hop_by_hop_detection() {
        assert!(is_hop_by_hop("Connection"));
        assert!(is_hop_by_hop("TRANSFER-ENCODING"));
        assert!(is_hop_by_hop("keep-alive"));
        assert!(is_hop_by_hop("Proxy-Authorization"));
        assert!(!is_hop_by_hop("Content-Type"));
        assert!(!is_hop_by_hop("Authorization"));
        assert!(!is_hop_by_hop("X-Custom-Header"));
    }

    #[test]
    fn request_filter_drops_caller_credentials() {
        let mut h = HeaderMap::new();
        h.insert("authorization", HeaderValue::from_static("Bearer client"));
        h.insert("x-api-key", HeaderValue::from_static("client-key"));
        h.insert("host", HeaderValue::from_static("gateway.local"));
        h.insert("content-length", HeaderValue::from_static("42"));
        h.insert("connection", HeaderValue::from_static("keep-alive"));
        h.insert("anthropic-beta", HeaderValue::from_static("tools-2024"));
        h.insert("content-type", HeaderValue::from_static("application/json"));

        let out = filter_request_headers(&h);
        assert!(out.get("authorization").is_none());
        assert!(out.get("x-api-key").is_none());
        assert!(out.get("host").is_none());
        assert!(out.get("content-length").is_none());
        assert!(out.get("connection").is_none());
        assert_eq!(out.get("anthropic-beta").unwrap(), "tools-2024");
        assert_eq!(out.get("content-type").unwrap(), "application/json");
    }

    #[test]
    fn response_filter_keeps_content_type() {
        let mut h = HeaderMap::new();
        h.insert("transfer-encoding", HeaderValue::from_static("chunked"));
        h.insert("content-length", HeaderValue::from_static("10"));
        h.insert("content-type", HeaderValue::from_static("text/event-stream"));
        h.insert("request-id", HeaderValue::from_static("req_up"));

        let out = filter_response_headers(&h);
        assert!(out.get("transfer-encoding").is_none());
        assert!(out.get("content-length").is_none());
        assert_eq!(out.get("request-id").unwrap(), "req_up");
        assert!(is_event_stream(&out));
    }

    #[test]
    fn auth_headers_override_caller() {
        let mut h = HeaderMap::new();
        h.insert("x-api-key", HeaderValue::from_static("caller"));
        let mut auth = HeaderMap::new();
        auth.insert("x-api-key", sensitive_value("sk-real").unwrap());
        apply_auth_headers(&mut h, &auth);
        assert_eq!(h.get("x-api-key").unwrap(), "sk-real");
        assert!(h.get("x-api-key").unwrap().is_sensitive());
    }
}
