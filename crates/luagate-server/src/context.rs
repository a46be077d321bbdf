//! Request-scoped caller identity.

use hyper::header::{HeaderMap, HOST, REFERER, USER_AGENT};
use std::net::SocketAddr;

/// Identity of the HTTP request a call arrived on.
///
/// Shared read-only by every call of a batch.
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    /// Session id from `X-Session-UUID`, or one minted by the server
    pub session_id: String,
    /// True when the server generated `session_id`
    pub minted_session: bool,
    /// Remote socket address of the client
    pub peer: Option<SocketAddr>,
    /// Inbound request headers
    pub headers: HeaderMap,
}

impl CallContext {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            ..Default::default()
        }
    }

    pub fn with_peer(mut self, peer: SocketAddr) -> Self {
        self.peer = Some(peer);
        self
    }

    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    pub fn minted(mut self, minted: bool) -> Self {
        self.minted_session = minted;
        self
    }

    /// All values of header `name`, joined with `", "`.
    pub fn header(&self, name: &str) -> Option<String> {
        let values: Vec<&str> = self
            .headers
            .get_all(name)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .collect();
        (!values.is_empty()).then(|| values.join(", "))
    }

    /// Every header, lower-cased name to joined value.
    pub fn header_pairs(&self) -> Vec<(String, String)> {
        let mut pairs: Vec<(String, String)> = self
            .headers
            .keys()
            .filter_map(|name| {
                self.header(name.as_str())
                    .map(|value| (name.as_str().to_string(), value))
            })
            .collect();
        pairs.sort();
        pairs
    }

    /// Peer address as text, empty when unknown.
    pub fn address(&self) -> String {
        self.peer.map(|addr| addr.to_string()).unwrap_or_default()
    }

    /// Originating client IP: first `X-Forwarded-For` hop, else the peer IP.
    pub fn initiator_ip(&self) -> String {
        self.header("x-forwarded-for")
            .and_then(|chain| {
                chain
                    .split(',')
                    .map(str::trim)
                    .find(|hop| !hop.is_empty())
                    .map(str::to_string)
            })
            .or_else(|| self.peer.map(|addr| addr.ip().to_string()))
            .unwrap_or_default()
    }

    /// Caller identity headers attached to outbound requests made by scripts.
    pub fn initiator_headers(&self) -> Vec<(&'static str, String)> {
        vec![
            ("X-Initiator-IP", self.initiator_ip()),
            ("X-Session-UUID", self.session_id.clone()),
            ("X-Initiator-Host", self.header(HOST.as_str()).unwrap_or_default()),
            (
                "X-Initiator-User-Agent",
                self.header(USER_AGENT.as_str()).unwrap_or_default(),
            ),
            (
                "X-Initiator-Referer",
                self.header(REFERER.as_str()).unwrap_or_default(),
            ),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::header::HeaderValue;

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.append(*name, HeaderValue::from_static(value));
        }
        map
    }

    #[test]
    fn test_header_joins_multiple_values() {
        let ctx = CallContext::new("s").with_headers(headers(&[
            ("accept", "text/html"),
            ("accept", "application/json"),
        ]));
        assert_eq!(
            ctx.header("Accept").as_deref(),
            Some("text/html, application/json")
        );
        assert!(ctx.header("missing").is_none());
    }

    #[test]
    fn test_initiator_ip_prefers_forwarded_for() {
        let ctx = CallContext::new("s")
            .with_peer("10.0.0.1:5000".parse().unwrap())
            .with_headers(headers(&[("x-forwarded-for", "203.0.113.7, 10.0.0.1")]));
        assert_eq!(ctx.initiator_ip(), "203.0.113.7");
    }

    #[test]
    fn test_initiator_ip_falls_back_to_peer() {
        let ctx = CallContext::new("s").with_peer("10.0.0.1:5000".parse().unwrap());
        assert_eq!(ctx.initiator_ip(), "10.0.0.1");
        assert_eq!(ctx.address(), "10.0.0.1:5000");
    }

    #[test]
    fn test_initiator_headers() {
        let ctx = CallContext::new("sess-1").with_headers(headers(&[
            ("host", "api.example.com"),
            ("user-agent", "curl/8"),
        ]));
        let pairs = ctx.initiator_headers();
        let lookup = |name: &str| {
            pairs
                .iter()
                .find(|(n, _)| *n == name)
                .map(|(_, v)| v.as_str())
        };
        assert_eq!(lookup("X-Session-UUID"), Some("sess-1"));
        assert_eq!(lookup("X-Initiator-Host"), Some("api.example.com"));
        assert_eq!(lookup("X-Initiator-User-Agent"), Some("curl/8"));
        assert_eq!(lookup("X-Initiator-Referer"), Some(""));
        assert_eq!(lookup("X-Initiator-IP"), Some(""));
    }
}
