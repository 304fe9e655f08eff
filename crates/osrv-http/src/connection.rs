//! Connection-level header handling: keep-alive, hop-by-hop filtering,
//! client IP resolution and URL assembly.

use osrv_core::runtime::{HttpVersion, Protocol};
use osrv_core::Url;

use crate::parser::RequestHead;

/// Hop-by-hop headers filtered from responses.
///
/// Meaningful only to a single transport connection; the HTTP/2 writer must
/// never emit them, and the HTTP/1.1 writer owns their semantics itself.
pub const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "transfer-encoding",
    "upgrade",
];

/// Whether a header name is hop-by-hop.
#[must_use]
pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP_HEADERS
        .iter()
        .any(|h| h.eq_ignore_ascii_case(name))
}

/// Parsed `Connection` header directives.
#[derive(Debug, Clone, Default)]
pub struct ConnectionInfo {
    /// `close` token present.
    pub close: bool,
    /// `keep-alive` token present.
    pub keep_alive: bool,
    /// `upgrade` token present.
    pub upgrade: bool,
}

impl ConnectionInfo {
    /// Parse a `Connection` header value (comma-separated tokens,
    /// case-insensitive).
    #[must_use]
    pub fn parse(value: Option<&[u8]>) -> Self {
        let mut info = Self::default();
        let Some(value) = value.and_then(|v| std::str::from_utf8(v).ok()) else {
            return info;
        };
        for token in value.split(',') {
            match token.trim().to_ascii_lowercase().as_str() {
                "close" => info.close = true,
                "keep-alive" => info.keep_alive = true,
                "upgrade" => info.upgrade = true,
                _ => {}
            }
        }
        info
    }

    /// Keep-alive decision: explicit tokens win; HTTP/1.1 defaults to
    /// keep-alive, HTTP/1.0 to close.
    #[must_use]
    pub fn should_keep_alive(&self, version: HttpVersion) -> bool {
        if self.close {
            return false;
        }
        if self.keep_alive {
            return true;
        }
        matches!(version, HttpVersion::Http11)
    }
}

/// Whether the head asks for a WebSocket upgrade (`Connection: upgrade` +
/// `Upgrade: websocket`).
#[must_use]
pub fn wants_websocket_upgrade(head: &RequestHead) -> bool {
    let info = ConnectionInfo::parse(head.header("connection"));
    if !info.upgrade {
        return false;
    }
    head.header_str("upgrade")
        .map(|u| {
            u.split(',')
                .any(|t| t.trim().eq_ignore_ascii_case("websocket"))
        })
        .unwrap_or(false)
}

/// Resolve the client IP.
///
/// With `trust_proxy`, the first comma-separated token of `x-forwarded-for`
/// (trimmed) wins; otherwise the socket remote address.
#[must_use]
pub fn resolve_client_ip(
    forwarded_for: Option<&str>,
    remote: Option<std::net::SocketAddr>,
    trust_proxy: bool,
) -> Option<String> {
    if trust_proxy {
        if let Some(value) = forwarded_for {
            let first = value.split(',').next().map(str::trim).unwrap_or_default();
            if !first.is_empty() {
                return Some(first.to_string());
            }
        }
    }
    remote.map(|addr| addr.ip().to_string())
}

/// Assemble the absolute request URL.
///
/// Prefers an absolute-form target; otherwise combines the resolved scheme
/// with the `Host` header (IPv6 brackets supported). A missing or malformed
/// `Host` falls back to the advertised hostname and bound port.
#[must_use]
pub fn assemble_url(
    target: &str,
    protocol: Protocol,
    host_header: Option<&str>,
    fallback_host: &str,
    fallback_port: u16,
) -> Url {
    if let Some(url) = Url::parse(target) {
        return url;
    }

    let scheme = protocol.scheme();
    if let Some(host) = host_header.map(str::trim).filter(|h| !h.is_empty()) {
        if let Some(url) = Url::parse(&format!("{scheme}://{host}{target}")) {
            return url;
        }
    }
    Url::from_parts(scheme, fallback_host, Some(fallback_port), target)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::{parse_head, HeadStatus, ParseLimits};

    fn head(bytes: &[u8]) -> RequestHead {
        match parse_head(bytes, &ParseLimits::default()).unwrap() {
            HeadStatus::Complete { head, .. } => head,
            HeadStatus::Incomplete => panic!("incomplete"),
        }
    }

    #[test]
    fn hop_by_hop_set_matches_contract() {
        for name in ["Connection", "keep-alive", "Proxy-Connection", "transfer-encoding", "Upgrade"] {
            assert!(is_hop_by_hop(name), "{name}");
        }
        assert!(!is_hop_by_hop("content-type"));
        assert!(!is_hop_by_hop("set-cookie"));
    }

    #[test]
    fn keep_alive_defaults_by_version() {
        let info = ConnectionInfo::parse(None);
        assert!(info.should_keep_alive(HttpVersion::Http11));
        assert!(!info.should_keep_alive(HttpVersion::Http10));
    }

    #[test]
    fn explicit_tokens_override_defaults() {
        let close = ConnectionInfo::parse(Some(b"close"));
        assert!(!close.should_keep_alive(HttpVersion::Http11));

        let keep = ConnectionInfo::parse(Some(b"Keep-Alive"));
        assert!(keep.should_keep_alive(HttpVersion::Http10));

        let multi = ConnectionInfo::parse(Some(b"keep-alive, Upgrade"));
        assert!(multi.upgrade);
        assert!(multi.should_keep_alive(HttpVersion::Http11));
    }

    #[test]
    fn websocket_upgrade_detection() {
        let h = head(
            b"GET /ws HTTP/1.1\r\nHost: x\r\nConnection: Upgrade\r\nUpgrade: websocket\r\n\r\n",
        );
        assert!(wants_websocket_upgrade(&h));

        let h = head(b"GET /ws HTTP/1.1\r\nHost: x\r\nUpgrade: websocket\r\n\r\n");
        assert!(!wants_websocket_upgrade(&h), "connection token required");

        let h = head(b"GET / HTTP/1.1\r\nHost: x\r\nConnection: Upgrade\r\nUpgrade: h2c\r\n\r\n");
        assert!(!wants_websocket_upgrade(&h));
    }

    #[test]
    fn client_ip_from_forwarded_when_trusted() {
        let remote = "198.51.100.7:1234".parse().ok();
        assert_eq!(
            resolve_client_ip(Some(" 203.0.113.5 , 10.0.0.1"), remote, true).as_deref(),
            Some("203.0.113.5")
        );
        assert_eq!(
            resolve_client_ip(Some("203.0.113.5"), remote, false).as_deref(),
            Some("198.51.100.7")
        );
        assert_eq!(
            resolve_client_ip(None, remote, true).as_deref(),
            Some("198.51.100.7")
        );
        assert_eq!(resolve_client_ip(None, None, false), None);
    }

    #[test]
    fn url_from_host_header() {
        let url = assemble_url(
            "/a/b?c=1",
            Protocol::Http,
            Some("example.com:8080"),
            "localhost",
            3000,
        );
        assert_eq!(url.to_string(), "http://example.com:8080/a/b?c=1");
    }

    #[test]
    fn url_ipv6_host_header() {
        let url = assemble_url("/x", Protocol::Https, Some("[::1]:8443"), "localhost", 3000);
        assert_eq!(url.host(), "::1");
        assert_eq!(url.port(), Some(8443));
        assert_eq!(url.scheme(), "https");
    }

    #[test]
    fn url_absolute_target_wins() {
        let url = assemble_url(
            "http://other.test/p",
            Protocol::Https,
            Some("ignored.example"),
            "localhost",
            3000,
        );
        assert_eq!(url.to_string(), "http://other.test/p");
    }

    #[test]
    fn url_missing_host_falls_back() {
        let url = assemble_url("/p", Protocol::Http, None, "localhost", 3000);
        assert_eq!(url.to_string(), "http://localhost:3000/p");
    }
}
