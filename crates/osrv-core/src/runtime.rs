//! Per-request runtime metadata.
//!
//! A [`RuntimeContext`] is created by the transport (or the bridge) for each
//! request and attached before any middleware observes the request. It is
//! immutable after attachment and shared read-only for the request lifetime.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;

/// Wire protocol of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Protocol {
    /// Plain HTTP.
    #[default]
    Http,
    /// HTTP over TLS.
    Https,
}

impl Protocol {
    /// Parse `http` / `https` (case-insensitive).
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        if s.eq_ignore_ascii_case("http") {
            Some(Self::Http)
        } else if s.eq_ignore_ascii_case("https") {
            Some(Self::Https)
        } else {
            None
        }
    }

    /// The URL scheme for this protocol.
    #[must_use]
    pub const fn scheme(self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Https => "https",
        }
    }

    /// Whether this protocol runs over TLS.
    #[must_use]
    pub const fn is_tls(self) -> bool {
        matches!(self, Self::Https)
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.scheme())
    }
}

/// HTTP version of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum HttpVersion {
    /// HTTP/1.0
    Http10,
    /// HTTP/1.1
    #[default]
    Http11,
    /// HTTP/2
    H2,
}

impl HttpVersion {
    /// Version string as carried in runtime metadata: `1.0`, `1.1` or `2`.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Http10 => "1.0",
            Self::Http11 => "1.1",
            Self::H2 => "2",
        }
    }

    /// Parse the metadata form (`1.0`, `1.1`, `2`).
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "1.0" => Some(Self::Http10),
            "1.1" => Some(Self::Http11),
            "2" | "2.0" => Some(Self::H2),
            _ => None,
        }
    }
}

impl fmt::Display for HttpVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A tagged raw handle to the hosting environment.
///
/// Each arm carries an opaque payload; nothing in the core depends on a
/// particular arm. Native transports use [`RawHandle::Native`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum RawHandle {
    /// No handle attached.
    #[default]
    None,
    /// Node.js host object.
    Node(serde_json::Value),
    /// Bun host object.
    Bun(serde_json::Value),
    /// Deno host object.
    Deno(serde_json::Value),
    /// Native (in-process) transport.
    Native(serde_json::Value),
    /// Cloudflare Workers host object.
    Cloudflare(serde_json::Value),
    /// Vercel edge host object.
    Vercel(serde_json::Value),
    /// Netlify edge host object.
    Netlify(serde_json::Value),
}

impl RawHandle {
    /// Provider tag name, for logs and the bridge envelope.
    #[must_use]
    pub const fn provider(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Node(_) => "node",
            Self::Bun(_) => "bun",
            Self::Deno(_) => "deno",
            Self::Native(_) => "native",
            Self::Cloudflare(_) => "cloudflare",
            Self::Vercel(_) => "vercel",
            Self::Netlify(_) => "netlify",
        }
    }
}

/// Per-request runtime metadata carrier.
///
/// Immutable after attachment to a request.
#[derive(Debug, Clone, Default)]
pub struct RuntimeContext {
    name: String,
    protocol: Protocol,
    http_version: HttpVersion,
    tls: bool,
    local_address: Option<SocketAddr>,
    remote_address: Option<SocketAddr>,
    env: HashMap<String, String>,
    raw: RawHandle,
    request_id: Option<String>,
}

impl RuntimeContext {
    /// Start building a runtime context for the named runtime.
    #[must_use]
    pub fn builder(name: impl Into<String>) -> RuntimeContextBuilder {
        RuntimeContextBuilder {
            ctx: RuntimeContext {
                name: name.into(),
                ..RuntimeContext::default()
            },
        }
    }

    /// Runtime name (e.g. `osrv`, or a foreign host's name).
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Wire protocol.
    #[must_use]
    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    /// HTTP version.
    #[must_use]
    pub fn http_version(&self) -> HttpVersion {
        self.http_version
    }

    /// Whether the request arrived over TLS.
    #[must_use]
    pub fn tls(&self) -> bool {
        self.tls
    }

    /// Local (bound) socket address, when known.
    #[must_use]
    pub fn local_address(&self) -> Option<SocketAddr> {
        self.local_address
    }

    /// Remote (peer) socket address, when known.
    #[must_use]
    pub fn remote_address(&self) -> Option<SocketAddr> {
        self.remote_address
    }

    /// Environment snapshot taken at server construction.
    #[must_use]
    pub fn env(&self) -> &HashMap<String, String> {
        &self.env
    }

    /// Raw host handle.
    #[must_use]
    pub fn raw(&self) -> &RawHandle {
        &self.raw
    }

    /// Host-assigned request id, when one exists.
    #[must_use]
    pub fn request_id(&self) -> Option<&str> {
        self.request_id.as_deref()
    }
}

/// Builder for [`RuntimeContext`].
#[derive(Debug)]
pub struct RuntimeContextBuilder {
    ctx: RuntimeContext,
}

impl RuntimeContextBuilder {
    /// Set protocol; also fixes the `tls` flag to match.
    #[must_use]
    pub fn protocol(mut self, protocol: Protocol) -> Self {
        self.ctx.protocol = protocol;
        self.ctx.tls = protocol.is_tls();
        self
    }

    /// Set HTTP version.
    #[must_use]
    pub fn http_version(mut self, version: HttpVersion) -> Self {
        self.ctx.http_version = version;
        self
    }

    /// Override the TLS flag (bridge payloads may carry it explicitly).
    #[must_use]
    pub fn tls(mut self, tls: bool) -> Self {
        self.ctx.tls = tls;
        self
    }

    /// Set the local address.
    #[must_use]
    pub fn local_address(mut self, addr: Option<SocketAddr>) -> Self {
        self.ctx.local_address = addr;
        self
    }

    /// Set the remote address.
    #[must_use]
    pub fn remote_address(mut self, addr: Option<SocketAddr>) -> Self {
        self.ctx.remote_address = addr;
        self
    }

    /// Set the environment snapshot.
    #[must_use]
    pub fn env(mut self, env: HashMap<String, String>) -> Self {
        self.ctx.env = env;
        self
    }

    /// Attach the raw host handle.
    #[must_use]
    pub fn raw(mut self, raw: RawHandle) -> Self {
        self.ctx.raw = raw;
        self
    }

    /// Set the host-assigned request id.
    #[must_use]
    pub fn request_id(mut self, id: Option<String>) -> Self {
        self.ctx.request_id = id;
        self
    }

    /// Finish building.
    #[must_use]
    pub fn build(self) -> RuntimeContext {
        self.ctx
    }
}

/// Capability flags describing what the bound transport supports.
///
/// Set once after the transport binds; reflects actual capabilities, not
/// configuration intent (e.g. `http2` turns false when the TLS stack cannot
/// negotiate it).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerCapabilities {
    /// Plain HTTP/1.x serving.
    pub http1: bool,
    /// HTTPS serving.
    pub https: bool,
    /// HTTP/2 (over ALPN).
    pub http2: bool,
    /// WebSocket upgrades.
    pub websocket: bool,
    /// Streaming request bodies.
    pub request_streaming: bool,
    /// Streaming response bodies.
    pub response_streaming: bool,
    /// `waitUntil` background tasks.
    pub wait_until: bool,
    /// Running inside an edge host.
    pub edge: bool,
    /// TLS termination.
    pub tls: bool,
    /// Edge providers reachable through the bridge.
    pub edge_providers: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_parse_and_scheme() {
        assert_eq!(Protocol::parse("HTTP"), Some(Protocol::Http));
        assert_eq!(Protocol::parse("https"), Some(Protocol::Https));
        assert_eq!(Protocol::parse("ftp"), None);
        assert_eq!(Protocol::Https.scheme(), "https");
        assert!(Protocol::Https.is_tls());
        assert!(!Protocol::Http.is_tls());
    }

    #[test]
    fn http_version_strings() {
        assert_eq!(HttpVersion::Http10.as_str(), "1.0");
        assert_eq!(HttpVersion::Http11.as_str(), "1.1");
        assert_eq!(HttpVersion::H2.as_str(), "2");
        assert_eq!(HttpVersion::parse("2.0"), Some(HttpVersion::H2));
        assert_eq!(HttpVersion::parse("3"), None);
    }

    #[test]
    fn builder_protocol_sets_tls() {
        let ctx = RuntimeContext::builder("osrv")
            .protocol(Protocol::Https)
            .http_version(HttpVersion::H2)
            .build();
        assert!(ctx.tls());
        assert_eq!(ctx.protocol(), Protocol::Https);
        assert_eq!(ctx.http_version(), HttpVersion::H2);
        assert_eq!(ctx.name(), "osrv");
    }

    #[test]
    fn raw_handle_provider_names() {
        assert_eq!(RawHandle::None.provider(), "none");
        assert_eq!(
            RawHandle::Cloudflare(serde_json::Value::Null).provider(),
            "cloudflare"
        );
        assert_eq!(
            RawHandle::Native(serde_json::Value::Null).provider(),
            "native"
        );
    }
}
