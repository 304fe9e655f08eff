//! HTTP request types.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::runtime::RuntimeContext;
use crate::tasks::WaitUntil;

/// HTTP method.
///
/// Methods are normalized to uppercase on parse. Non-standard methods are
/// preserved verbatim (uppercased) in the `Extension` variant.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Method {
    /// GET method.
    Get,
    /// POST method.
    Post,
    /// PUT method.
    Put,
    /// DELETE method.
    Delete,
    /// PATCH method.
    Patch,
    /// OPTIONS method.
    Options,
    /// HEAD method.
    Head,
    /// TRACE method.
    Trace,
    /// CONNECT method.
    Connect,
    /// Any other token, stored uppercase.
    Extension(String),
}

impl Method {
    /// Parse a method token, normalizing to uppercase.
    ///
    /// Returns `None` for an empty token.
    #[must_use]
    pub fn parse(token: &str) -> Option<Self> {
        if token.is_empty() {
            return None;
        }
        let upper = token.to_ascii_uppercase();
        Some(match upper.as_str() {
            "GET" => Self::Get,
            "POST" => Self::Post,
            "PUT" => Self::Put,
            "DELETE" => Self::Delete,
            "PATCH" => Self::Patch,
            "OPTIONS" => Self::Options,
            "HEAD" => Self::Head,
            "TRACE" => Self::Trace,
            "CONNECT" => Self::Connect,
            _ => Self::Extension(upper),
        })
    }

    /// Return the canonical uppercase method name.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Delete => "DELETE",
            Self::Patch => "PATCH",
            Self::Options => "OPTIONS",
            Self::Head => "HEAD",
            Self::Trace => "TRACE",
            Self::Connect => "CONNECT",
            Self::Extension(s) => s.as_str(),
        }
    }

    /// Whether a request body is permitted for this method.
    ///
    /// Bodies are permitted for all methods outside GET, HEAD and TRACE.
    #[must_use]
    pub fn allows_body(&self) -> bool {
        !matches!(self, Self::Get | Self::Head | Self::Trace)
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A minimal absolute URL value.
///
/// osrv does not need a general-purpose URL library; requests carry either an
/// absolute-form target or an origin-form path that the transport combines
/// with the resolved scheme and `Host` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Url {
    scheme: String,
    host: String,
    port: Option<u16>,
    path: String,
    query: Option<String>,
}

impl Url {
    /// Assemble a URL from parts.
    ///
    /// `path_and_query` must start with `/` (a bare `""` becomes `/`).
    #[must_use]
    pub fn from_parts(scheme: &str, host: &str, port: Option<u16>, path_and_query: &str) -> Self {
        let (path, query) = match path_and_query.split_once('?') {
            Some((p, q)) => (p, Some(q.to_string())),
            None => (path_and_query, None),
        };
        let path = if path.is_empty() {
            "/".to_string()
        } else {
            path.to_string()
        };
        Self {
            scheme: scheme.to_ascii_lowercase(),
            host: host.to_string(),
            port,
            path,
            query,
        }
    }

    /// Parse an absolute URL of the form `scheme://host[:port]/path?query`.
    #[must_use]
    pub fn parse(input: &str) -> Option<Self> {
        let (scheme, rest) = input.split_once("://")?;
        if scheme.is_empty() {
            return None;
        }
        let (authority, path_and_query) = match rest.find('/') {
            Some(idx) => (&rest[..idx], &rest[idx..]),
            None => (rest, "/"),
        };
        if authority.is_empty() {
            return None;
        }
        let (host, port) = split_authority(authority)?;
        Some(Self::from_parts(scheme, host, port, path_and_query))
    }

    /// URL scheme, lowercase.
    #[must_use]
    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    /// Host, without brackets for IPv6.
    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Explicit port, if one was given.
    #[must_use]
    pub fn port(&self) -> Option<u16> {
        self.port
    }

    /// Path component, always starting with `/`.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Query string without the leading `?`.
    #[must_use]
    pub fn query(&self) -> Option<&str> {
        self.query.as_deref()
    }

    /// Path plus query, as it appears in an HTTP/1.1 request target.
    #[must_use]
    pub fn path_and_query(&self) -> String {
        match &self.query {
            Some(q) => format!("{}?{}", self.path, q),
            None => self.path.clone(),
        }
    }
}

/// Split `host[:port]`, handling bracketed IPv6 literals.
fn split_authority(authority: &str) -> Option<(&str, Option<u16>)> {
    if let Some(rest) = authority.strip_prefix('[') {
        let (host, after) = rest.split_once(']')?;
        let port = match after.strip_prefix(':') {
            Some(p) => Some(p.parse().ok()?),
            None if after.is_empty() => None,
            None => return None,
        };
        return Some((host, port));
    }
    match authority.rsplit_once(':') {
        Some((host, port)) if !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) => {
            Some((host, port.parse().ok()))
        }
        _ => Some((authority, None)),
    }
}

impl fmt::Display for Url {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let host_needs_brackets = self.host.contains(':');
        write!(f, "{}://", self.scheme)?;
        if host_needs_brackets {
            write!(f, "[{}]", self.host)?;
        } else {
            f.write_str(&self.host)?;
        }
        if let Some(port) = self.port {
            write!(f, ":{port}")?;
        }
        f.write_str(&self.path)?;
        if let Some(q) = &self.query {
            write!(f, "?{q}")?;
        }
        Ok(())
    }
}

/// HTTP headers: an ordered multimap with case-insensitive lookup.
///
/// Insertion order and name case are preserved for the wire; lookups match
/// names case-insensitively. `append` keeps multiplicity, which matters for
/// `set-cookie` in particular.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    entries: Vec<(String, Vec<u8>)>,
}

impl Headers {
    /// Create empty headers.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a header, preserving any existing values with the same name.
    pub fn append(&mut self, name: impl Into<String>, value: impl Into<Vec<u8>>) {
        self.entries.push((name.into(), value.into()));
    }

    /// Set a header, replacing all existing values with the same name.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<Vec<u8>>) {
        let name = name.into();
        self.remove(&name);
        self.entries.push((name, value.into()));
    }

    /// Get the first value for a name (case-insensitive).
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&[u8]> {
        self.entries
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_slice())
    }

    /// Get the first value as a UTF-8 string, if valid.
    #[must_use]
    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(|v| std::str::from_utf8(v).ok())
    }

    /// Get all values for a name, in insertion order.
    #[must_use]
    pub fn get_all(&self, name: &str) -> Vec<&[u8]> {
        self.entries
            .iter()
            .filter(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_slice())
            .collect()
    }

    /// Remove all values for a name. Returns how many were removed.
    pub fn remove(&mut self, name: &str) -> usize {
        let before = self.entries.len();
        self.entries.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
        before - self.entries.len()
    }

    /// Check whether a header is present (case-insensitive).
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Iterate over all headers in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &[u8])> {
        self.entries
            .iter()
            .map(|(n, v)| (n.as_str(), v.as_slice()))
    }

    /// Number of header entries (counting duplicates).
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether there are no headers.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Build from a list of pairs, preserving order and multiplicity.
    #[must_use]
    pub fn from_pairs(pairs: Vec<(String, Vec<u8>)>) -> Self {
        Self { entries: pairs }
    }

    /// Consume into the underlying ordered pairs.
    #[must_use]
    pub fn into_pairs(self) -> Vec<(String, Vec<u8>)> {
        self.entries
    }
}

/// Error produced while reading a request body stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BodyError {
    /// Connection closed before the body was complete.
    ConnectionClosed,
    /// Timeout while waiting for body data.
    Timeout,
    /// Cumulative body bytes exceeded the configured limit.
    TooLarge {
        /// The configured maximum in bytes.
        max: u64,
        /// Bytes counted when the limit was crossed (or the declared length).
        actual: u64,
    },
    /// I/O error during streaming.
    Io(String),
}

impl fmt::Display for BodyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConnectionClosed => write!(f, "connection closed"),
            Self::Timeout => write!(f, "timeout waiting for body data"),
            Self::TooLarge { max, actual } => {
                write!(f, "body too large: {actual} bytes exceeds limit of {max}")
            }
            Self::Io(msg) => write!(f, "I/O error: {msg}"),
        }
    }
}

impl std::error::Error for BodyError {}

/// A streaming request body yielding byte chunks.
pub struct BodyStream {
    inner: std::pin::Pin<
        Box<dyn asupersync::stream::Stream<Item = Result<Vec<u8>, BodyError>> + Send + Sync>,
    >,
    bytes_received: u64,
    expected_size: Option<u64>,
    complete: bool,
}

impl fmt::Debug for BodyStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BodyStream")
            .field("bytes_received", &self.bytes_received)
            .field("expected_size", &self.expected_size)
            .field("complete", &self.complete)
            .finish_non_exhaustive()
    }
}

impl BodyStream {
    /// Create a body stream from an async stream of chunks.
    pub fn new<S>(stream: S) -> Self
    where
        S: asupersync::stream::Stream<Item = Result<Vec<u8>, BodyError>> + Send + Sync + 'static,
    {
        Self {
            inner: Box::pin(stream),
            bytes_received: 0,
            expected_size: None,
            complete: false,
        }
    }

    /// Create a body stream with a known expected size (from `Content-Length`).
    pub fn with_expected_size<S>(stream: S, expected_size: u64) -> Self
    where
        S: asupersync::stream::Stream<Item = Result<Vec<u8>, BodyError>> + Send + Sync + 'static,
    {
        Self {
            expected_size: Some(expected_size),
            ..Self::new(stream)
        }
    }

    /// Bytes received so far.
    #[must_use]
    pub fn bytes_received(&self) -> u64 {
        self.bytes_received
    }

    /// Expected total size, if known.
    #[must_use]
    pub fn expected_size(&self) -> Option<u64> {
        self.expected_size
    }

    /// Whether the stream has terminated.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.complete
    }

    /// Collect all chunks into a single buffer.
    ///
    /// # Errors
    ///
    /// Returns the first stream error, including `BodyError::TooLarge` when a
    /// size limiter trips mid-stream.
    pub async fn collect(mut self) -> Result<Vec<u8>, BodyError> {
        use asupersync::stream::StreamExt;

        let capacity = usize::try_from(self.expected_size.unwrap_or(4096)).unwrap_or(4096);
        let mut buffer = Vec::with_capacity(capacity);
        while let Some(chunk) = self.inner.next().await {
            buffer.extend_from_slice(&chunk?);
            self.bytes_received = buffer.len() as u64;
        }
        self.complete = true;
        Ok(buffer)
    }
}

impl asupersync::stream::Stream for BodyStream {
    type Item = Result<Vec<u8>, BodyError>;

    fn poll_next(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Self::Item>> {
        if self.complete {
            return std::task::Poll::Ready(None);
        }
        match self.inner.as_mut().poll_next(cx) {
            std::task::Poll::Ready(Some(Ok(chunk))) => {
                self.bytes_received += chunk.len() as u64;
                std::task::Poll::Ready(Some(Ok(chunk)))
            }
            std::task::Poll::Ready(Some(Err(e))) => {
                self.complete = true;
                std::task::Poll::Ready(Some(Err(e)))
            }
            std::task::Poll::Ready(None) => {
                self.complete = true;
                std::task::Poll::Ready(None)
            }
            std::task::Poll::Pending => std::task::Poll::Pending,
        }
    }
}

/// Request body.
#[derive(Debug)]
pub enum Body {
    /// No body.
    Empty,
    /// Fully buffered body.
    Bytes(Vec<u8>),
    /// Lazy byte stream, possibly size-limited by the transport.
    Stream(BodyStream),
}

impl Body {
    /// Collect the body into bytes, consuming it.
    ///
    /// # Errors
    ///
    /// Returns an error if a streaming body fails, including the size-limit
    /// failure the transport injects for over-limit bodies.
    pub async fn into_bytes_async(self) -> Result<Vec<u8>, BodyError> {
        match self {
            Self::Empty => Ok(Vec::new()),
            Self::Bytes(b) => Ok(b),
            Self::Stream(stream) => stream.collect().await,
        }
    }

    /// Whether the body is known to be empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Empty => true,
            Self::Bytes(b) => b.is_empty(),
            Self::Stream(s) => s.is_complete() && s.bytes_received() == 0,
        }
    }

    /// Whether the body is a lazy stream.
    #[must_use]
    pub fn is_streaming(&self) -> bool {
        matches!(self, Self::Stream(_))
    }

    /// Create a body that immediately fails with the given error.
    ///
    /// Used by transports to represent an over-limit body without buffering.
    #[must_use]
    pub fn failed(error: BodyError) -> Self {
        let mut yielded = false;
        Self::Stream(BodyStream::new(asupersync::stream::iter(
            std::iter::from_fn(move || {
                if yielded {
                    None
                } else {
                    yielded = true;
                    Some(Err(error.clone()))
                }
            }),
        )))
    }
}

/// An opaque raw handle a transport may attach to a request, typically the
/// underlying duplex stream reserved for a WebSocket upgrade.
pub type RawAttachment = Box<dyn std::any::Any + Send + Sync>;

/// HTTP request.
///
/// The request owns its context bag and body; the runtime context is shared
/// read-only for the lifetime of the request. All one-shot derivations (URL,
/// client IP, runtime metadata) happen at decode time, before middleware can
/// observe the value.
pub struct Request {
    url: Url,
    method: Method,
    headers: Headers,
    body: Body,
    body_used: bool,
    context: HashMap<String, serde_json::Value>,
    runtime: Arc<RuntimeContext>,
    ip: Option<String>,
    wait_until: Option<WaitUntil>,
    web_socket_upgraded: bool,
    raw_web_socket: Option<RawAttachment>,
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("method", &self.method)
            .field("url", &self.url)
            .field("headers", &self.headers.len())
            .field("body_used", &self.body_used)
            .field("ip", &self.ip)
            .field("web_socket_upgraded", &self.web_socket_upgraded)
            .finish_non_exhaustive()
    }
}

impl Request {
    /// Create a request with the given method and URL.
    #[must_use]
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            url,
            method,
            headers: Headers::new(),
            body: Body::Empty,
            body_used: false,
            context: HashMap::new(),
            runtime: Arc::new(RuntimeContext::default()),
            ip: None,
            wait_until: None,
            web_socket_upgraded: false,
            raw_web_socket: None,
        }
    }

    /// The absolute request URL.
    #[must_use]
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// The request method (normalized uppercase).
    #[must_use]
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// Request headers.
    #[must_use]
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Mutable request headers.
    pub fn headers_mut(&mut self) -> &mut Headers {
        &mut self.headers
    }

    /// The MIME type hint derived from `Content-Type`, without parameters.
    #[must_use]
    pub fn mime(&self) -> Option<String> {
        let value = self.headers.get_str("content-type")?;
        let essence = value.split(';').next()?.trim();
        if essence.is_empty() {
            None
        } else {
            Some(essence.to_ascii_lowercase())
        }
    }

    /// Take the body, marking it used. The body is consumable at most once;
    /// subsequent takes return `Body::Empty`.
    pub fn take_body(&mut self) -> Body {
        self.body_used = true;
        std::mem::replace(&mut self.body, Body::Empty)
    }

    /// Whether the body has already been consumed.
    #[must_use]
    pub fn body_used(&self) -> bool {
        self.body_used
    }

    /// Replace the body (transport/bridge use).
    pub fn set_body(&mut self, body: Body) {
        self.body = body;
        self.body_used = false;
    }

    /// Peek at the body without consuming it.
    #[must_use]
    pub fn body(&self) -> &Body {
        &self.body
    }

    /// Per-request mutable context bag with string keys.
    #[must_use]
    pub fn context(&self) -> &HashMap<String, serde_json::Value> {
        &self.context
    }

    /// Mutable access to the context bag.
    pub fn context_mut(&mut self) -> &mut HashMap<String, serde_json::Value> {
        &mut self.context
    }

    /// The per-request runtime context.
    #[must_use]
    pub fn runtime(&self) -> &Arc<RuntimeContext> {
        &self.runtime
    }

    /// Attach the runtime context (transport/bridge use).
    pub fn set_runtime(&mut self, runtime: Arc<RuntimeContext>) {
        self.runtime = runtime;
    }

    /// The resolved client IP, if known.
    #[must_use]
    pub fn ip(&self) -> Option<&str> {
        self.ip.as_deref()
    }

    /// Set the resolved client IP (transport use).
    pub fn set_ip(&mut self, ip: Option<String>) {
        self.ip = ip;
    }

    /// Register fire-and-forget background work that must settle before a
    /// graceful close completes.
    ///
    /// When no sink is attached (a hand-built request outside a server), the
    /// task is dropped and a warning is logged.
    pub fn wait_until<F>(&self, task: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        match &self.wait_until {
            Some(sink) => sink.register(task),
            None => crate::logging::warn(
                "osrv::request",
                "wait_until called on a request without a task sink; task dropped",
            ),
        }
    }

    /// Attach the background-task sink (transport/bridge use).
    pub fn set_wait_until(&mut self, sink: WaitUntil) {
        self.wait_until = Some(sink);
    }

    /// The attached background-task sink, if any.
    #[must_use]
    pub fn wait_until_sink(&self) -> Option<&WaitUntil> {
        self.wait_until.as_ref()
    }

    /// Whether this request has completed a WebSocket upgrade.
    #[must_use]
    pub fn web_socket_upgraded(&self) -> bool {
        self.web_socket_upgraded
    }

    /// Mark the request as upgraded (upgrade implementations use this).
    pub fn set_web_socket_upgraded(&mut self, upgraded: bool) {
        self.web_socket_upgraded = upgraded;
    }

    /// Attach a raw handle reserved for a WebSocket upgrade.
    pub fn set_raw_web_socket(&mut self, raw: RawAttachment) {
        self.raw_web_socket = Some(raw);
    }

    /// Take the raw WebSocket handle, if one was attached.
    pub fn take_raw_web_socket(&mut self) -> Option<RawAttachment> {
        self.raw_web_socket.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn method_parse_normalizes_uppercase() {
        assert_eq!(Method::parse("get"), Some(Method::Get));
        assert_eq!(Method::parse("PoSt"), Some(Method::Post));
        assert_eq!(
            Method::parse("purge"),
            Some(Method::Extension("PURGE".to_string()))
        );
        assert_eq!(Method::parse(""), None);
    }

    #[test]
    fn method_body_permission() {
        assert!(!Method::Get.allows_body());
        assert!(!Method::Head.allows_body());
        assert!(!Method::Trace.allows_body());
        assert!(Method::Post.allows_body());
        assert!(Method::Delete.allows_body());
    }

    #[test]
    fn url_parse_round_trip() {
        let url = Url::parse("https://example.com:8443/a/b?x=1").unwrap();
        assert_eq!(url.scheme(), "https");
        assert_eq!(url.host(), "example.com");
        assert_eq!(url.port(), Some(8443));
        assert_eq!(url.path(), "/a/b");
        assert_eq!(url.query(), Some("x=1"));
        assert_eq!(url.to_string(), "https://example.com:8443/a/b?x=1");
    }

    #[test]
    fn url_parse_ipv6_brackets() {
        let url = Url::parse("http://[::1]:3000/").unwrap();
        assert_eq!(url.host(), "::1");
        assert_eq!(url.port(), Some(3000));
        assert_eq!(url.to_string(), "http://[::1]:3000/");
    }

    #[test]
    fn url_defaults_path_to_slash() {
        let url = Url::parse("http://example.com").unwrap();
        assert_eq!(url.path(), "/");
        assert_eq!(url.path_and_query(), "/");
    }

    #[test]
    fn headers_case_insensitive_lookup_preserves_case() {
        let mut headers = Headers::new();
        headers.append("X-Custom", b"one".to_vec());
        assert_eq!(headers.get("x-custom"), Some(&b"one"[..]));

        let names: Vec<&str> = headers.iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["X-Custom"]);
    }

    #[test]
    fn headers_append_preserves_order_and_multiplicity() {
        let mut headers = Headers::new();
        headers.append("Set-Cookie", b"a=1".to_vec());
        headers.append("Content-Type", b"text/plain".to_vec());
        headers.append("Set-Cookie", b"b=2".to_vec());

        let cookies = headers.get_all("set-cookie");
        assert_eq!(cookies, vec![&b"a=1"[..], &b"b=2"[..]]);

        let names: Vec<&str> = headers.iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["Set-Cookie", "Content-Type", "Set-Cookie"]);
    }

    #[test]
    fn headers_set_replaces_all() {
        let mut headers = Headers::new();
        headers.append("Accept", b"a".to_vec());
        headers.append("accept", b"b".to_vec());
        headers.set("ACCEPT", b"c".to_vec());
        assert_eq!(headers.get_all("accept"), vec![&b"c"[..]]);
    }

    #[test]
    fn body_take_marks_used() {
        let url = Url::parse("http://localhost/").unwrap();
        let mut req = Request::new(Method::Post, url);
        req.set_body(Body::Bytes(b"hello".to_vec()));
        assert!(!req.body_used());

        let body = req.take_body();
        assert!(req.body_used());
        let bytes = futures_executor::block_on(body.into_bytes_async()).unwrap();
        assert_eq!(bytes, b"hello");

        // Second take observes an empty body.
        let again = req.take_body();
        assert!(matches!(again, Body::Empty));
    }

    #[test]
    fn failed_body_surfaces_limit_error() {
        let body = Body::failed(BodyError::TooLarge { max: 4, actual: 10 });
        let err = futures_executor::block_on(body.into_bytes_async()).unwrap_err();
        assert_eq!(err, BodyError::TooLarge { max: 4, actual: 10 });
    }

    #[test]
    fn mime_hint_strips_parameters() {
        let url = Url::parse("http://localhost/").unwrap();
        let mut req = Request::new(Method::Post, url);
        req.headers_mut()
            .append("Content-Type", b"application/JSON; charset=utf-8".to_vec());
        assert_eq!(req.mime().as_deref(), Some("application/json"));
    }

    #[test]
    fn context_bag_is_string_keyed() {
        let url = Url::parse("http://localhost/").unwrap();
        let mut req = Request::new(Method::Get, url);
        req.context_mut()
            .insert("user".to_string(), serde_json::json!({"id": 7}));
        assert_eq!(req.context()["user"]["id"], 7);
    }
}
