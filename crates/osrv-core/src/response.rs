//! HTTP response types.

use serde::Serialize;
use std::fmt;
use std::pin::Pin;

use asupersync::stream::Stream;

/// HTTP status code, valid in the range 100..=599.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StatusCode(u16);

impl StatusCode {
    /// 101 Switching Protocols
    pub const SWITCHING_PROTOCOLS: Self = Self(101);
    /// 200 OK
    pub const OK: Self = Self(200);
    /// 201 Created
    pub const CREATED: Self = Self(201);
    /// 204 No Content
    pub const NO_CONTENT: Self = Self(204);
    /// 400 Bad Request
    pub const BAD_REQUEST: Self = Self(400);
    /// 404 Not Found
    pub const NOT_FOUND: Self = Self(404);
    /// 408 Request Timeout
    pub const REQUEST_TIMEOUT: Self = Self(408);
    /// 413 Payload Too Large
    pub const PAYLOAD_TOO_LARGE: Self = Self(413);
    /// 426 Upgrade Required
    pub const UPGRADE_REQUIRED: Self = Self(426);
    /// 500 Internal Server Error
    pub const INTERNAL_SERVER_ERROR: Self = Self(500);
    /// 503 Service Unavailable
    pub const SERVICE_UNAVAILABLE: Self = Self(503);

    /// Create a status code, clamping nothing: out-of-range values are
    /// rejected.
    #[must_use]
    pub fn from_u16(code: u16) -> Option<Self> {
        if (100..=599).contains(&code) {
            Some(Self(code))
        } else {
            None
        }
    }

    /// Numeric value.
    #[must_use]
    pub const fn as_u16(self) -> u16 {
        self.0
    }

    /// Whether a body is allowed with this status.
    #[must_use]
    pub const fn allows_body(self) -> bool {
        !matches!(self.0, 100..=103 | 204 | 304)
    }

    /// Canonical reason phrase.
    #[must_use]
    pub const fn canonical_reason(self) -> &'static str {
        match self.0 {
            100 => "Continue",
            101 => "Switching Protocols",
            200 => "OK",
            201 => "Created",
            202 => "Accepted",
            204 => "No Content",
            206 => "Partial Content",
            301 => "Moved Permanently",
            302 => "Found",
            303 => "See Other",
            304 => "Not Modified",
            307 => "Temporary Redirect",
            308 => "Permanent Redirect",
            400 => "Bad Request",
            401 => "Unauthorized",
            403 => "Forbidden",
            404 => "Not Found",
            405 => "Method Not Allowed",
            408 => "Request Timeout",
            413 => "Payload Too Large",
            415 => "Unsupported Media Type",
            422 => "Unprocessable Entity",
            426 => "Upgrade Required",
            429 => "Too Many Requests",
            500 => "Internal Server Error",
            502 => "Bad Gateway",
            503 => "Service Unavailable",
            504 => "Gateway Timeout",
            _ => "Unknown",
        }
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Streamed response body.
pub type ResponseBodyStream = Pin<Box<dyn Stream<Item = Vec<u8>> + Send>>;

/// Response body.
pub enum ResponseBody {
    /// Empty body.
    Empty,
    /// Single buffer.
    Bytes(Vec<u8>),
    /// Byte stream, consumable at most once.
    Stream(ResponseBodyStream),
}

impl ResponseBody {
    /// Create a streaming body.
    #[must_use]
    pub fn stream<S>(stream: S) -> Self
    where
        S: Stream<Item = Vec<u8>> + Send + 'static,
    {
        Self::Stream(Box::pin(stream))
    }

    /// Whether the body is known to be empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Empty) || matches!(self, Self::Bytes(b) if b.is_empty())
    }

    /// Length when buffered, `None` for streams.
    #[must_use]
    pub fn len(&self) -> Option<usize> {
        match self {
            Self::Empty => Some(0),
            Self::Bytes(b) => Some(b.len()),
            Self::Stream(_) => None,
        }
    }
}

impl fmt::Debug for ResponseBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => f.debug_tuple("Empty").finish(),
            Self::Bytes(bytes) => f.debug_tuple("Bytes").field(&bytes.len()).finish(),
            Self::Stream(_) => f.debug_tuple("Stream").finish(),
        }
    }
}

/// Check that a header name contains only valid HTTP token characters
/// (RFC 7230).
fn is_valid_header_name(name: &str) -> bool {
    !name.is_empty()
        && name.bytes().all(|b| {
            matches!(b,
                b'!' | b'#' | b'$' | b'%' | b'&' | b'\'' | b'*' | b'+' | b'-' | b'.' |
                b'0'..=b'9' | b'A'..=b'Z' | b'^' | b'_' | b'`' | b'a'..=b'z' | b'|' | b'~'
            )
        })
}

/// Strip CR, LF and NUL from a header value to prevent response splitting.
fn sanitize_header_value(value: Vec<u8>) -> Vec<u8> {
    if value
        .iter()
        .all(|&b| b != b'\r' && b != b'\n' && b != 0)
    {
        return value;
    }
    value
        .into_iter()
        .filter(|&b| b != b'\r' && b != b'\n' && b != 0)
        .collect()
}

/// HTTP response.
///
/// Headers are kept as ordered pairs so `set-cookie` multiplicity and
/// insertion order survive to the wire.
#[derive(Debug)]
pub struct Response {
    status: StatusCode,
    reason: Option<String>,
    headers: Vec<(String, Vec<u8>)>,
    body: ResponseBody,
}

impl Response {
    /// Create a response with the given status.
    #[must_use]
    pub fn with_status(status: StatusCode) -> Self {
        Self {
            status,
            reason: None,
            headers: Vec::new(),
            body: ResponseBody::Empty,
        }
    }

    /// Create a 200 OK response.
    #[must_use]
    pub fn ok() -> Self {
        Self::with_status(StatusCode::OK)
    }

    /// Create a 101 Switching Protocols response.
    #[must_use]
    pub fn switching_protocols() -> Self {
        Self::with_status(StatusCode::SWITCHING_PROTOCOLS)
    }

    /// Create a 200 response with a `text/plain` body.
    #[must_use]
    pub fn text(body: impl Into<String>) -> Self {
        Self::ok()
            .header("content-type", b"text/plain; charset=utf-8".to_vec())
            .body(ResponseBody::Bytes(body.into().into_bytes()))
    }

    /// Create a 200 response with an `application/json` body.
    ///
    /// Serialization failures degrade to a 500 with a plain-text body rather
    /// than panicking inside a handler.
    #[must_use]
    pub fn json<T: Serialize>(value: &T) -> Self {
        match serde_json::to_vec(value) {
            Ok(bytes) => Self::ok()
                .header("content-type", b"application/json".to_vec())
                .body(ResponseBody::Bytes(bytes)),
            Err(err) => Self::with_status(StatusCode::INTERNAL_SERVER_ERROR)
                .header("content-type", b"text/plain; charset=utf-8".to_vec())
                .body(ResponseBody::Bytes(
                    format!("response serialization failed: {err}").into_bytes(),
                )),
        }
    }

    /// Add a header, preserving existing values with the same name.
    ///
    /// Invalid names are dropped; values are sanitized against CRLF
    /// injection.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        let name = name.into();
        if is_valid_header_name(&name) {
            self.headers.push((name, sanitize_header_value(value.into())));
        }
        self
    }

    /// Replace all values for a header name.
    #[must_use]
    pub fn header_replace(mut self, name: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        let name = name.into();
        if is_valid_header_name(&name) {
            self.headers.retain(|(n, _)| !n.eq_ignore_ascii_case(&name));
            self.headers.push((name, sanitize_header_value(value.into())));
        }
        self
    }

    /// Set a custom reason phrase.
    #[must_use]
    pub fn reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    /// Set the body.
    #[must_use]
    pub fn body(mut self, body: ResponseBody) -> Self {
        self.body = body;
        self
    }

    /// The response status.
    #[must_use]
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// The reason phrase: custom if set, else the canonical one.
    #[must_use]
    pub fn reason_phrase(&self) -> &str {
        self.reason
            .as_deref()
            .unwrap_or_else(|| self.status.canonical_reason())
    }

    /// Ordered header pairs.
    #[must_use]
    pub fn headers(&self) -> &[(String, Vec<u8>)] {
        &self.headers
    }

    /// First header value for a name (case-insensitive).
    #[must_use]
    pub fn header_value(&self, name: &str) -> Option<&[u8]> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_slice())
    }

    /// Borrow the body.
    #[must_use]
    pub fn body_ref(&self) -> &ResponseBody {
        &self.body
    }

    /// Take the body for writing, leaving `Empty` behind. Consumable at most
    /// once.
    pub fn take_body(&mut self) -> ResponseBody {
        std::mem::replace(&mut self.body, ResponseBody::Empty)
    }

    /// Decompose into status, headers and body (bridge serialization use).
    #[must_use]
    pub fn into_parts(self) -> (StatusCode, Vec<(String, Vec<u8>)>, ResponseBody) {
        (self.status, self.headers, self.body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_code_range_enforced() {
        assert!(StatusCode::from_u16(99).is_none());
        assert!(StatusCode::from_u16(600).is_none());
        assert_eq!(StatusCode::from_u16(418).unwrap().as_u16(), 418);
    }

    #[test]
    fn reason_defaults_to_canonical() {
        let resp = Response::ok();
        assert_eq!(resp.reason_phrase(), "OK");
        let resp = Response::ok().reason("Fine");
        assert_eq!(resp.reason_phrase(), "Fine");
    }

    #[test]
    fn set_cookie_multiplicity_preserved() {
        let resp = Response::ok()
            .header("set-cookie", b"a=1".to_vec())
            .header("x-other", b"v".to_vec())
            .header("set-cookie", b"b=2".to_vec());

        let cookies: Vec<&[u8]> = resp
            .headers()
            .iter()
            .filter(|(n, _)| n.eq_ignore_ascii_case("set-cookie"))
            .map(|(_, v)| v.as_slice())
            .collect();
        assert_eq!(cookies, vec![&b"a=1"[..], &b"b=2"[..]]);
    }

    #[test]
    fn header_values_sanitized() {
        let resp = Response::ok().header("x-test", b"a\r\nInjected: yes".to_vec());
        assert_eq!(resp.header_value("x-test"), Some(&b"aInjected: yes"[..]));
    }

    #[test]
    fn invalid_header_names_dropped() {
        let resp = Response::ok().header("bad name", b"v".to_vec());
        assert!(resp.header_value("bad name").is_none());
    }

    #[test]
    fn json_helper_sets_content_type() {
        let resp = Response::json(&serde_json::json!({"ok": true}));
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.header_value("content-type"),
            Some(&b"application/json"[..])
        );
    }

    #[test]
    fn body_take_leaves_empty() {
        let mut resp = Response::text("hi");
        let body = resp.take_body();
        assert!(matches!(body, ResponseBody::Bytes(b) if b == b"hi"));
        assert!(matches!(resp.take_body(), ResponseBody::Empty));
    }
}
