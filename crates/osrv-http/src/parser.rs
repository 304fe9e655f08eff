//! HTTP/1.1 request head parsing.
//!
//! The connection loop feeds a growing buffer; [`parse_head`] reports either
//! a complete head (with the number of bytes consumed) or that more data is
//! needed. Header name case is preserved; lookups elsewhere are
//! case-insensitive.

use osrv_core::runtime::HttpVersion;
use osrv_core::Method;

/// HTTP parsing error.
#[derive(Debug, PartialEq, Eq)]
pub enum ParseError {
    /// Invalid request line.
    InvalidRequestLine,
    /// Invalid HTTP method.
    InvalidMethod,
    /// Unsupported HTTP version token.
    InvalidVersion,
    /// Invalid header line.
    InvalidHeader,
    /// Invalid header name (non-token characters).
    InvalidHeaderName,
    /// Request line too long.
    RequestLineTooLong,
    /// Header line too long.
    HeaderLineTooLong,
    /// Too many headers.
    TooManyHeaders,
    /// Header block too large.
    HeadersTooLarge,
    /// Both Transfer-Encoding and Content-Length, or repeated conflicting
    /// Content-Length values.
    AmbiguousBodyLength,
    /// Unsupported or invalid Transfer-Encoding.
    InvalidTransferEncoding,
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidRequestLine => write!(f, "invalid request line"),
            Self::InvalidMethod => write!(f, "invalid HTTP method"),
            Self::InvalidVersion => write!(f, "invalid HTTP version"),
            Self::InvalidHeader => write!(f, "invalid header"),
            Self::InvalidHeaderName => write!(f, "invalid header name"),
            Self::RequestLineTooLong => write!(f, "request line too long"),
            Self::HeaderLineTooLong => write!(f, "header line too long"),
            Self::TooManyHeaders => write!(f, "too many headers"),
            Self::HeadersTooLarge => write!(f, "headers too large"),
            Self::AmbiguousBodyLength => write!(f, "ambiguous body length"),
            Self::InvalidTransferEncoding => write!(f, "invalid transfer-encoding"),
        }
    }
}

impl std::error::Error for ParseError {}

/// Parsing limits for request line and headers.
#[derive(Debug, Clone)]
pub struct ParseLimits {
    /// Maximum request line length in bytes.
    pub max_request_line_len: usize,
    /// Maximum number of headers.
    pub max_header_count: usize,
    /// Maximum length of a single header line.
    pub max_header_line_len: usize,
    /// Maximum total header block size.
    pub max_headers_size: usize,
}

impl Default for ParseLimits {
    fn default() -> Self {
        Self {
            max_request_line_len: 8 * 1024,
            max_header_count: 100,
            max_header_line_len: 8 * 1024,
            max_headers_size: 64 * 1024,
        }
    }
}

/// A parsed request head.
#[derive(Debug)]
pub struct RequestHead {
    /// Normalized request method.
    pub method: Method,
    /// Raw request target (origin-form or absolute-form).
    pub target: String,
    /// HTTP version.
    pub version: HttpVersion,
    /// Headers in wire order with original name case.
    pub headers: Vec<(String, Vec<u8>)>,
}

impl RequestHead {
    /// First header value for a name, case-insensitive.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&[u8]> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_slice())
    }

    /// First header value as a string.
    #[must_use]
    pub fn header_str(&self, name: &str) -> Option<&str> {
        self.header(name).and_then(|v| std::str::from_utf8(v).ok())
    }
}

/// Head parse status.
#[derive(Debug)]
pub enum HeadStatus {
    /// A complete head; `consumed` bytes of the buffer belong to it.
    Complete {
        /// The parsed head.
        head: RequestHead,
        /// Bytes consumed from the buffer.
        consumed: usize,
    },
    /// More data needed.
    Incomplete,
}

fn is_token_byte(b: u8) -> bool {
    matches!(b,
        b'!' | b'#' | b'$' | b'%' | b'&' | b'\'' | b'*' | b'+' | b'-' | b'.' |
        b'0'..=b'9' | b'A'..=b'Z' | b'^' | b'_' | b'`' | b'a'..=b'z' | b'|' | b'~'
    )
}

/// Find the end of the header block (`\r\n\r\n`), returning the offset just
/// past it.
fn find_head_end(buffer: &[u8]) -> Option<usize> {
    buffer
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|pos| pos + 4)
}

/// Try to parse a complete request head from the buffer.
///
/// # Errors
///
/// Returns a parse error for malformed input or exceeded limits; limits are
/// also enforced on incomplete data so an attacker cannot grow the buffer
/// unboundedly.
pub fn parse_head(buffer: &[u8], limits: &ParseLimits) -> Result<HeadStatus, ParseError> {
    let Some(end) = find_head_end(buffer) else {
        // Bound the buffer even before the head completes.
        if buffer.len() > limits.max_headers_size + limits.max_request_line_len {
            return Err(ParseError::HeadersTooLarge);
        }
        if !buffer.contains(&b'\n') && buffer.len() > limits.max_request_line_len {
            return Err(ParseError::RequestLineTooLong);
        }
        return Ok(HeadStatus::Incomplete);
    };

    let head_bytes = &buffer[..end - 4];
    if head_bytes.len() > limits.max_headers_size + limits.max_request_line_len {
        return Err(ParseError::HeadersTooLarge);
    }

    let mut lines = head_bytes.split(|&b| b == b'\n');
    let request_line = lines.next().ok_or(ParseError::InvalidRequestLine)?;
    let request_line = strip_cr(request_line);
    if request_line.len() > limits.max_request_line_len {
        return Err(ParseError::RequestLineTooLong);
    }
    let (method, target, version) = parse_request_line(request_line)?;

    let mut headers = Vec::new();
    for line in lines {
        let line = strip_cr(line);
        if line.is_empty() {
            continue;
        }
        if line.len() > limits.max_header_line_len {
            return Err(ParseError::HeaderLineTooLong);
        }
        if headers.len() >= limits.max_header_count {
            return Err(ParseError::TooManyHeaders);
        }
        let colon = line
            .iter()
            .position(|&b| b == b':')
            .ok_or(ParseError::InvalidHeader)?;
        let (name, rest) = line.split_at(colon);
        if name.is_empty() || !name.iter().all(|&b| is_token_byte(b)) {
            return Err(ParseError::InvalidHeaderName);
        }
        let value = trim_ows(&rest[1..]);
        let name = String::from_utf8(name.to_vec()).map_err(|_| ParseError::InvalidHeaderName)?;
        headers.push((name, value.to_vec()));
    }

    Ok(HeadStatus::Complete {
        head: RequestHead {
            method,
            target,
            version,
            headers,
        },
        consumed: end,
    })
}

fn strip_cr(line: &[u8]) -> &[u8] {
    line.strip_suffix(b"\r").unwrap_or(line)
}

fn trim_ows(value: &[u8]) -> &[u8] {
    let start = value
        .iter()
        .position(|&b| b != b' ' && b != b'\t')
        .unwrap_or(value.len());
    let end = value
        .iter()
        .rposition(|&b| b != b' ' && b != b'\t')
        .map_or(start, |p| p + 1);
    &value[start..end]
}

fn parse_request_line(line: &[u8]) -> Result<(Method, String, HttpVersion), ParseError> {
    if line.iter().any(|&b| b == 0) {
        return Err(ParseError::InvalidRequestLine);
    }
    let text = std::str::from_utf8(line).map_err(|_| ParseError::InvalidRequestLine)?;
    let mut parts = text.split(' ').filter(|p| !p.is_empty());
    let method_token = parts.next().ok_or(ParseError::InvalidRequestLine)?;
    let target = parts.next().ok_or(ParseError::InvalidRequestLine)?;
    let version_token = parts.next().ok_or(ParseError::InvalidRequestLine)?;
    if parts.next().is_some() {
        return Err(ParseError::InvalidRequestLine);
    }

    let method = Method::parse(method_token).ok_or(ParseError::InvalidMethod)?;
    let version = match version_token {
        "HTTP/1.1" => HttpVersion::Http11,
        "HTTP/1.0" => HttpVersion::Http10,
        _ => return Err(ParseError::InvalidVersion),
    };
    Ok((method, target.to_string(), version))
}

/// How the request body is delimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyLength {
    /// No body.
    None,
    /// Exactly this many bytes.
    ContentLength(u64),
    /// Chunked transfer coding.
    Chunked,
}

/// Determine the body length for a parsed head.
///
/// # Errors
///
/// Rejects requests carrying both `Transfer-Encoding` and `Content-Length`
/// (request-smuggling vector) and unsupported transfer codings.
pub fn body_length(head: &RequestHead) -> Result<BodyLength, ParseError> {
    let transfer_encoding = head.header_str("transfer-encoding");
    let content_length = head.header("content-length");

    if let Some(te) = transfer_encoding {
        if content_length.is_some() {
            return Err(ParseError::AmbiguousBodyLength);
        }
        let last = te
            .split(',')
            .map(str::trim)
            .last()
            .unwrap_or_default()
            .to_ascii_lowercase();
        if last == "chunked" {
            return Ok(BodyLength::Chunked);
        }
        return Err(ParseError::InvalidTransferEncoding);
    }

    match content_length {
        None => Ok(BodyLength::None),
        Some(raw) => {
            let text = std::str::from_utf8(raw).map_err(|_| ParseError::AmbiguousBodyLength)?;
            let value: u64 = text
                .trim()
                .parse()
                .map_err(|_| ParseError::AmbiguousBodyLength)?;
            if value == 0 {
                Ok(BodyLength::None)
            } else {
                Ok(BodyLength::ContentLength(value))
            }
        }
    }
}
