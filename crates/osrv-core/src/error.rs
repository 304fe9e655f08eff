//! Error taxonomy and default error responses.

use std::fmt;

use crate::request::BodyError;
use crate::response::{Response, ResponseBody, StatusCode};

/// Boxed error type used at the handler boundary.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// The lifecycle stage an error was raised in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorStage {
    /// A plugin `on_register` hook failed.
    Register,
    /// A plugin `on_before_serve` hook failed.
    BeforeServe,
    /// A plugin `on_after_serve` hook failed.
    AfterServe,
    /// A middleware or the user fetch handler failed.
    Request,
    /// A plugin `on_before_close` hook failed.
    BeforeClose,
    /// A plugin `on_after_close` hook failed.
    AfterClose,
    /// The transport failed (bind, TLS, framing, stream I/O).
    Transport,
    /// Stage could not be determined.
    Unknown,
}

impl ErrorStage {
    /// Stage name used in logs and plugin notifications.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Register => "register",
            Self::BeforeServe => "beforeServe",
            Self::AfterServe => "afterServe",
            Self::Request => "request",
            Self::BeforeClose => "beforeClose",
            Self::AfterClose => "afterClose",
            Self::Transport => "transport",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ErrorStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transport-level failure.
#[derive(Debug)]
pub enum TransportError {
    /// Listener bind failed.
    Bind(std::io::Error),
    /// TLS material could not be loaded or was rejected.
    Tls(String),
    /// Protocol framing violation.
    Protocol(String),
    /// Stream I/O failed.
    Io(std::io::Error),
    /// The transport does not support the requested operation.
    Unsupported(String),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bind(e) => write!(f, "listener bind failed: {e}"),
            Self::Tls(msg) => write!(f, "TLS error: {msg}"),
            Self::Protocol(msg) => write!(f, "protocol error: {msg}"),
            Self::Io(e) => write!(f, "stream I/O error: {e}"),
            Self::Unsupported(msg) => write!(f, "unsupported: {msg}"),
        }
    }
}

impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Bind(e) | Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

/// The unified server error.
#[derive(Debug)]
pub enum ServerError {
    /// The request body exceeded the configured byte limit. Surfaced to the
    /// client as HTTP 413 with a JSON body naming both bounds.
    RequestLimitExceeded {
        /// The configured maximum in bytes.
        max_bytes: u64,
        /// The observed (or declared) body size in bytes.
        actual_bytes: u64,
    },
    /// Transport failure; in lifecycle stages, rethrown after plugin
    /// notification.
    Transport(TransportError),
    /// The user fetch handler or a middleware failed.
    Handler(BoxError),
    /// A plugin hook or the close path failed.
    Lifecycle {
        /// Stage the failure occurred in.
        stage: ErrorStage,
        /// The underlying failure.
        source: BoxError,
    },
}

impl ServerError {
    /// Create a handler error from any message.
    #[must_use]
    pub fn handler(msg: impl Into<String>) -> Self {
        Self::Handler(msg.into().into())
    }

    /// The stage this error belongs to when routed through plugins.
    #[must_use]
    pub fn stage(&self) -> ErrorStage {
        match self {
            Self::RequestLimitExceeded { .. } | Self::Handler(_) => ErrorStage::Request,
            Self::Transport(_) => ErrorStage::Transport,
            Self::Lifecycle { stage, .. } => *stage,
        }
    }
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RequestLimitExceeded {
                max_bytes,
                actual_bytes,
            } => write!(
                f,
                "request body too large: {actual_bytes} bytes exceeds limit of {max_bytes}"
            ),
            Self::Transport(e) => write!(f, "transport error: {e}"),
            Self::Handler(e) => write!(f, "handler error: {e}"),
            Self::Lifecycle { stage, source } => {
                write!(f, "lifecycle error in {stage}: {source}")
            }
        }
    }
}

impl std::error::Error for ServerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Transport(e) => Some(e),
            Self::Handler(e) => Some(e.as_ref()),
            Self::Lifecycle { source, .. } => Some(source.as_ref()),
            Self::RequestLimitExceeded { .. } => None,
        }
    }
}

impl From<TransportError> for ServerError {
    fn from(e: TransportError) -> Self {
        Self::Transport(e)
    }
}

impl From<BodyError> for ServerError {
    fn from(e: BodyError) -> Self {
        match e {
            BodyError::TooLarge { max, actual } => Self::RequestLimitExceeded {
                max_bytes: max,
                actual_bytes: actual,
            },
            other => Self::Handler(Box::new(other)),
        }
    }
}

/// Build the 413 response for an over-limit request body.
#[must_use]
pub fn limit_exceeded_response(max_bytes: u64, actual_bytes: u64) -> Response {
    Response::with_status(StatusCode::PAYLOAD_TOO_LARGE)
        .header("content-type", b"application/json".to_vec())
        .body(ResponseBody::Bytes(
            serde_json::to_vec(&serde_json::json!({
                "ok": false,
                "error": "Request body too large",
                "maxBytes": max_bytes,
                "actualBytes": actual_bytes,
            }))
            .unwrap_or_default(),
        ))
}

/// Build the default 500 response for an unhandled error.
///
/// In production mode the body carries no diagnostic details; otherwise the
/// error text and a stack rendering are included.
#[must_use]
pub fn default_error_response(production: bool, error: &ServerError, stack: &str) -> Response {
    let body = if production {
        serde_json::json!({
            "ok": false,
            "error": "Internal Server Error",
        })
    } else {
        serde_json::json!({
            "ok": false,
            "error": "Internal Server Error",
            "details": error.to_string(),
            "stack": stack,
        })
    };
    Response::with_status(StatusCode::INTERNAL_SERVER_ERROR)
        .header("content-type", b"application/json".to_vec())
        .body(ResponseBody::Bytes(
            serde_json::to_vec(&body).unwrap_or_default(),
        ))
}

/// Render a best-effort stack trace for an error.
///
/// Rust has no portable runtime stack capture for arbitrary error values;
/// this renders the error chain instead, which is what the diagnostic field
/// carries.
#[must_use]
pub fn render_stack(error: &(dyn std::error::Error + 'static)) -> String {
    let mut out = String::new();
    out.push_str(&error.to_string());
    let mut source = error.source();
    while let Some(cause) = source {
        out.push_str("\n  caused by: ");
        out.push_str(&cause.to_string());
        source = cause.source();
    }
    out
}
