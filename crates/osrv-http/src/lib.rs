//! Native HTTP/1.1 + HTTP/2 + TLS + WebSocket transport for osrv.
//!
//! This crate owns everything that touches a socket:
//!
//! - [`parser`]: HTTP/1.1 request head parsing
//! - [`body`]: size-limited body reading (content-length and chunked)
//! - [`connection`]: keep-alive, hop-by-hop filtering, client IP, URL
//!   assembly
//! - [`response`]: HTTP/1.1 response serialization
//! - [`tls`]: rustls termination with ALPN `h2` / `http/1.1`
//! - [`http2`]: HTTP/2 framing + HPACK and the per-connection driver
//! - [`websocket`]: RFC 6455 upgrades, frames and limits
//! - [`server`]: the [`NativeTransport`] accept loop and close discipline
//! - [`signals`]: opt-in SIGINT/SIGTERM subscription

#![deny(unsafe_code)]

pub mod body;
pub mod connection;
pub mod http2;
pub mod io;
pub mod parser;
pub mod response;
pub mod server;
pub mod signals;
pub mod tls;
pub mod websocket;

pub use body::{read_body, BodyOutcome};
pub use connection::{
    assemble_url, is_hop_by_hop, resolve_client_ip, wants_websocket_upgrade, ConnectionInfo,
    HOP_BY_HOP_HEADERS,
};
pub use io::RawDuplex;
pub use parser::{body_length, parse_head, BodyLength, HeadStatus, ParseError, ParseLimits, RequestHead};
pub use response::write_response;
pub use server::NativeTransport;
pub use signals::SignalListener;
pub use tls::{build_server_config, NegotiatedProtocol, TlsStream};
pub use websocket::{
    accept_key, upgrade_web_socket, validate_upgrade_request, Message, NativeUpgradeSlot,
    WebSocket, WebSocketError,
};
