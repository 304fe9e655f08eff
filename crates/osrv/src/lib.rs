//! osrv: a unified HTTP/1.1 + HTTP/2 + TLS server core.
//!
//! One contract — a fetch-style handler taking a [`Request`] and returning a
//! [`Response`] — wrapped in a full serving lifecycle: middleware pipeline,
//! plugin hooks, structured error handling, graceful shutdown with
//! background-task draining, body-size and timeout limits, optional
//! WebSocket upgrades, and a runtime-agnostic request context.
//!
//! # Quick start
//!
//! ```ignore
//! use osrv::prelude::*;
//!
//! async fn fetch(_req: &mut Request) -> Result<Response, ServerError> {
//!     Ok(Response::text("ok"))
//! }
//!
//! fn main() -> Result<(), osrv::ServerError> {
//!     let rt = asupersync::runtime::RuntimeBuilder::current_thread()
//!         .build()
//!         .expect("runtime");
//!     rt.block_on(async {
//!         let mut server = osrv::server(|req: &mut Request| fetch(req)).build();
//!         osrv::run_until_signal(&mut server).await
//!     })
//! }
//! ```
//!
//! # Crate structure
//!
//! - [`osrv_core`] — value types, orchestrator, plugins, bridge
//! - [`osrv_http`] — native socket transport (HTTP/1.1, HTTP/2, TLS,
//!   WebSocket)

#![forbid(unsafe_code)]

pub use osrv_core as core;
pub use osrv_http as http;

pub use osrv_core::{
    Body, BodyError, BodyStream, BoxError, BoxFuture, ErrorHandler, ErrorStage, FetchHandler,
    GracefulShutdownOptions, Headers, HookResult, HttpVersion, LifecycleState, LogConfig,
    LogLevel, Method, Middleware, Next, PemSource, Plugin, Protocol, RawHandle, Request,
    ResolvedConfig, Response, ResponseBody, RuntimeContext, Server, ServerBuilder,
    ServerCapabilities, ServerError, ServerOptions, ServerSecurityLimits, StatusCode, TaskSet,
    TlsConfig, Transport, TransportError, Url, WaitUntil, WebSocketLimits,
};

pub use osrv_core::bridge::{
    BridgeEnvelope, BridgeHandle, BridgeRequest, BridgeResponse, BridgeRuntime, BridgeTransport,
    BridgeWebSocket, BridgeWsMessage, UPGRADE_HINT_HEADER,
};

pub use osrv_http::{
    Message, NativeTransport, SignalListener, WebSocket, WebSocketError,
};

/// Start building a server around a fetch handler, pre-wired with the
/// native socket transport.
#[must_use]
pub fn server<H: FetchHandler + 'static>(fetch: H) -> ServerBuilder {
    Server::builder(fetch).transport(Box::new(NativeTransport::new()))
}

/// Build and start a server with defaults: native transport, configuration
/// resolved from the environment.
///
/// # Errors
///
/// Surfaces lifecycle and bind failures from [`Server::serve`].
pub async fn serve<H: FetchHandler + 'static>(fetch: H) -> Result<Server, ServerError> {
    let mut srv = server(fetch).build();
    srv.serve().await?;
    Ok(srv)
}

/// Serve until SIGINT/SIGTERM, then close gracefully.
///
/// # Errors
///
/// Surfaces lifecycle failures from `serve()` and `close()`.
pub async fn run_until_signal(server: &mut Server) -> Result<(), ServerError> {
    server.serve().await?;
    let signals = SignalListener::install();
    signals.wait().await;
    osrv_core::logging::info("osrv", "shutdown signal received; closing");
    server.close(false).await
}

/// A WebSocket obtained from [`upgrade_web_socket`], on whichever transport
/// the request arrived.
pub enum UpgradedWebSocket {
    /// A live socket on the native transport.
    Native(WebSocket),
    /// A proxied socket on the bridge; the host completes the handshake
    /// out-of-band.
    Bridge(BridgeWebSocket),
}

/// Upgrade a request to a WebSocket on whichever transport it arrived.
///
/// Fails if the request was already upgraded. Pass `limits` to override the
/// server's configured WebSocket limits for this socket.
///
/// # Errors
///
/// Handshake validation failures and double upgrades.
pub async fn upgrade_web_socket(
    req: &mut Request,
    limits: Option<WebSocketLimits>,
) -> Result<UpgradedWebSocket, ServerError> {
    if req.web_socket_upgraded() {
        return Err(ServerError::handler("request was already upgraded"));
    }
    let raw = req
        .take_raw_web_socket()
        .ok_or_else(|| ServerError::handler("request is not upgradeable on this transport"))?;

    if raw.is::<osrv_http::NativeUpgradeSlot>() {
        req.set_raw_web_socket(raw);
        let ws = osrv_http::upgrade_web_socket(req, limits).await?;
        Ok(UpgradedWebSocket::Native(ws))
    } else {
        req.set_raw_web_socket(raw);
        let ws = osrv_core::bridge::upgrade_web_socket(req)?;
        Ok(UpgradedWebSocket::Bridge(ws))
    }
}

/// Prelude for handler code.
pub mod prelude {
    pub use crate::{
        upgrade_web_socket, Body, ErrorStage, Headers, HttpVersion, Method, Middleware, Next,
        Plugin, Protocol, Request, Response, ResponseBody, Server, ServerError, ServerOptions,
        StatusCode, UpgradedWebSocket, Url, WebSocketLimits,
    };
}
