//! Core types and server orchestrator for osrv.
//!
//! osrv is a unified HTTP/1.1 + HTTP/2 + TLS server core built around a
//! single fetch-style handler contract: a request goes in, a response comes
//! out. This crate holds everything runtime-agnostic:
//!
//! - Semantic [`Request`], [`Response`] and [`Headers`] value types
//! - The [`RuntimeContext`] metadata carrier attached to every request
//! - The middleware onion and plugin lifecycle hooks
//! - The [`Server`] orchestrator: configuration resolution, lifecycle state
//!   machine, error-stage routing, background-task draining, graceful close
//! - The JSON [`bridge`] allowing foreign hosts to invoke dispatch without a
//!   native socket
//!
//! The native socket transport lives in `osrv-http`; the `osrv` facade crate
//! ties the two together.

#![forbid(unsafe_code)]

pub mod bridge;
pub mod config;
pub mod encoding;
pub mod error;
pub mod logging;
pub mod middleware;
pub mod plugin;
pub mod request;
pub mod response;
pub mod runtime;
pub mod server;
pub mod shutdown;
pub mod tasks;

pub use config::{
    GracefulShutdownOptions, PemSource, ResolvedConfig, ServerOptions, ServerSecurityLimits,
    TlsConfig, WebSocketLimits,
};
pub use error::{BoxError, ErrorStage, ServerError, TransportError};
pub use logging::{LogConfig, LogLevel};
pub use middleware::{BoxFuture, FetchHandler, Middleware, Next};
pub use plugin::{HookResult, Plugin};
pub use request::{Body, BodyError, BodyStream, Headers, Method, Request, Url};
pub use response::{Response, ResponseBody, StatusCode};
pub use runtime::{HttpVersion, Protocol, RawHandle, RuntimeContext, ServerCapabilities};
pub use server::{
    BindInfo, ErrorHandler, LifecycleState, Server, ServerBuilder, ServerCore, Transport,
    UnsupportedTransport,
};
pub use shutdown::{InFlightGuard, InFlightTracker, ShutdownSignal};
pub use tasks::{TaskSet, WaitUntil};
