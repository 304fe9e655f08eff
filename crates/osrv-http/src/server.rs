//! The native socket transport.
//!
//! Binding discipline: plain TCP for `http`; for `https`, TLS material is
//! loaded up front and the listener negotiates `h2` / `http/1.1` via ALPN,
//! falling back to HTTPS-over-HTTP/1.1 when HTTP/2 is disabled.
//!
//! The accept loop runs on a dedicated thread with its own single-threaded
//! runtime; each accepted connection gets a thread of its own, so request
//! handlers run in parallel and may block on I/O independently. Closing the
//! listener first rejects new connections; in-flight connections get the
//! graceful timeout to finish before the close is forced.

use std::net::SocketAddr;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Instant;

use asupersync::net::{TcpListener, TcpStream};

use osrv_core::response::{Response, ResponseBody, StatusCode};
use osrv_core::runtime::{HttpVersion, Protocol, RawHandle, RuntimeContext, ServerCapabilities};
use osrv_core::server::{BindInfo, ServerCore, Transport};
use osrv_core::{InFlightTracker, Method, Request, ShutdownSignal, TransportError};

use crate::body::{io_body_error, read_body, BodyOutcome};
use crate::connection::{
    assemble_url, resolve_client_ip, wants_websocket_upgrade, ConnectionInfo,
};
use crate::http2::{self, H2ConnMeta};
use crate::io::{read_once, RawDuplex};
use crate::parser::{body_length, parse_head, HeadStatus, ParseLimits, RequestHead};
use crate::response::write_response;
use crate::tls::{build_server_config, NegotiatedProtocol, TlsStream};
use crate::websocket::NativeUpgradeSlot;

const LOG_TARGET: &str = "osrv::transport";

/// The native listener transport.
#[derive(Default)]
pub struct NativeTransport {
    running: Option<Running>,
}

struct Running {
    signal: ShutdownSignal,
    in_flight: InFlightTracker,
    local_addr: SocketAddr,
    accept_thread: std::thread::JoinHandle<()>,
    graceful_timeout: std::time::Duration,
    force_timeout: std::time::Duration,
}

impl NativeTransport {
    /// Create an unbound transport.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The close signal, for wiring signal handlers.
    #[must_use]
    pub fn shutdown_signal(&self) -> Option<ShutdownSignal> {
        self.running.as_ref().map(|r| r.signal.clone())
    }
}

impl Transport for NativeTransport {
    fn name(&self) -> &'static str {
        "native"
    }

    fn bind(&mut self, core: Arc<ServerCore>) -> Result<BindInfo, TransportError> {
        if self.running.is_some() {
            return Err(TransportError::Unsupported(
                "transport is already bound".to_string(),
            ));
        }
        let config = core.config().clone();

        // Load TLS material before spawning anything so misconfiguration
        // fails the bind, not the first connection.
        let tls = match (&config.tls, config.protocol) {
            (Some(tls_config), Protocol::Https) => {
                Some(build_server_config(tls_config, config.http2)?)
            }
            (None, Protocol::Https) => {
                return Err(TransportError::Tls(
                    "https configured without certificate and key".to_string(),
                ));
            }
            _ => None,
        };
        let https = tls.is_some();
        let http2 = https && config.http2;
        if https && !config.http2 {
            osrv_core::logging::warn(
                LOG_TARGET,
                "HTTP/2 unavailable on this listener; serving HTTPS over HTTP/1.1",
            );
        }
        if config.reuse_port {
            // The runtime's listener carries no socket-option surface;
            // reusePort is accepted and ignored on this platform.
            osrv_core::logging::warn(LOG_TARGET, "reuse_port requested but not supported; ignored");
        }

        let signal = ShutdownSignal::new();
        let in_flight = InFlightTracker::new();
        let (ready_tx, ready_rx) = mpsc::channel();

        let accept_core = Arc::clone(&core);
        let accept_signal = signal.clone();
        let accept_in_flight = in_flight.clone();
        let accept_thread = std::thread::Builder::new()
            .name("osrv-accept".to_string())
            .spawn(move || {
                accept_thread_main(accept_core, tls, accept_signal, accept_in_flight, ready_tx);
            })
            .map_err(|e| TransportError::Bind(e))?;

        let local_addr = ready_rx
            .recv()
            .map_err(|_| {
                TransportError::Bind(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "accept thread exited before reporting bind state",
                ))
            })?
            .map_err(TransportError::Bind)?;

        self.running = Some(Running {
            signal,
            in_flight,
            local_addr,
            accept_thread,
            graceful_timeout: config.shutdown.graceful_timeout,
            force_timeout: config.shutdown.force_timeout,
        });

        Ok(BindInfo {
            capabilities: ServerCapabilities {
                http1: true,
                https,
                http2,
                websocket: true,
                request_streaming: false,
                response_streaming: true,
                wait_until: true,
                edge: false,
                tls: https,
                edge_providers: Vec::new(),
            },
            local_addr: Some(local_addr),
        })
    }

    fn close(&mut self, force: bool) -> Result<(), TransportError> {
        let Some(running) = self.running.take() else {
            return Ok(());
        };

        if force {
            running.signal.force_shutdown();
        } else {
            running.signal.shutdown();
        }
        // The accept loop may be parked in accept(); a loopback connection
        // nudges it awake to observe the signal.
        let _ = std::net::TcpStream::connect(running.local_addr);

        if !force && !running.in_flight.wait_idle(running.graceful_timeout) {
            osrv_core::logging::warn(
                LOG_TARGET,
                &format!(
                    "{} connection(s) still in flight after {:?}; forcing close",
                    running.in_flight.count(),
                    running.graceful_timeout
                ),
            );
            running.signal.force_shutdown();
        }

        let deadline = Instant::now() + running.force_timeout;
        let accept_thread = running.accept_thread;
        while !accept_thread.is_finished() && Instant::now() < deadline {
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        if accept_thread.is_finished() {
            if accept_thread.join().is_err() {
                osrv_core::logging::error(LOG_TARGET, "accept thread panicked during close");
            }
        } else {
            osrv_core::logging::warn(
                LOG_TARGET,
                "accept thread did not exit within the force timeout; detaching",
            );
        }
        Ok(())
    }
}

fn accept_thread_main(
    core: Arc<ServerCore>,
    tls: Option<Arc<rustls::ServerConfig>>,
    signal: ShutdownSignal,
    in_flight: InFlightTracker,
    ready_tx: mpsc::Sender<Result<SocketAddr, std::io::Error>>,
) {
    let rt = match asupersync::runtime::RuntimeBuilder::current_thread().build() {
        Ok(rt) => rt,
        Err(err) => {
            let _ = ready_tx.send(Err(std::io::Error::new(
                std::io::ErrorKind::Other,
                format!("runtime build failed: {err}"),
            )));
            return;
        }
    };

    rt.block_on(async move {
        let bind_addr = core.config().bind_addr();
        let listener = match TcpListener::bind(bind_addr).await {
            Ok(listener) => listener,
            Err(err) => {
                let _ = ready_tx.send(Err(err));
                return;
            }
        };
        let local_addr = match listener.local_addr() {
            Ok(addr) => addr,
            Err(err) => {
                let _ = ready_tx.send(Err(err));
                return;
            }
        };
        let _ = ready_tx.send(Ok(local_addr));

        loop {
            if signal.is_shutting_down() {
                break;
            }
            let (stream, peer_addr) = match listener.accept().await {
                Ok(conn) => conn,
                Err(err) => {
                    if signal.is_shutting_down() {
                        break;
                    }
                    osrv_core::logging::warn(LOG_TARGET, &format!("accept error: {err}"));
                    continue;
                }
            };
            if signal.is_shutting_down() {
                // This may be the close-nudge connection; drop it.
                drop(stream);
                break;
            }

            let _ = stream.set_nodelay(true);
            let guard = in_flight.track();
            let conn_core = Arc::clone(&core);
            let conn_tls = tls.clone();
            let conn_signal = signal.clone();
            let spawned = std::thread::Builder::new()
                .name("osrv-conn".to_string())
                .spawn(move || {
                    let _guard = guard;
                    run_connection(conn_core, conn_tls, stream, peer_addr, local_addr, conn_signal);
                });
            if let Err(err) = spawned {
                osrv_core::logging::error(
                    LOG_TARGET,
                    &format!("failed to spawn connection thread: {err}"),
                );
            }
        }
    });
}

fn run_connection(
    core: Arc<ServerCore>,
    tls: Option<Arc<rustls::ServerConfig>>,
    stream: TcpStream,
    peer_addr: SocketAddr,
    local_addr: SocketAddr,
    signal: ShutdownSignal,
) {
    let rt = match asupersync::runtime::RuntimeBuilder::current_thread().build() {
        Ok(rt) => rt,
        Err(err) => {
            osrv_core::logging::error(
                LOG_TARGET,
                &format!("connection runtime build failed: {err}"),
            );
            return;
        }
    };

    rt.block_on(async move {
        match tls {
            Some(tls_config) => {
                let tls_stream = match TlsStream::accept(tls_config, stream).await {
                    Ok(tls_stream) => tls_stream,
                    Err(err) => {
                        osrv_core::logging::debug(
                            LOG_TARGET,
                            &format!("TLS handshake with {peer_addr} failed: {err}"),
                        );
                        return;
                    }
                };
                match tls_stream.negotiated() {
                    NegotiatedProtocol::H2 => {
                        let meta = H2ConnMeta {
                            local_addr: Some(local_addr),
                            remote_addr: Some(peer_addr),
                            fallback_host: core.config().public_hostname().to_string(),
                            fallback_port: core.config().port,
                        };
                        if let Err(err) = http2::serve_connection(
                            tls_stream,
                            Vec::new(),
                            core,
                            meta,
                            signal,
                        )
                        .await
                        {
                            osrv_core::logging::debug(
                                LOG_TARGET,
                                &format!("h2 connection with {peer_addr} ended: {err}"),
                            );
                        }
                    }
                    NegotiatedProtocol::Http11 => {
                        serve_h1(
                            Box::new(tls_stream),
                            core,
                            Protocol::Https,
                            peer_addr,
                            local_addr,
                            signal,
                        )
                        .await;
                    }
                }
            }
            None => {
                serve_h1(
                    Box::new(stream),
                    core,
                    Protocol::Http,
                    peer_addr,
                    local_addr,
                    signal,
                )
                .await;
            }
        }
    });
}

/// Read one request head.
///
/// Timeouts are enforced at read boundaries: a partially received head past
/// `headers_timeout` is an error, and an idle keep-alive connection past
/// `idle_timeout` is closed quietly.
async fn read_head(
    stream: &mut Box<dyn RawDuplex>,
    buffer: &mut Vec<u8>,
    limits: &ParseLimits,
    headers_timeout: std::time::Duration,
    idle_timeout: std::time::Duration,
) -> Result<Option<(RequestHead, usize)>, String> {
    let started = Instant::now();
    loop {
        match parse_head(buffer, limits) {
            Ok(HeadStatus::Complete { head, consumed }) => {
                buffer.drain(..consumed);
                return Ok(Some((head, consumed)));
            }
            Ok(HeadStatus::Incomplete) => {}
            Err(err) => return Err(err.to_string()),
        }
        if !buffer.is_empty() && started.elapsed() > headers_timeout {
            return Err("headers timeout exceeded".to_string());
        }
        if buffer.is_empty() && started.elapsed() > idle_timeout {
            return Ok(None);
        }
        let mut tmp = [0u8; 8192];
        match read_once(&mut **stream, &mut tmp).await {
            Ok(0) => return Ok(None),
            Ok(n) => buffer.extend_from_slice(&tmp[..n]),
            Err(err) => {
                if buffer.is_empty() {
                    return Ok(None);
                }
                return Err(format!("read error: {err}"));
            }
        }
    }
}

async fn serve_h1(
    mut stream: Box<dyn RawDuplex>,
    core: Arc<ServerCore>,
    protocol: Protocol,
    peer_addr: SocketAddr,
    local_addr: SocketAddr,
    signal: ShutdownSignal,
) {
    let config = core.config().clone();
    let limits = ParseLimits::default();
    let mut buffer: Vec<u8> = Vec::new();

    loop {
        if signal.is_forced() {
            return;
        }

        let (head, _) = match read_head(
            &mut stream,
            &mut buffer,
            &limits,
            config.limits.headers_timeout,
            config.limits.request_timeout,
        )
        .await
        {
            Ok(Some(parsed)) => parsed,
            Ok(None) => return,
            Err(msg) => {
                osrv_core::logging::debug(
                    LOG_TARGET,
                    &format!("bad request from {peer_addr}: {msg}"),
                );
                let response = Response::with_status(StatusCode::BAD_REQUEST)
                    .header("content-type", b"text/plain; charset=utf-8".to_vec())
                    .body(ResponseBody::Bytes(b"Bad Request".to_vec()));
                let _ = write_response(&mut *stream, response, HttpVersion::Http11, false, false)
                    .await;
                return;
            }
        };

        let version = head.version;
        let is_head = head.method == Method::Head;
        let conn_info = ConnectionInfo::parse(head.header("connection"));
        let upgrade_requested = wants_websocket_upgrade(&head);

        // Decode the body (bounded) unless the method forbids one.
        let body_outcome = if head.method.allows_body() {
            match body_length(&head) {
                Ok(length) => {
                    match read_body(
                        &mut *stream,
                        &mut buffer,
                        length,
                        config.limits.max_request_body_bytes,
                    )
                    .await
                    {
                        Ok(outcome) => outcome,
                        Err(TransportError::Io(err)) => {
                            osrv_core::logging::debug(
                                LOG_TARGET,
                                &format!(
                                    "body read from {peer_addr} failed: {}",
                                    io_body_error(&err)
                                ),
                            );
                            return;
                        }
                        Err(other) => {
                            osrv_core::logging::debug(
                                LOG_TARGET,
                                &format!("bad body from {peer_addr}: {other}"),
                            );
                            let response = Response::with_status(StatusCode::BAD_REQUEST);
                            let _ = write_response(&mut *stream, response, version, false, is_head)
                                .await;
                            return;
                        }
                    }
                }
                Err(err) => {
                    let response = Response::with_status(StatusCode::BAD_REQUEST)
                        .header("content-type", b"text/plain; charset=utf-8".to_vec())
                        .body(ResponseBody::Bytes(err.to_string().into_bytes()));
                    let _ = write_response(&mut *stream, response, version, false, is_head).await;
                    return;
                }
            }
        } else {
            BodyOutcome::Complete(Vec::new())
        };

        let keep_alive = conn_info.should_keep_alive(version)
            && body_outcome.keep_alive_safe()
            && !signal.is_shutting_down();

        let mut req = build_h1_request(&core, head, protocol, peer_addr, local_addr, version);
        req.set_body(body_outcome.into_body());

        if upgrade_requested {
            // Park the connection so the handler can complete the upgrade.
            req.set_raw_web_socket(Box::new(NativeUpgradeSlot::new(
                stream,
                config.websocket.clone(),
            )));
            let response = core.dispatch(&mut req).await;
            if req.web_socket_upgraded() {
                // The socket now belongs to the handler; the 101 was written
                // during the upgrade and this response is discarded.
                return;
            }
            // Handler answered over plain HTTP; reclaim the connection.
            match req
                .take_raw_web_socket()
                .and_then(|raw| raw.downcast::<NativeUpgradeSlot>().ok())
                .and_then(|slot| slot.reclaim())
            {
                Some(reclaimed) => stream = reclaimed,
                None => return,
            }
            if write_response(&mut *stream, response, version, keep_alive, is_head)
                .await
                .is_err()
            {
                return;
            }
        } else {
            let response = core.dispatch(&mut req).await;
            if write_response(&mut *stream, response, version, keep_alive, is_head)
                .await
                .is_err()
            {
                return;
            }
        }

        if !keep_alive {
            return;
        }
    }
}

fn build_h1_request(
    core: &Arc<ServerCore>,
    head: RequestHead,
    protocol: Protocol,
    peer_addr: SocketAddr,
    local_addr: SocketAddr,
    version: HttpVersion,
) -> Request {
    let config = core.config();
    let url = assemble_url(
        &head.target,
        protocol,
        head.header_str("host"),
        config.public_hostname(),
        config.port,
    );

    let mut req = Request::new(head.method.clone(), url);
    for (name, value) in head.headers {
        req.headers_mut().append(name, value);
    }

    let ctx = RuntimeContext::builder("osrv")
        .protocol(protocol)
        .http_version(version)
        .local_address(Some(local_addr))
        .remote_address(Some(peer_addr))
        .env(config.env.clone())
        .raw(RawHandle::Native(serde_json::Value::Null))
        .build();
    req.set_runtime(Arc::new(ctx));
    req.set_wait_until(core.wait_until_sink());

    let forwarded = req
        .headers()
        .get_str("x-forwarded-for")
        .map(str::to_string);
    req.set_ip(resolve_client_ip(
        forwarded.as_deref(),
        Some(peer_addr),
        config.trust_proxy,
    ));
    req
}

#[cfg(test)]
mod tests {
    use super::*;
    use osrv_core::server::Server;
    use osrv_core::ServerOptions;
    use std::collections::HashMap;

    fn request_head(bytes: &[u8]) -> RequestHead {
        match parse_head(bytes, &ParseLimits::default()).unwrap() {
            HeadStatus::Complete { head, .. } => head,
            HeadStatus::Incomplete => panic!("incomplete"),
        }
    }

    fn test_core() -> Arc<ServerCore> {
        let server = Server::builder(|_req: &mut Request| {
            std::future::ready(Ok(Response::text("ok")))
        })
        .options(ServerOptions {
            trust_proxy: true,
            ..ServerOptions::default()
        })
        .env(HashMap::new())
        .build();
        Arc::clone(server.core())
    }

    #[test]
    fn h1_request_carries_runtime_metadata() {
        let core = test_core();
        let head = request_head(
            b"GET /path?x=1 HTTP/1.1\r\nHost: api.test:8080\r\nX-Forwarded-For: 203.0.113.7, 10.0.0.1\r\n\r\n",
        );
        let peer: SocketAddr = "198.51.100.2:40000".parse().unwrap();
        let local: SocketAddr = "127.0.0.1:3000".parse().unwrap();

        let req = build_h1_request(&core, head, Protocol::Http, peer, local, HttpVersion::Http11);

        assert_eq!(req.url().to_string(), "http://api.test:8080/path?x=1");
        assert_eq!(req.ip(), Some("203.0.113.7"), "trust_proxy uses forwarded");
        let rt = req.runtime();
        assert_eq!(rt.name(), "osrv");
        assert_eq!(rt.protocol(), Protocol::Http);
        assert!(!rt.tls());
        assert_eq!(rt.http_version(), HttpVersion::Http11);
        assert_eq!(rt.remote_address(), Some(peer));
        assert_eq!(rt.local_address(), Some(local));
        assert_eq!(rt.raw().provider(), "native");
        assert!(req.wait_until_sink().is_some());
    }

    #[test]
    fn unbound_transport_close_is_a_noop() {
        let mut transport = NativeTransport::new();
        assert!(transport.close(false).is_ok());
        assert!(transport.close(true).is_ok());
    }

    #[test]
    fn https_without_material_fails_bind() {
        let server = Server::builder(|_req: &mut Request| {
            std::future::ready(Ok(Response::text("ok")))
        })
        .options(ServerOptions {
            protocol: Some(Protocol::Https),
            ..ServerOptions::default()
        })
        .env(HashMap::new())
        .build();

        let mut transport = NativeTransport::new();
        let err = transport.bind(Arc::clone(server.core())).unwrap_err();
        assert!(matches!(err, TransportError::Tls(_)));
    }
}
