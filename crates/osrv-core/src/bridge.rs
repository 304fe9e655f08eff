//! Bridge transport: JSON-envelope dispatch for foreign hosts.
//!
//! A foreign host runtime (Node, Bun, Deno, an edge worker) that cannot hand
//! the core a native socket still gets the same dispatch pipeline: it sends a
//! JSON request envelope, the core deserializes it into a `Request` plus
//! `RuntimeContext`, runs `dispatch`, and returns a JSON response envelope.
//! Body bytes traverse the bridge base64-encoded.
//!
//! WebSocket upgrades are signaled by a 101 response carrying the
//! [`UPGRADE_HINT_HEADER`]; the host completes the upgrade out-of-band and
//! binds the socket id allocated for the request.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::task::Waker;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::config::WebSocketLimits;
use crate::encoding::{base64_decode, base64_encode};
use crate::error::{ServerError, TransportError};
use crate::request::{Body, Method, Request, Url};
use crate::response::{Response, ResponseBody};
use crate::runtime::{HttpVersion, Protocol, RawHandle, RuntimeContext, ServerCapabilities};
use crate::server::{BindInfo, ServerCore, Transport};

const LOG_TARGET: &str = "osrv::bridge";

/// Header that signals a WebSocket upgrade back to the host, with the value
/// `websocket`.
pub const UPGRADE_HINT_HEADER: &str = "x-osrv-upgrade";

/// Context key under which the allocated bridge socket id is stored.
pub const SOCKET_ID_CONTEXT_KEY: &str = "osrvSocketId";

/// Edge providers the bridge knows how to represent.
pub const EDGE_PROVIDERS: &[&str] = &["cloudflare", "vercel", "netlify"];

// ============================================================================
// Wire envelope
// ============================================================================

/// Request half of the bridge envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeRequest {
    /// Absolute request URL.
    pub url: String,
    /// Request method.
    pub method: String,
    /// Ordered header pairs.
    #[serde(default)]
    pub headers: Vec<(String, String)>,
    /// Base64-encoded body, or null.
    #[serde(rename = "bodyBase64")]
    pub body_base64: Option<String>,
}

/// Runtime half of the bridge envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeRuntime {
    /// Hosting provider tag (`node`, `cloudflare`, ...).
    pub provider: String,
    /// Runtime name as reported by the host.
    pub runtime: String,
    /// `http` or `https`.
    pub protocol: String,
    /// `1.0`, `1.1` or `2`.
    #[serde(rename = "httpVersion")]
    pub http_version: String,
    /// Whether the original request arrived over TLS.
    pub tls: bool,
    /// Client IP as resolved by the host.
    pub ip: Option<String>,
    /// Local address, when the host knows one.
    #[serde(rename = "localAddress")]
    pub local_address: Option<String>,
    /// Remote address, when the host knows one.
    #[serde(rename = "remoteAddress")]
    pub remote_address: Option<String>,
    /// Environment mapping from the host.
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Host-assigned request id.
    #[serde(rename = "requestId")]
    pub request_id: Option<String>,
}

/// The full request envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeEnvelope {
    /// Request data.
    pub request: BridgeRequest,
    /// Runtime metadata.
    pub runtime: BridgeRuntime,
    /// Initial per-request context bag.
    #[serde(default)]
    pub context: serde_json::Map<String, serde_json::Value>,
}

/// The response envelope.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BridgeResponse {
    /// Response status.
    pub status: u16,
    /// Ordered header pairs.
    pub headers: Vec<(String, String)>,
    /// Base64-encoded body, or null when empty.
    #[serde(rename = "bodyBase64")]
    pub body_base64: Option<String>,
}

fn raw_handle_for(provider: &str) -> RawHandle {
    let payload = serde_json::Value::Null;
    match provider {
        "node" => RawHandle::Node(payload),
        "bun" => RawHandle::Bun(payload),
        "deno" => RawHandle::Deno(payload),
        "cloudflare" => RawHandle::Cloudflare(payload),
        "vercel" => RawHandle::Vercel(payload),
        "netlify" => RawHandle::Netlify(payload),
        _ => RawHandle::Native(payload),
    }
}

/// Deserialize an envelope into a request plus runtime context.
///
/// # Errors
///
/// Fails with a protocol error when the envelope is structurally invalid
/// (bad URL, bad method, undecodable body).
pub fn request_from_envelope(envelope: BridgeEnvelope) -> Result<Request, ServerError> {
    let url = Url::parse(&envelope.request.url).ok_or_else(|| {
        ServerError::Transport(TransportError::Protocol(format!(
            "bridge envelope has invalid url: {}",
            envelope.request.url
        )))
    })?;
    let method = Method::parse(&envelope.request.method).ok_or_else(|| {
        ServerError::Transport(TransportError::Protocol(
            "bridge envelope has empty method".to_string(),
        ))
    })?;

    let mut req = Request::new(method, url);
    for (name, value) in envelope.request.headers {
        req.headers_mut().append(name, value.into_bytes());
    }
    if let Some(encoded) = envelope.request.body_base64 {
        let bytes = base64_decode(&encoded).ok_or_else(|| {
            ServerError::Transport(TransportError::Protocol(
                "bridge envelope body is not valid base64".to_string(),
            ))
        })?;
        req.set_body(Body::Bytes(bytes));
    }

    let runtime = envelope.runtime;
    let protocol = Protocol::parse(&runtime.protocol).unwrap_or_default();
    let ctx = RuntimeContext::builder(runtime.runtime.clone())
        .protocol(protocol)
        .tls(runtime.tls)
        .http_version(HttpVersion::parse(&runtime.http_version).unwrap_or_default())
        .local_address(runtime.local_address.as_deref().and_then(|a| a.parse().ok()))
        .remote_address(runtime.remote_address.as_deref().and_then(|a| a.parse().ok()))
        .env(runtime.env)
        .raw(raw_handle_for(&runtime.provider))
        .request_id(runtime.request_id)
        .build();
    req.set_runtime(Arc::new(ctx));
    req.set_ip(runtime.ip);
    *req.context_mut() = envelope.context.into_iter().collect();

    Ok(req)
}

/// Serialize a response into the bridge envelope, consuming its body.
pub async fn response_into_envelope(response: Response) -> BridgeResponse {
    let (status, headers, body) = response.into_parts();
    let body_bytes = match body {
        ResponseBody::Empty => Vec::new(),
        ResponseBody::Bytes(bytes) => bytes,
        ResponseBody::Stream(mut stream) => {
            use asupersync::stream::StreamExt;
            let mut out = Vec::new();
            while let Some(chunk) = stream.next().await {
                out.extend_from_slice(&chunk);
            }
            out
        }
    };
    BridgeResponse {
        status: status.as_u16(),
        headers: headers
            .into_iter()
            .map(|(n, v)| (n, String::from_utf8_lossy(&v).into_owned()))
            .collect(),
        body_base64: if body_bytes.is_empty() {
            None
        } else {
            Some(base64_encode(&body_bytes))
        },
    }
}

// ============================================================================
// Bridge transport
// ============================================================================

struct BridgeShared {
    core: Mutex<Option<Arc<ServerCore>>>,
    sockets: BridgeSocketRegistry,
}

/// The server-side half of the bridge: plugs into `Server` as its transport.
pub struct BridgeTransport {
    shared: Arc<BridgeShared>,
}

/// The host-side half of the bridge: what the foreign host calls.
#[derive(Clone)]
pub struct BridgeHandle {
    shared: Arc<BridgeShared>,
}

impl BridgeTransport {
    /// Create a connected transport/handle pair.
    #[must_use]
    pub fn new() -> (Self, BridgeHandle) {
        let shared = Arc::new(BridgeShared {
            core: Mutex::new(None),
            sockets: BridgeSocketRegistry::new(),
        });
        (
            Self {
                shared: Arc::clone(&shared),
            },
            BridgeHandle { shared },
        )
    }
}

impl Transport for BridgeTransport {
    fn name(&self) -> &'static str {
        "bridge"
    }

    fn bind(&mut self, core: Arc<ServerCore>) -> Result<BindInfo, TransportError> {
        *self.shared.core.lock() = Some(core);
        Ok(BindInfo {
            capabilities: ServerCapabilities {
                http1: true,
                https: false,
                http2: false,
                websocket: true,
                request_streaming: false,
                response_streaming: false,
                wait_until: true,
                edge: true,
                tls: false,
                edge_providers: EDGE_PROVIDERS.iter().map(|p| (*p).to_string()).collect(),
            },
            local_addr: None,
        })
    }

    fn close(&mut self, _force: bool) -> Result<(), TransportError> {
        *self.shared.core.lock() = None;
        self.shared.sockets.close_all();
        Ok(())
    }
}

impl BridgeHandle {
    /// The socket registry, for completing upgrades and relaying frames.
    #[must_use]
    pub fn sockets(&self) -> &BridgeSocketRegistry {
        &self.shared.sockets
    }

    /// Dispatch one parsed envelope.
    ///
    /// # Errors
    ///
    /// Fails when the bridge is not bound or the envelope is invalid;
    /// handler errors never surface here (dispatch converts them to
    /// responses).
    pub async fn handle(&self, envelope: BridgeEnvelope) -> Result<BridgeResponse, ServerError> {
        let core = self.shared.core.lock().clone().ok_or_else(|| {
            ServerError::Transport(TransportError::Unsupported(
                "bridge is not bound to a serving server".to_string(),
            ))
        })?;

        let mut req = request_from_envelope(envelope)?;
        req.set_wait_until(core.wait_until_sink());
        req.set_raw_web_socket(Box::new(BridgeUpgradeSlot {
            registry: self.shared.sockets.clone(),
            limits: core.config().websocket.clone(),
        }));

        let response = core.dispatch(&mut req).await;

        // Make the upgrade hint visible to the host even when the handler
        // built a bare 101.
        let response = if req.web_socket_upgraded()
            && response.header_value(UPGRADE_HINT_HEADER).is_none()
        {
            response.header(UPGRADE_HINT_HEADER, b"websocket".to_vec())
        } else {
            response
        };

        Ok(response_into_envelope(response).await)
    }

    /// Dispatch a JSON-encoded envelope, returning the JSON response.
    ///
    /// # Errors
    ///
    /// Fails on malformed JSON and on the conditions of [`Self::handle`].
    pub async fn handle_json(&self, json: &str) -> Result<String, ServerError> {
        let envelope: BridgeEnvelope = serde_json::from_str(json).map_err(|err| {
            ServerError::Transport(TransportError::Protocol(format!(
                "bridge envelope is not valid JSON: {err}"
            )))
        })?;
        let response = self.handle(envelope).await?;
        serde_json::to_string(&response).map_err(|err| {
            ServerError::Transport(TransportError::Protocol(format!(
                "bridge response serialization failed: {err}"
            )))
        })
    }
}

// ============================================================================
// Bridge WebSocket registry
// ============================================================================

/// A message delivered to or from a bridge WebSocket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeWsMessage {
    /// UTF-8 text.
    Text(String),
    /// Binary payload.
    Binary(Vec<u8>),
    /// Close with code and reason.
    Close(u16, String),
}

impl BridgeWsMessage {
    fn payload_len(&self) -> u64 {
        match self {
            Self::Text(s) => s.len() as u64,
            Self::Binary(b) => b.len() as u64,
            Self::Close(_, reason) => reason.len() as u64,
        }
    }
}

#[derive(Debug, Default)]
struct SocketState {
    /// Open handshake completed by the host.
    open: bool,
    /// Terminal close, once either side closed.
    closed: Option<(u16, String)>,
    /// Frames waiting for the host to collect.
    outbound: VecDeque<BridgeWsMessage>,
    /// Frames queued locally before the open handshake completes.
    pre_open: VecDeque<BridgeWsMessage>,
    pre_open_bytes: u64,
    /// Messages from the host waiting for the handler.
    inbound: VecDeque<BridgeWsMessage>,
    /// Handler tasks waiting on inbound data.
    wakers: Vec<Waker>,
}

/// Registry of bridge WebSockets, keyed by socket id.
#[derive(Clone, Debug)]
pub struct BridgeSocketRegistry {
    inner: Arc<Mutex<RegistryInner>>,
}

#[derive(Debug)]
struct RegistryInner {
    next_id: u64,
    sockets: HashMap<u64, SocketState>,
}

impl BridgeSocketRegistry {
    fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(RegistryInner {
                next_id: 1,
                sockets: HashMap::new(),
            })),
        }
    }

    fn allocate(&self) -> u64 {
        let mut inner = self.inner.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.sockets.insert(id, SocketState::default());
        id
    }

    /// Host: mark the open handshake complete; queued frames flush to the
    /// outbound queue in their original send order.
    pub fn open_socket(&self, id: u64) {
        let mut inner = self.inner.lock();
        if let Some(socket) = inner.sockets.get_mut(&id) {
            socket.open = true;
            let queued: Vec<_> = socket.pre_open.drain(..).collect();
            socket.pre_open_bytes = 0;
            socket.outbound.extend(queued);
        }
    }

    /// Host: collect frames waiting to go out to the peer.
    #[must_use]
    pub fn drain_outbound(&self, id: u64) -> Vec<BridgeWsMessage> {
        let mut inner = self.inner.lock();
        inner
            .sockets
            .get_mut(&id)
            .map(|s| s.outbound.drain(..).collect())
            .unwrap_or_default()
    }

    /// Host: deliver a peer message to the handler.
    pub fn push_inbound(&self, id: u64, message: BridgeWsMessage) {
        let mut inner = self.inner.lock();
        if let Some(socket) = inner.sockets.get_mut(&id) {
            if let BridgeWsMessage::Close(code, reason) = &message {
                socket.closed = Some((*code, reason.clone()));
            }
            socket.inbound.push_back(message);
            for waker in socket.wakers.drain(..) {
                waker.wake();
            }
        }
    }

    /// Whether the socket is open and not closed.
    #[must_use]
    pub fn is_open(&self, id: u64) -> bool {
        let inner = self.inner.lock();
        inner
            .sockets
            .get(&id)
            .map(|s| s.open && s.closed.is_none())
            .unwrap_or(false)
    }

    fn close_all(&self) {
        let mut inner = self.inner.lock();
        for socket in inner.sockets.values_mut() {
            if socket.closed.is_none() {
                socket.closed = Some((1001, "server closing".to_string()));
            }
            for waker in socket.wakers.drain(..) {
                waker.wake();
            }
        }
    }

    fn send(
        &self,
        id: u64,
        limits: &WebSocketLimits,
        message: BridgeWsMessage,
    ) -> Result<(), ServerError> {
        let mut inner = self.inner.lock();
        let socket = inner
            .sockets
            .get_mut(&id)
            .ok_or_else(|| ServerError::handler(format!("bridge socket {id} does not exist")))?;
        if socket.closed.is_some() {
            return Err(ServerError::handler(format!(
                "bridge socket {id} is closed"
            )));
        }
        let len = message.payload_len();
        if len > limits.max_frame_bytes && !matches!(message, BridgeWsMessage::Close(..)) {
            return Err(ServerError::handler(format!(
                "outbound frame of {len} bytes exceeds limit of {}",
                limits.max_frame_bytes
            )));
        }
        if socket.open {
            socket.outbound.push_back(message);
        } else {
            // Sends before open are buffered in call order, bounded.
            if socket.pre_open_bytes + len > limits.max_buffered_bytes {
                return Err(ServerError::handler(format!(
                    "pre-open buffer full: {} + {len} bytes exceeds limit of {}",
                    socket.pre_open_bytes, limits.max_buffered_bytes
                )));
            }
            socket.pre_open_bytes += len;
            socket.pre_open.push_back(message);
        }
        Ok(())
    }

    fn poll_receive(
        &self,
        id: u64,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<BridgeWsMessage>> {
        let mut inner = self.inner.lock();
        let Some(socket) = inner.sockets.get_mut(&id) else {
            return std::task::Poll::Ready(None);
        };
        if let Some(message) = socket.inbound.pop_front() {
            return std::task::Poll::Ready(Some(message));
        }
        if socket.closed.is_some() {
            return std::task::Poll::Ready(None);
        }
        if !socket.wakers.iter().any(|w| w.will_wake(cx.waker())) {
            socket.wakers.push(cx.waker().clone());
        }
        std::task::Poll::Pending
    }
}

/// Attachment the bridge puts on each request so upgrades can reach the
/// registry.
pub struct BridgeUpgradeSlot {
    registry: BridgeSocketRegistry,
    limits: WebSocketLimits,
}

/// A WebSocket handle proxied over the host bridge.
#[derive(Debug)]
pub struct BridgeWebSocket {
    id: u64,
    registry: BridgeSocketRegistry,
    limits: WebSocketLimits,
}

impl BridgeWebSocket {
    /// The socket id the host binds out-of-band.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Send a text message. Sends before open are buffered in call order.
    ///
    /// # Errors
    ///
    /// Fails locally when the frame exceeds `max_frame_bytes`, the pre-open
    /// buffer exceeds `max_buffered_bytes`, or the socket is closed.
    pub fn send_text(&self, text: impl Into<String>) -> Result<(), ServerError> {
        self.registry
            .send(self.id, &self.limits, BridgeWsMessage::Text(text.into()))
    }

    /// Send a binary message, with the same limits as [`Self::send_text`].
    ///
    /// # Errors
    ///
    /// Same conditions as [`Self::send_text`].
    pub fn send_bytes(&self, bytes: impl Into<Vec<u8>>) -> Result<(), ServerError> {
        self.registry
            .send(self.id, &self.limits, BridgeWsMessage::Binary(bytes.into()))
    }

    /// Close the socket.
    ///
    /// # Errors
    ///
    /// Fails when the socket is already closed.
    pub fn close(&self, code: Option<u16>, reason: Option<String>) -> Result<(), ServerError> {
        let code = code.unwrap_or(1000);
        let reason = reason.unwrap_or_default();
        self.registry.send(
            self.id,
            &self.limits,
            BridgeWsMessage::Close(code, reason.clone()),
        )?;
        self.registry.push_inbound(self.id, BridgeWsMessage::Close(code, reason));
        Ok(())
    }

    /// Whether the socket is open.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.registry.is_open(self.id)
    }

    /// Receive the next message; `None` once the socket is done.
    pub async fn receive(&self) -> Option<BridgeWsMessage> {
        std::future::poll_fn(|cx| self.registry.poll_receive(self.id, cx)).await
    }

    /// Wait for the terminal close.
    pub async fn done(&self) {
        while let Some(message) = self.receive().await {
            if matches!(message, BridgeWsMessage::Close(..)) {
                break;
            }
        }
    }
}

/// Upgrade a bridge request to a WebSocket.
///
/// Allocates a socket id, registers the pending upgrade, marks the request
/// upgraded and stores the id in the request context under
/// [`SOCKET_ID_CONTEXT_KEY`]. The handler should return a 101 response; the
/// host recognizes the upgrade hint header and binds the socket id.
///
/// # Errors
///
/// Fails when the request was already upgraded or did not come through the
/// bridge.
pub fn upgrade_web_socket(req: &mut Request) -> Result<BridgeWebSocket, ServerError> {
    if req.web_socket_upgraded() {
        return Err(ServerError::handler("request was already upgraded"));
    }
    let slot = req
        .take_raw_web_socket()
        .and_then(|raw| raw.downcast::<BridgeUpgradeSlot>().ok())
        .ok_or_else(|| ServerError::handler("request has no bridge upgrade slot"))?;

    let id = slot.registry.allocate();
    req.set_web_socket_upgraded(true);
    req.context_mut()
        .insert(SOCKET_ID_CONTEXT_KEY.to_string(), serde_json::json!(id));
    crate::logging::debug(LOG_TARGET, &format!("pending websocket upgrade, socket {id}"));

    Ok(BridgeWebSocket {
        id,
        registry: slot.registry,
        limits: slot.limits,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::response::StatusCode;
    use crate::server::Server;

    fn envelope(url: &str, method: &str, body: Option<&[u8]>) -> BridgeEnvelope {
        BridgeEnvelope {
            request: BridgeRequest {
                url: url.to_string(),
                method: method.to_string(),
                headers: vec![
                    ("X-First".to_string(), "1".to_string()),
                    ("set-cookie".to_string(), "a=1".to_string()),
                    ("set-cookie".to_string(), "b=2".to_string()),
                ],
                body_base64: body.map(base64_encode),
            },
            runtime: BridgeRuntime {
                provider: "cloudflare".to_string(),
                runtime: "workerd".to_string(),
                protocol: "https".to_string(),
                http_version: "2".to_string(),
                tls: true,
                ip: Some("203.0.113.9".to_string()),
                local_address: None,
                remote_address: Some("203.0.113.9:4123".to_string()),
                env: HashMap::new(),
                request_id: Some("req-1".to_string()),
            },
            context: serde_json::Map::new(),
        }
    }

    #[test]
    fn envelope_decodes_into_request() {
        let req = request_from_envelope(envelope(
            "https://example.com/items?id=3",
            "post",
            Some(b"payload"),
        ))
        .unwrap();

        assert_eq!(req.method(), &Method::Post);
        assert_eq!(req.url().path(), "/items");
        assert_eq!(req.url().query(), Some("id=3"));
        assert_eq!(req.ip(), Some("203.0.113.9"));
        assert_eq!(req.runtime().name(), "workerd");
        assert!(req.runtime().tls());
        assert_eq!(req.runtime().http_version(), HttpVersion::H2);
        assert_eq!(req.runtime().raw().provider(), "cloudflare");
        assert_eq!(
            req.headers().get_all("set-cookie"),
            vec![&b"a=1"[..], &b"b=2"[..]]
        );
    }

    #[test]
    fn envelope_rejects_bad_url_and_body() {
        let mut bad_url = envelope("not a url", "GET", None);
        bad_url.request.url = "nope".to_string();
        assert!(request_from_envelope(bad_url).is_err());

        let mut bad_body = envelope("http://x.test/", "GET", None);
        bad_body.request.body_base64 = Some("!!!".to_string());
        assert!(request_from_envelope(bad_body).is_err());
    }

    #[test]
    fn response_envelope_round_trips_headers_and_body() {
        let response = Response::ok()
            .header("set-cookie", b"a=1".to_vec())
            .header("content-type", b"text/plain".to_vec())
            .header("set-cookie", b"b=2".to_vec())
            .body(ResponseBody::Bytes(b"hello".to_vec()));

        let envelope = futures_executor::block_on(response_into_envelope(response));
        assert_eq!(envelope.status, 200);
        assert_eq!(
            envelope.headers,
            vec![
                ("set-cookie".to_string(), "a=1".to_string()),
                ("content-type".to_string(), "text/plain".to_string()),
                ("set-cookie".to_string(), "b=2".to_string()),
            ]
        );
        assert_eq!(
            base64_decode(envelope.body_base64.as_deref().unwrap()).unwrap(),
            b"hello"
        );

        // And the JSON wire form parses back to the same envelope.
        let json = serde_json::to_string(&envelope).unwrap();
        let parsed: BridgeResponse = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, envelope);
    }

    #[test]
    fn bridge_dispatches_through_server() {
        let (transport, handle) = BridgeTransport::new();
        let mut server = Server::builder(|req: &mut Request| {
            let body = req.take_body();
            async move {
                let bytes = body.into_bytes_async().await?;
                Ok(Response::text(format!(
                    "got {} bytes",
                    bytes.len()
                )))
            }
        })
        .transport(Box::new(transport))
        .env(HashMap::new())
        .build();

        futures_executor::block_on(async {
            server.serve().await.expect("serve");
            let response = handle
                .handle(envelope("http://example.com/", "POST", Some(b"12345")))
                .await
                .expect("bridge dispatch");
            assert_eq!(response.status, 200);
            let body = base64_decode(response.body_base64.as_deref().unwrap()).unwrap();
            assert_eq!(body, b"got 5 bytes");
            server.close(false).await.expect("close");
        });

        // After close, the bridge refuses dispatch.
        let err = futures_executor::block_on(
            handle.handle(envelope("http://example.com/", "GET", None)),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            ServerError::Transport(TransportError::Unsupported(_))
        ));
    }

    #[test]
    fn bridge_upgrade_signals_hint_header() {
        let (transport, handle) = BridgeTransport::new();
        let mut server = Server::builder(|req: &mut Request| {
            let ws = upgrade_web_socket(req);
            async move {
                let ws = ws?;
                ws.send_text("queued before open")?;
                Ok(Response::switching_protocols())
            }
        })
        .transport(Box::new(transport))
        .env(HashMap::new())
        .build();

        futures_executor::block_on(async {
            server.serve().await.expect("serve");
            let response = handle
                .handle(envelope("http://example.com/ws", "GET", None))
                .await
                .expect("bridge dispatch");
            assert_eq!(response.status, 101);
            assert!(response
                .headers
                .iter()
                .any(|(n, v)| n == UPGRADE_HINT_HEADER && v == "websocket"));

            // The pre-open send is buffered until the host opens the socket,
            // then flushes in order.
            let id = 1;
            assert!(handle.sockets().drain_outbound(id).is_empty());
            handle.sockets().open_socket(id);
            assert_eq!(
                handle.sockets().drain_outbound(id),
                vec![BridgeWsMessage::Text("queued before open".to_string())]
            );
            server.close(true).await.expect("close");
        });
    }

    #[test]
    fn bridge_socket_send_limits() {
        let registry = BridgeSocketRegistry::new();
        let id = registry.allocate();
        let limits = WebSocketLimits {
            max_frame_bytes: 4,
            max_buffered_bytes: 6,
            ..WebSocketLimits::default()
        };

        // Over-size frame fails locally.
        let err = registry
            .send(id, &limits, BridgeWsMessage::Binary(vec![0; 5]))
            .unwrap_err();
        assert!(err.to_string().contains("exceeds limit"));

        // Pre-open buffering is bounded.
        registry
            .send(id, &limits, BridgeWsMessage::Binary(vec![0; 4]))
            .unwrap();
        let err = registry
            .send(id, &limits, BridgeWsMessage::Binary(vec![0; 3]))
            .unwrap_err();
        assert!(err.to_string().contains("pre-open buffer full"));
    }

    #[test]
    fn bridge_socket_receive_sees_host_messages() {
        let registry = BridgeSocketRegistry::new();
        let id = registry.allocate();
        registry.open_socket(id);
        let ws = BridgeWebSocket {
            id,
            registry: registry.clone(),
            limits: WebSocketLimits::default(),
        };

        registry.push_inbound(id, BridgeWsMessage::Text("hi".to_string()));
        registry.push_inbound(id, BridgeWsMessage::Close(1000, String::new()));

        futures_executor::block_on(async {
            assert_eq!(
                ws.receive().await,
                Some(BridgeWsMessage::Text("hi".to_string()))
            );
            assert_eq!(
                ws.receive().await,
                Some(BridgeWsMessage::Close(1000, String::new()))
            );
            assert_eq!(ws.receive().await, None);
        });
        assert!(!ws.is_open());
    }

    #[test]
    fn upgrade_fails_without_slot_or_twice() {
        let mut req = Request::new(
            Method::Get,
            Url::parse("http://example.com/ws").unwrap(),
        );
        assert!(upgrade_web_socket(&mut req).is_err());

        req.set_raw_web_socket(Box::new(BridgeUpgradeSlot {
            registry: BridgeSocketRegistry::new(),
            limits: WebSocketLimits::default(),
        }));
        let _ws = upgrade_web_socket(&mut req).expect("first upgrade");
        assert!(req.web_socket_upgraded());
        let err = upgrade_web_socket(&mut req).unwrap_err();
        assert!(err.to_string().contains("already upgraded"));
    }

    #[test]
    fn dispatch_status_test_helper() {
        // Guard that 101 from StatusCode helper matches the envelope status.
        assert_eq!(StatusCode::SWITCHING_PROTOCOLS.as_u16(), 101);
    }
}
