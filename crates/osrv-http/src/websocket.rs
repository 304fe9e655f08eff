//! WebSocket protocol support (RFC 6455), server side.
//!
//! Scope: unfragmented text (0x1) and binary (0x2) data frames plus the
//! control frames close (0x8), ping (0x9) and pong (0xA). Fragmented
//! messages close the socket with 1003, unmasked client frames with 1002,
//! and frames over the configured size limit with 1009 "Frame too large".

use std::io;
use std::time::Instant;

use parking_lot::Mutex;

use osrv_core::config::WebSocketLimits;
use osrv_core::encoding::{base64_decode, base64_encode, sha1};
use osrv_core::{Request, ServerError};

use crate::io::{read_exact_buffered, write_all, RawDuplex};

const LOG_TARGET: &str = "osrv::websocket";

/// The WebSocket GUID used in the handshake (RFC 6455 §4.2.2).
const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Largest payload length the protocol can express for us: 2^53 - 1.
const MAX_PROTOCOL_PAYLOAD: u64 = (1 << 53) - 1;

/// Frame opcode (RFC 6455 §5.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    /// Continuation frame (0x0) — always rejected here.
    Continuation,
    /// Text frame (0x1).
    Text,
    /// Binary frame (0x2).
    Binary,
    /// Connection close (0x8).
    Close,
    /// Ping (0x9).
    Ping,
    /// Pong (0xA).
    Pong,
}

impl Opcode {
    fn from_u8(value: u8) -> Result<Self, WebSocketError> {
        match value & 0x0F {
            0x0 => Ok(Self::Continuation),
            0x1 => Ok(Self::Text),
            0x2 => Ok(Self::Binary),
            0x8 => Ok(Self::Close),
            0x9 => Ok(Self::Ping),
            0xA => Ok(Self::Pong),
            other => Err(WebSocketError::Protocol(format!(
                "unknown opcode: 0x{other:X}"
            ))),
        }
    }

    fn to_u8(self) -> u8 {
        match self {
            Self::Continuation => 0x0,
            Self::Text => 0x1,
            Self::Binary => 0x2,
            Self::Close => 0x8,
            Self::Ping => 0x9,
            Self::Pong => 0xA,
        }
    }
}

/// A message from the peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// UTF-8 text.
    Text(String),
    /// Binary payload.
    Binary(Vec<u8>),
}

/// WebSocket failure.
#[derive(Debug)]
pub enum WebSocketError {
    /// I/O failure on the underlying stream.
    Io(io::Error),
    /// Protocol violation (the socket was closed with the matching code).
    Protocol(String),
    /// Peer frame or outgoing frame over the size limit.
    FrameTooLarge {
        /// Offending size.
        size: u64,
        /// Configured limit.
        limit: u64,
    },
    /// Invalid UTF-8 in a text frame.
    InvalidUtf8,
    /// Handshake validation failed.
    HandshakeFailed(String),
    /// Operation on a closed socket.
    Closed,
}

impl std::fmt::Display for WebSocketError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "websocket I/O error: {e}"),
            Self::Protocol(msg) => write!(f, "websocket protocol error: {msg}"),
            Self::FrameTooLarge { size, limit } => {
                write!(f, "frame of {size} bytes exceeds limit of {limit}")
            }
            Self::InvalidUtf8 => write!(f, "invalid UTF-8 in text frame"),
            Self::HandshakeFailed(msg) => write!(f, "websocket handshake failed: {msg}"),
            Self::Closed => write!(f, "websocket is closed"),
        }
    }
}

impl std::error::Error for WebSocketError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for WebSocketError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<WebSocketError> for ServerError {
    fn from(e: WebSocketError) -> Self {
        ServerError::Handler(Box::new(e))
    }
}

// ============================================================================
// Handshake
// ============================================================================

/// Compute the `Sec-WebSocket-Accept` value (RFC 6455 §4.2.2 step 4).
#[must_use]
pub fn accept_key(client_key: &str) -> String {
    let mut input = String::with_capacity(client_key.len() + WS_GUID.len());
    input.push_str(client_key.trim());
    input.push_str(WS_GUID);
    base64_encode(&sha1(input.as_bytes()))
}

/// Validate an upgrade request and return the client key.
///
/// # Errors
///
/// Fails when the request is not a well-formed RFC 6455 §4.2.1 upgrade.
pub fn validate_upgrade_request(req: &Request) -> Result<String, WebSocketError> {
    if req.method().as_str() != "GET" {
        return Err(WebSocketError::HandshakeFailed(
            "upgrade requires the GET method".to_string(),
        ));
    }

    let contains_token = |value: Option<&str>, token: &str| {
        value
            .map(|v| v.split(',').any(|t| t.trim().eq_ignore_ascii_case(token)))
            .unwrap_or(false)
    };

    if !contains_token(req.headers().get_str("upgrade"), "websocket") {
        return Err(WebSocketError::HandshakeFailed(
            "Upgrade header must contain 'websocket'".to_string(),
        ));
    }
    if !contains_token(req.headers().get_str("connection"), "upgrade") {
        return Err(WebSocketError::HandshakeFailed(
            "Connection header must contain 'upgrade'".to_string(),
        ));
    }

    let key = req
        .headers()
        .get_str("sec-websocket-key")
        .map(str::trim)
        .filter(|k| !k.is_empty())
        .ok_or_else(|| {
            WebSocketError::HandshakeFailed("missing Sec-WebSocket-Key header".to_string())
        })?;
    match base64_decode(key) {
        Some(decoded) if decoded.len() == 16 => {}
        _ => {
            return Err(WebSocketError::HandshakeFailed(
                "Sec-WebSocket-Key must be base64 with 16 decoded bytes".to_string(),
            ));
        }
    }

    match req.headers().get_str("sec-websocket-version").map(str::trim) {
        Some("13") => {}
        other => {
            return Err(WebSocketError::HandshakeFailed(format!(
                "unsupported WebSocket version {other:?} (expected 13)"
            )));
        }
    }

    Ok(key.to_string())
}

/// The 101 Switching Protocols handshake bytes for an accepted upgrade.
#[must_use]
pub fn handshake_response(client_key: &str) -> Vec<u8> {
    format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         upgrade: websocket\r\n\
         connection: Upgrade\r\n\
         sec-websocket-accept: {}\r\n\r\n",
        accept_key(client_key)
    )
    .into_bytes()
}

// ============================================================================
// Frame codec
// ============================================================================

#[derive(Debug)]
struct RawFrame {
    fin: bool,
    opcode: Opcode,
    payload: Vec<u8>,
}

async fn read_frame<S: RawDuplex + ?Sized>(
    stream: &mut S,
    buffer: &mut Vec<u8>,
    max_frame_bytes: u64,
) -> Result<RawFrame, WebSocketError> {
    let header = read_exact_buffered(stream, buffer, 2).await?;
    let fin = header[0] & 0x80 != 0;
    if header[0] & 0x70 != 0 {
        return Err(WebSocketError::Protocol(
            "reserved bits set without negotiated extension".to_string(),
        ));
    }
    let opcode = Opcode::from_u8(header[0])?;
    let masked = header[1] & 0x80 != 0;
    let len7 = u64::from(header[1] & 0x7F);

    let payload_len = match len7 {
        126 => {
            let ext = read_exact_buffered(stream, buffer, 2).await?;
            u64::from(u16::from_be_bytes([ext[0], ext[1]]))
        }
        127 => {
            let ext = read_exact_buffered(stream, buffer, 8).await?;
            u64::from_be_bytes([
                ext[0], ext[1], ext[2], ext[3], ext[4], ext[5], ext[6], ext[7],
            ])
        }
        n => n,
    };

    if payload_len > MAX_PROTOCOL_PAYLOAD {
        return Err(WebSocketError::FrameTooLarge {
            size: payload_len,
            limit: MAX_PROTOCOL_PAYLOAD,
        });
    }
    if payload_len > max_frame_bytes {
        return Err(WebSocketError::FrameTooLarge {
            size: payload_len,
            limit: max_frame_bytes,
        });
    }

    if !masked {
        // Clients must mask every frame (RFC 6455 §5.1).
        return Err(WebSocketError::Protocol("unmasked client frame".to_string()));
    }
    let mask = read_exact_buffered(stream, buffer, 4).await?;

    let len = usize::try_from(payload_len)
        .map_err(|_| WebSocketError::Protocol("payload exceeds addressable memory".to_string()))?;
    let mut payload = read_exact_buffered(stream, buffer, len).await?;
    for (i, byte) in payload.iter_mut().enumerate() {
        *byte ^= mask[i % 4];
    }

    Ok(RawFrame {
        fin,
        opcode,
        payload,
    })
}

fn encode_frame(opcode: Opcode, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 10);
    out.push(0x80 | opcode.to_u8());
    let len = payload.len();
    if len < 126 {
        out.push(len as u8);
    } else if len <= u16::MAX as usize {
        out.push(126);
        out.extend_from_slice(&(len as u16).to_be_bytes());
    } else {
        out.push(127);
        out.extend_from_slice(&(len as u64).to_be_bytes());
    }
    out.extend_from_slice(payload);
    out
}

fn encode_close(code: u16, reason: &str) -> Vec<u8> {
    let mut payload = Vec::with_capacity(2 + reason.len());
    payload.extend_from_slice(&code.to_be_bytes());
    payload.extend_from_slice(reason.as_bytes());
    encode_frame(Opcode::Close, &payload)
}

// ============================================================================
// Upgrade entry point
// ============================================================================

/// Attachment the native transport places on upgrade-shaped requests: the
/// parked connection stream plus the server's WebSocket limits.
pub struct NativeUpgradeSlot {
    stream: Mutex<Option<Box<dyn RawDuplex>>>,
    limits: WebSocketLimits,
}

impl NativeUpgradeSlot {
    /// Park a stream for a potential upgrade.
    #[must_use]
    pub fn new(stream: Box<dyn RawDuplex>, limits: WebSocketLimits) -> Self {
        Self {
            stream: Mutex::new(Some(stream)),
            limits,
        }
    }

    /// Reclaim the stream when the handler did not upgrade.
    #[must_use]
    pub fn reclaim(&self) -> Option<Box<dyn RawDuplex>> {
        self.stream.lock().take()
    }
}

/// Upgrade a native request to a WebSocket.
///
/// Validates the RFC 6455 handshake, writes the 101 response on the parked
/// connection, marks the request upgraded, and returns the live socket. The
/// handler should still return a 101 response; the transport discards it for
/// upgraded requests.
///
/// # Errors
///
/// Fails if the request was already upgraded, did not arrive on the native
/// transport with upgrade headers, or fails handshake validation.
pub async fn upgrade_web_socket(
    req: &mut Request,
    limits: Option<WebSocketLimits>,
) -> Result<WebSocket, ServerError> {
    if req.web_socket_upgraded() {
        return Err(ServerError::handler("request was already upgraded"));
    }
    let slot = req
        .take_raw_web_socket()
        .and_then(|raw| raw.downcast::<NativeUpgradeSlot>().ok())
        .ok_or_else(|| {
            ServerError::handler("request has no parked connection to upgrade")
        })?;

    let key = validate_upgrade_request(req).map_err(|e| {
        // Put the slot back so the transport can still answer over HTTP.
        let failed = e.to_string();
        if let Some(stream) = slot.reclaim() {
            req.set_raw_web_socket(Box::new(NativeUpgradeSlot::new(stream, slot.limits.clone())));
        }
        ServerError::handler(failed)
    })?;

    let mut stream = slot
        .reclaim()
        .ok_or_else(|| ServerError::handler("connection already taken"))?;
    write_all(&mut *stream, &handshake_response(&key))
        .await
        .map_err(|e| ServerError::Handler(Box::new(WebSocketError::Io(e))))?;

    req.set_web_socket_upgraded(true);
    osrv_core::logging::debug(LOG_TARGET, "websocket upgrade complete");
    Ok(WebSocket::new(stream, limits.unwrap_or(slot.limits.clone())))
}

// ============================================================================
// Live socket
// ============================================================================

/// A live server-side WebSocket.
pub struct WebSocket {
    stream: Box<dyn RawDuplex>,
    buffer: Vec<u8>,
    limits: WebSocketLimits,
    open: bool,
    last_ping: Instant,
}

impl WebSocket {
    fn new(stream: Box<dyn RawDuplex>, limits: WebSocketLimits) -> Self {
        Self {
            stream,
            buffer: Vec::new(),
            limits,
            open: true,
            last_ping: Instant::now(),
        }
    }

    /// Whether the socket is open.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.open
    }

    /// The ping cadence for this socket: `max(1s, idle_timeout / 2)`.
    #[must_use]
    pub fn ping_interval(&self) -> std::time::Duration {
        self.limits.ping_interval()
    }

    /// Send a ping if the cadence says one is due. Called on every send and
    /// receive; a fully idle peer is pinged as soon as traffic resumes.
    async fn maybe_ping(&mut self) -> Result<(), WebSocketError> {
        if self.open && self.last_ping.elapsed() >= self.ping_interval() {
            self.last_ping = Instant::now();
            write_all(&mut *self.stream, &encode_frame(Opcode::Ping, b"")).await?;
        }
        Ok(())
    }

    fn check_outbound_size(&self, len: usize) -> Result<(), WebSocketError> {
        if len as u64 > self.limits.max_frame_bytes {
            return Err(WebSocketError::FrameTooLarge {
                size: len as u64,
                limit: self.limits.max_frame_bytes,
            });
        }
        Ok(())
    }

    /// Send a text message.
    ///
    /// # Errors
    ///
    /// Fails locally (without closing the socket) when the frame exceeds
    /// `max_frame_bytes`; fails with `Closed` after close.
    pub async fn send_text(&mut self, text: &str) -> Result<(), WebSocketError> {
        if !self.open {
            return Err(WebSocketError::Closed);
        }
        self.check_outbound_size(text.len())?;
        self.maybe_ping().await?;
        write_all(&mut *self.stream, &encode_frame(Opcode::Text, text.as_bytes())).await?;
        Ok(())
    }

    /// Send a binary message, with the same failure modes as
    /// [`Self::send_text`].
    ///
    /// # Errors
    ///
    /// See [`Self::send_text`].
    pub async fn send_bytes(&mut self, bytes: &[u8]) -> Result<(), WebSocketError> {
        if !self.open {
            return Err(WebSocketError::Closed);
        }
        self.check_outbound_size(bytes.len())?;
        self.maybe_ping().await?;
        write_all(&mut *self.stream, &encode_frame(Opcode::Binary, bytes)).await?;
        Ok(())
    }

    /// Close the socket with a code and reason.
    ///
    /// # Errors
    ///
    /// Propagates I/O failures writing the close frame; the socket is marked
    /// closed regardless.
    pub async fn close(&mut self, code: Option<u16>, reason: Option<&str>) -> Result<(), WebSocketError> {
        if !self.open {
            return Ok(());
        }
        self.open = false;
        write_all(
            &mut *self.stream,
            &encode_close(code.unwrap_or(1000), reason.unwrap_or_default()),
        )
        .await?;
        Ok(())
    }

    async fn close_with(&mut self, code: u16, reason: &str) {
        if self.open {
            self.open = false;
            let _ = write_all(&mut *self.stream, &encode_close(code, reason)).await;
        }
    }

    /// Receive the next data message.
    ///
    /// The lazy message sequence: call in a loop until `Ok(None)` (peer
    /// closed) or `Err` (violation; the socket is closed with the matching
    /// code before the error returns). Control frames are handled
    /// internally: pings are answered, pongs ignored.
    ///
    /// # Errors
    ///
    /// Protocol violations (fragmentation → 1003, unmasked frames → 1002,
    /// over-limit frames → 1009, bad UTF-8 → 1007) and I/O failures.
    pub async fn receive(&mut self) -> Result<Option<Message>, WebSocketError> {
        loop {
            if !self.open {
                return Ok(None);
            }
            self.maybe_ping().await?;

            let frame = match read_frame(
                &mut *self.stream,
                &mut self.buffer,
                self.limits.max_frame_bytes,
            )
            .await
            {
                Ok(frame) => frame,
                Err(WebSocketError::FrameTooLarge { size, limit }) => {
                    self.close_with(1009, "Frame too large").await;
                    return Err(WebSocketError::FrameTooLarge { size, limit });
                }
                Err(WebSocketError::Protocol(msg)) if msg.contains("unmasked") => {
                    self.close_with(1002, "client frames must be masked").await;
                    return Err(WebSocketError::Protocol(msg));
                }
                Err(other) => {
                    self.open = false;
                    return Err(other);
                }
            };

            if !frame.fin || frame.opcode == Opcode::Continuation {
                self.close_with(1003, "fragmented frames not supported").await;
                return Err(WebSocketError::Protocol(
                    "fragmented frames not supported".to_string(),
                ));
            }

            match frame.opcode {
                Opcode::Text => match String::from_utf8(frame.payload) {
                    Ok(text) => return Ok(Some(Message::Text(text))),
                    Err(_) => {
                        self.close_with(1007, "invalid UTF-8 in text frame").await;
                        return Err(WebSocketError::InvalidUtf8);
                    }
                },
                Opcode::Binary => return Ok(Some(Message::Binary(frame.payload))),
                Opcode::Ping => {
                    write_all(&mut *self.stream, &encode_frame(Opcode::Pong, &frame.payload))
                        .await?;
                }
                Opcode::Pong => {}
                Opcode::Close => {
                    let code = if frame.payload.len() >= 2 {
                        u16::from_be_bytes([frame.payload[0], frame.payload[1]])
                    } else {
                        1000
                    };
                    // Echo the close and finish.
                    if self.open {
                        self.open = false;
                        let _ = write_all(&mut *self.stream, &encode_close(code, "")).await;
                    }
                    return Ok(None);
                }
                Opcode::Continuation => unreachable!("rejected above"),
            }
        }
    }

    /// Drain messages until the peer closes; the terminal signal.
    pub async fn done(&mut self) {
        while let Ok(Some(_)) = self.receive().await {}
    }
}
