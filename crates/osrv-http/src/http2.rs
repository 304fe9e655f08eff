//! HTTP/2 framing (RFC 7540) and HPACK (RFC 7541).
//!
//! Enough of HTTP/2 to serve requests after an ALPN `h2` negotiation:
//! connection preface, SETTINGS exchange, HEADERS/CONTINUATION with a full
//! HPACK decoder (including Huffman), DATA accumulation into a bounded
//! buffer, and response writing with a minimal HPACK encoder. Streams are
//! answered as they complete.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::{Arc, OnceLock};

use osrv_core::request::{Body, BodyError, Request};
use osrv_core::response::ResponseBody;
use osrv_core::runtime::{HttpVersion, Protocol, RawHandle, RuntimeContext};
use osrv_core::server::ServerCore;
use osrv_core::{Method, Url};

use crate::connection::is_hop_by_hop;
use crate::io::{read_once, write_all, RawDuplex};

const LOG_TARGET: &str = "osrv::http2";

/// HTTP/2 connection preface.
pub const PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

/// Maximum frame payload we advertise and accept.
const MAX_FRAME_SIZE: u32 = 16 * 1024;

/// HTTP/2 frame type (RFC 7540 §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    /// DATA (0x0)
    Data = 0x0,
    /// HEADERS (0x1)
    Headers = 0x1,
    /// PRIORITY (0x2)
    Priority = 0x2,
    /// RST_STREAM (0x3)
    RstStream = 0x3,
    /// SETTINGS (0x4)
    Settings = 0x4,
    /// PUSH_PROMISE (0x5)
    PushPromise = 0x5,
    /// PING (0x6)
    Ping = 0x6,
    /// GOAWAY (0x7)
    Goaway = 0x7,
    /// WINDOW_UPDATE (0x8)
    WindowUpdate = 0x8,
    /// CONTINUATION (0x9)
    Continuation = 0x9,
    /// Anything else.
    Unknown = 0xFF,
}

impl FrameType {
    /// Map a wire byte to a frame type.
    #[must_use]
    pub fn from_u8(v: u8) -> Self {
        match v {
            0x0 => Self::Data,
            0x1 => Self::Headers,
            0x2 => Self::Priority,
            0x3 => Self::RstStream,
            0x4 => Self::Settings,
            0x5 => Self::PushPromise,
            0x6 => Self::Ping,
            0x7 => Self::Goaway,
            0x8 => Self::WindowUpdate,
            0x9 => Self::Continuation,
            _ => Self::Unknown,
        }
    }
}

const FLAG_END_STREAM: u8 = 0x1;
const FLAG_END_HEADERS: u8 = 0x4;
const FLAG_PADDED: u8 = 0x8;
const FLAG_PRIORITY: u8 = 0x20;
const FLAG_ACK: u8 = 0x1;

/// A parsed frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// 24-bit payload length.
    pub length: u32,
    /// Raw frame type byte.
    pub frame_type: u8,
    /// Frame flags.
    pub flags: u8,
    /// 31-bit stream id.
    pub stream_id: u32,
}

impl FrameHeader {
    /// Encoded header length.
    pub const LEN: usize = 9;

    /// Typed frame type.
    #[must_use]
    pub fn frame_type(&self) -> FrameType {
        FrameType::from_u8(self.frame_type)
    }
}

/// A full frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Header.
    pub header: FrameHeader,
    /// Payload bytes.
    pub payload: Vec<u8>,
}

/// HTTP/2 failure.
#[derive(Debug)]
pub enum Http2Error {
    /// Stream I/O failed.
    Io(io::Error),
    /// Protocol violation.
    Protocol(&'static str),
    /// Header decompression failed.
    Hpack(HpackError),
}

impl std::fmt::Display for Http2Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "http2 I/O error: {e}"),
            Self::Protocol(m) => write!(f, "http2 protocol error: {m}"),
            Self::Hpack(e) => write!(f, "hpack error: {e}"),
        }
    }
}

impl std::error::Error for Http2Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Hpack(e) => Some(e),
            Self::Protocol(_) => None,
        }
    }
}

impl From<io::Error> for Http2Error {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<HpackError> for Http2Error {
    fn from(e: HpackError) -> Self {
        Self::Hpack(e)
    }
}

/// Framed HTTP/2 I/O over any duplex.
pub struct FramedH2<S> {
    stream: S,
    rx: Vec<u8>,
}

impl<S: RawDuplex> FramedH2<S> {
    /// Wrap a stream, carrying over any bytes already read past the
    /// negotiation point.
    #[must_use]
    pub fn new(stream: S, buffered: Vec<u8>) -> Self {
        Self {
            stream,
            rx: buffered,
        }
    }

    /// Read and verify the client connection preface.
    ///
    /// # Errors
    ///
    /// Fails when the preface bytes do not match.
    pub async fn read_preface(&mut self) -> Result<(), Http2Error> {
        let bytes = self.read_exact(PREFACE.len()).await?;
        if bytes != PREFACE {
            return Err(Http2Error::Protocol("invalid connection preface"));
        }
        Ok(())
    }

    /// Read the next frame.
    ///
    /// # Errors
    ///
    /// Fails on I/O errors or frames over the advertised size.
    pub async fn read_frame(&mut self) -> Result<Frame, Http2Error> {
        let header_bytes = self.read_exact(FrameHeader::LEN).await?;
        let length = (u32::from(header_bytes[0]) << 16)
            | (u32::from(header_bytes[1]) << 8)
            | u32::from(header_bytes[2]);
        let frame_type = header_bytes[3];
        let flags = header_bytes[4];
        let stream_id = u32::from_be_bytes([
            header_bytes[5],
            header_bytes[6],
            header_bytes[7],
            header_bytes[8],
        ]) & 0x7FFF_FFFF;

        if length > MAX_FRAME_SIZE {
            return Err(Http2Error::Protocol("frame length exceeds max frame size"));
        }

        let payload = self.read_exact(length as usize).await?;
        Ok(Frame {
            header: FrameHeader {
                length,
                frame_type,
                flags,
                stream_id,
            },
            payload,
        })
    }

    /// Write one frame.
    ///
    /// # Errors
    ///
    /// Fails on I/O errors or payloads beyond the 24-bit length.
    pub async fn write_frame(
        &mut self,
        frame_type: FrameType,
        flags: u8,
        stream_id: u32,
        payload: &[u8],
    ) -> Result<(), Http2Error> {
        let len = u32::try_from(payload.len())
            .map_err(|_| Http2Error::Protocol("payload length too large"))?;
        if len > 0x00FF_FFFF {
            return Err(Http2Error::Protocol("payload length exceeds 24-bit limit"));
        }

        let mut out = Vec::with_capacity(FrameHeader::LEN + payload.len());
        out.push(((len >> 16) & 0xff) as u8);
        out.push(((len >> 8) & 0xff) as u8);
        out.push((len & 0xff) as u8);
        out.push(frame_type as u8);
        out.push(flags);
        out.extend_from_slice(&(stream_id & 0x7FFF_FFFF).to_be_bytes());
        out.extend_from_slice(payload);

        write_all(&mut self.stream, &out).await?;
        crate::io::flush(&mut self.stream).await?;
        Ok(())
    }

    async fn read_exact(&mut self, n: usize) -> io::Result<Vec<u8>> {
        while self.rx.len() < n {
            let mut tmp = [0u8; 8192];
            let read = read_once(&mut self.stream, &mut tmp).await?;
            if read == 0 {
                return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "EOF"));
            }
            self.rx.extend_from_slice(&tmp[..read]);
        }
        Ok(self.rx.drain(..n).collect())
    }
}

// ============================================================================
// Server-side connection driver
// ============================================================================

/// Per-connection metadata the transport resolved at accept time.
#[derive(Debug, Clone)]
pub struct H2ConnMeta {
    /// Local socket address.
    pub local_addr: Option<std::net::SocketAddr>,
    /// Peer socket address.
    pub remote_addr: Option<std::net::SocketAddr>,
    /// Advertised hostname for URL fallback.
    pub fallback_host: String,
    /// Bound port for URL fallback.
    pub fallback_port: u16,
}

#[derive(Default)]
struct H2StreamState {
    header_block: Vec<u8>,
    headers_done: bool,
    headers: Vec<(Vec<u8>, Vec<u8>)>,
    body: Vec<u8>,
    body_over_limit: Option<(u64, u64)>,
    end_stream: bool,
}

/// Serve one HTTP/2 connection until GOAWAY, EOF or shutdown.
///
/// # Errors
///
/// Propagates protocol violations and I/O failures; a clean peer EOF after
/// at least the preface is not an error.
pub async fn serve_connection<S: RawDuplex>(
    stream: S,
    buffered: Vec<u8>,
    core: Arc<ServerCore>,
    meta: H2ConnMeta,
    shutdown: osrv_core::ShutdownSignal,
) -> Result<(), Http2Error> {
    let mut framed = FramedH2::new(stream, buffered);
    framed.read_preface().await?;

    // Our SETTINGS: defaults, explicit max frame size.
    let mut settings = Vec::new();
    settings.extend_from_slice(&0x5u16.to_be_bytes()); // SETTINGS_MAX_FRAME_SIZE
    settings.extend_from_slice(&MAX_FRAME_SIZE.to_be_bytes());
    framed
        .write_frame(FrameType::Settings, 0, 0, &settings)
        .await?;

    let mut decoder = HpackDecoder::new();
    let mut streams: HashMap<u32, H2StreamState> = HashMap::new();
    let mut continuation_stream: Option<u32> = None;
    let max_body = core.config().limits.max_request_body_bytes;

    loop {
        if shutdown.is_shutting_down() {
            let mut goaway = Vec::with_capacity(8);
            goaway.extend_from_slice(&0u32.to_be_bytes());
            goaway.extend_from_slice(&0u32.to_be_bytes()); // NO_ERROR
            let _ = framed.write_frame(FrameType::Goaway, 0, 0, &goaway).await;
            return Ok(());
        }

        let frame = match framed.read_frame().await {
            Ok(frame) => frame,
            Err(Http2Error::Io(e)) if e.kind() == io::ErrorKind::UnexpectedEof => {
                return Ok(());
            }
            Err(other) => return Err(other),
        };

        if let Some(expected) = continuation_stream {
            if frame.header.frame_type() != FrameType::Continuation
                || frame.header.stream_id != expected
            {
                return Err(Http2Error::Protocol(
                    "expected CONTINUATION for the open header block",
                ));
            }
        }

        match frame.header.frame_type() {
            FrameType::Settings => {
                if frame.header.flags & FLAG_ACK == 0 {
                    framed
                        .write_frame(FrameType::Settings, FLAG_ACK, 0, &[])
                        .await?;
                }
            }
            FrameType::Ping => {
                if frame.header.flags & FLAG_ACK == 0 {
                    framed
                        .write_frame(FrameType::Ping, FLAG_ACK, 0, &frame.payload)
                        .await?;
                }
            }
            FrameType::Goaway => return Ok(()),
            FrameType::WindowUpdate | FrameType::Priority => {}
            FrameType::RstStream => {
                streams.remove(&frame.header.stream_id);
            }
            FrameType::PushPromise => {
                return Err(Http2Error::Protocol("client sent PUSH_PROMISE"));
            }
            FrameType::Headers => {
                let stream_id = frame.header.stream_id;
                if stream_id == 0 {
                    return Err(Http2Error::Protocol("HEADERS on stream zero"));
                }
                let block = strip_headers_payload(&frame)?;
                let state = streams.entry(stream_id).or_default();
                state.header_block.extend_from_slice(block);
                state.end_stream = frame.header.flags & FLAG_END_STREAM != 0;
                if frame.header.flags & FLAG_END_HEADERS != 0 {
                    state.headers = decoder.decode(&state.header_block)?;
                    state.headers_done = true;
                    state.header_block.clear();
                } else {
                    continuation_stream = Some(stream_id);
                }
            }
            FrameType::Continuation => {
                let stream_id = frame.header.stream_id;
                let state = streams
                    .entry(stream_id)
                    .or_default();
                state.header_block.extend_from_slice(&frame.payload);
                if frame.header.flags & FLAG_END_HEADERS != 0 {
                    state.headers = decoder.decode(&state.header_block)?;
                    state.headers_done = true;
                    state.header_block.clear();
                    continuation_stream = None;
                }
            }
            FrameType::Data => {
                let stream_id = frame.header.stream_id;
                if stream_id == 0 {
                    return Err(Http2Error::Protocol("DATA on stream zero"));
                }
                let data = strip_data_padding(&frame)?;
                let state = streams.entry(stream_id).or_default();
                let new_total = state.body.len() as u64 + data.len() as u64;
                match state.body_over_limit {
                    Some(_) => {}
                    None if new_total > max_body => {
                        // Over-limit bodies stop accumulating but the stream
                        // keeps draining so the 413 can still be written.
                        state.body_over_limit = Some((max_body, new_total));
                        state.body.clear();
                    }
                    None => state.body.extend_from_slice(data),
                }
                state.end_stream |= frame.header.flags & FLAG_END_STREAM != 0;

                // Replenish flow-control windows.
                let consumed = (data.len() as u32).max(1);
                framed
                    .write_frame(FrameType::WindowUpdate, 0, 0, &consumed.to_be_bytes())
                    .await?;
                framed
                    .write_frame(
                        FrameType::WindowUpdate,
                        0,
                        stream_id,
                        &consumed.to_be_bytes(),
                    )
                    .await?;
            }
            FrameType::Unknown => {}
        }

        // Answer every stream that is now complete.
        let ready: Vec<u32> = streams
            .iter()
            .filter(|(_, s)| s.headers_done && s.end_stream)
            .map(|(id, _)| *id)
            .collect();
        for stream_id in ready {
            let state = match streams.remove(&stream_id) {
                Some(state) => state,
                None => continue,
            };
            respond_stream(&mut framed, stream_id, state, &core, &meta).await?;
        }
    }
}

fn strip_headers_payload(frame: &Frame) -> Result<&[u8], Http2Error> {
    let mut payload = frame.payload.as_slice();
    let mut pad = 0usize;
    if frame.header.flags & FLAG_PADDED != 0 {
        let (&len, rest) = payload
            .split_first()
            .ok_or(Http2Error::Protocol("padded HEADERS too short"))?;
        pad = usize::from(len);
        payload = rest;
    }
    if frame.header.flags & FLAG_PRIORITY != 0 {
        if payload.len() < 5 {
            return Err(Http2Error::Protocol("priority HEADERS too short"));
        }
        payload = &payload[5..];
    }
    if pad > payload.len() {
        return Err(Http2Error::Protocol("padding exceeds payload"));
    }
    Ok(&payload[..payload.len() - pad])
}

fn strip_data_padding(frame: &Frame) -> Result<&[u8], Http2Error> {
    let mut payload = frame.payload.as_slice();
    let mut pad = 0usize;
    if frame.header.flags & FLAG_PADDED != 0 {
        let (&len, rest) = payload
            .split_first()
            .ok_or(Http2Error::Protocol("padded DATA too short"))?;
        pad = usize::from(len);
        payload = rest;
    }
    if pad > payload.len() {
        return Err(Http2Error::Protocol("padding exceeds payload"));
    }
    Ok(&payload[..payload.len() - pad])
}

async fn respond_stream<S: RawDuplex>(
    framed: &mut FramedH2<S>,
    stream_id: u32,
    state: H2StreamState,
    core: &Arc<ServerCore>,
    meta: &H2ConnMeta,
) -> Result<(), Http2Error> {
    let mut req = match build_request(state, core, meta) {
        Ok(req) => req,
        Err(msg) => {
            osrv_core::logging::warn(LOG_TARGET, &format!("malformed h2 stream: {msg}"));
            let mut block = Vec::new();
            hpack_encode_literal_without_indexing(&mut block, b":status", b"400");
            framed
                .write_frame(
                    FrameType::Headers,
                    FLAG_END_HEADERS | FLAG_END_STREAM,
                    stream_id,
                    &block,
                )
                .await?;
            return Ok(());
        }
    };

    let mut response = core.dispatch(&mut req).await;

    let mut block = Vec::new();
    let status = response.status().as_u16().to_string();
    hpack_encode_literal_without_indexing(&mut block, b":status", status.as_bytes());
    for (name, value) in response.headers() {
        // Hop-by-hop headers never cross an HTTP/2 response.
        if is_hop_by_hop(name) {
            continue;
        }
        let lowered = name.to_ascii_lowercase();
        hpack_encode_literal_without_indexing(&mut block, lowered.as_bytes(), value);
    }

    let body = match response.take_body() {
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

    let end_flags = if body.is_empty() {
        FLAG_END_HEADERS | FLAG_END_STREAM
    } else {
        FLAG_END_HEADERS
    };
    framed
        .write_frame(FrameType::Headers, end_flags, stream_id, &block)
        .await?;

    if !body.is_empty() {
        let mut chunks: VecDeque<&[u8]> = body.chunks(MAX_FRAME_SIZE as usize).collect();
        while let Some(chunk) = chunks.pop_front() {
            let flags = if chunks.is_empty() { FLAG_END_STREAM } else { 0 };
            framed
                .write_frame(FrameType::Data, flags, stream_id, chunk)
                .await?;
        }
    }
    Ok(())
}

fn build_request(
    state: H2StreamState,
    core: &Arc<ServerCore>,
    meta: &H2ConnMeta,
) -> Result<Request, String> {
    let mut method = None;
    let mut scheme = None;
    let mut authority = None;
    let mut path = None;
    let mut headers = Vec::new();

    for (name, value) in state.headers {
        match name.as_slice() {
            b":method" => method = Some(String::from_utf8_lossy(&value).into_owned()),
            b":scheme" => scheme = Some(String::from_utf8_lossy(&value).into_owned()),
            b":authority" => authority = Some(String::from_utf8_lossy(&value).into_owned()),
            b":path" => path = Some(String::from_utf8_lossy(&value).into_owned()),
            _ if name.starts_with(b":") => return Err("unknown pseudo-header".to_string()),
            _ => headers.push((
                String::from_utf8(name).map_err(|_| "non-UTF-8 header name".to_string())?,
                value,
            )),
        }
    }

    let method =
        Method::parse(&method.ok_or(":method missing")?).ok_or(":method empty".to_string())?;
    let scheme = scheme.unwrap_or_else(|| "https".to_string());
    let path = path.unwrap_or_else(|| "/".to_string());
    let url = match authority {
        Some(authority) => Url::parse(&format!("{scheme}://{authority}{path}"))
            .ok_or(":authority malformed".to_string())?,
        None => Url::from_parts(
            &scheme,
            &meta.fallback_host,
            Some(meta.fallback_port),
            &path,
        ),
    };

    let mut req = Request::new(method, url);
    for (name, value) in headers {
        req.headers_mut().append(name, value);
    }

    let protocol = if scheme == "http" {
        Protocol::Http
    } else {
        Protocol::Https
    };
    let ctx = RuntimeContext::builder("osrv")
        .protocol(protocol)
        .http_version(HttpVersion::H2)
        .local_address(meta.local_addr)
        .remote_address(meta.remote_addr)
        .env(core.config().env.clone())
        .raw(RawHandle::Native(serde_json::Value::Null))
        .build();
    req.set_runtime(Arc::new(ctx));
    req.set_wait_until(core.wait_until_sink());

    let forwarded = req
        .headers()
        .get_str("x-forwarded-for")
        .map(str::to_string);
    req.set_ip(crate::connection::resolve_client_ip(
        forwarded.as_deref(),
        meta.remote_addr,
        core.config().trust_proxy,
    ));

    match state.body_over_limit {
        Some((max, actual)) => req.set_body(Body::failed(BodyError::TooLarge { max, actual })),
        None if state.body.is_empty() => {}
        None => req.set_body(Body::Bytes(state.body)),
    }

    Ok(req)
}

// ============================================================================
// HPACK (RFC 7541)
// ============================================================================

/// HPACK decoding failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HpackError {
    /// Malformed prefixed integer.
    InvalidInteger,
    /// Malformed string literal.
    InvalidString,
    /// Index outside both tables.
    InvalidIndex,
    /// Malformed Huffman padding or EOS in the stream.
    InvalidHuffman,
    /// Dynamic table resize beyond the negotiated bound.
    DynamicTableSizeUpdateOutOfRange,
    /// Decoded header list exceeds the configured bound.
    HeaderListTooLarge,
}

impl std::fmt::Display for HpackError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

impl std::error::Error for HpackError {}

#[derive(Debug, Clone, PartialEq, Eq)]
struct HeaderField {
    name: Vec<u8>,
    value: Vec<u8>,
    size: usize,
}

impl HeaderField {
    fn new(name: Vec<u8>, value: Vec<u8>) -> Self {
        let size = 32 + name.len() + value.len();
        Self { name, value, size }
    }
}

/// Decoded header list as raw byte pairs.
pub type HeaderList = Vec<(Vec<u8>, Vec<u8>)>;

/// HPACK decoder with a dynamic table.
#[derive(Debug)]
pub struct HpackDecoder {
    dynamic: VecDeque<HeaderField>,
    dynamic_size: usize,
    dynamic_max_size: usize,
    max_header_list_size: usize,
}

impl Default for HpackDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl HpackDecoder {
    /// Create a decoder with RFC defaults.
    #[must_use]
    pub fn new() -> Self {
        Self {
            dynamic: VecDeque::new(),
            dynamic_size: 0,
            dynamic_max_size: 4096,
            max_header_list_size: 64 * 1024,
        }
    }

    /// Decode one complete header block.
    ///
    /// # Errors
    ///
    /// Any structural violation of RFC 7541.
    pub fn decode(&mut self, block: &[u8]) -> Result<HeaderList, HpackError> {
        let mut out: HeaderList = Vec::new();
        let mut i = 0usize;

        while i < block.len() {
            let b = block[i];

            if (b & 0x80) != 0 {
                // Indexed Header Field (1xxxxxxx)
                let (index, used) = decode_integer(&block[i..], 7)?;
                i += used;
                let (name, value) = self.get_indexed(index)?;
                out.push((name, value));
                continue;
            }

            if (b & 0xC0) == 0x40 {
                // Literal with Incremental Indexing (01xxxxxx)
                let (name, value, used) = self.decode_literal(&block[i..], 6)?;
                i += used;
                self.insert_dynamic(name.clone(), value.clone());
                out.push((name, value));
                continue;
            }

            if (b & 0xE0) == 0x20 {
                // Dynamic Table Size Update (001xxxxx)
                let (new_size, used) = decode_integer(&block[i..], 5)?;
                i += used;
                if new_size > self.dynamic_max_size {
                    return Err(HpackError::DynamicTableSizeUpdateOutOfRange);
                }
                self.dynamic_max_size = new_size;
                self.evict_to_max();
                continue;
            }

            // Literal without Indexing / Never Indexed (0000xxxx / 0001xxxx)
            let (name, value, used) = self.decode_literal(&block[i..], 4)?;
            i += used;
            out.push((name, value));
        }

        let total: usize = out.iter().map(|(n, v)| n.len() + v.len() + 32).sum();
        if total > self.max_header_list_size {
            return Err(HpackError::HeaderListTooLarge);
        }
        Ok(out)
    }

    fn decode_literal(
        &mut self,
        buf: &[u8],
        name_prefix_bits: u8,
    ) -> Result<(Vec<u8>, Vec<u8>, usize), HpackError> {
        let first = buf[0];
        let name_index_mask = (1u8 << name_prefix_bits) - 1;
        let name_index = usize::from(first & name_index_mask);

        let mut used = 0usize;
        let name = if name_index == 0 {
            used += 1;
            let (name_bytes, n_used) = decode_string(&buf[used..])?;
            used += n_used;
            name_bytes
        } else {
            let (index, n_used) = decode_integer(buf, name_prefix_bits)?;
            used += n_used;
            let (name, _value) = self.get_indexed(index)?;
            name
        };

        let (value, v_used) = decode_string(&buf[used..])?;
        used += v_used;
        Ok((name, value, used))
    }

    fn get_indexed(&self, index: usize) -> Result<(Vec<u8>, Vec<u8>), HpackError> {
        if index == 0 {
            return Err(HpackError::InvalidIndex);
        }
        let static_len = STATIC_TABLE.len();
        if index <= static_len {
            let (n, v) = STATIC_TABLE[index - 1];
            return Ok((n.to_vec(), v.to_vec()));
        }
        let field = self
            .dynamic
            .get(index - static_len - 1)
            .ok_or(HpackError::InvalidIndex)?;
        Ok((field.name.clone(), field.value.clone()))
    }

    fn insert_dynamic(&mut self, name: Vec<u8>, value: Vec<u8>) {
        let field = HeaderField::new(name, value);
        if field.size > self.dynamic_max_size {
            self.dynamic.clear();
            self.dynamic_size = 0;
            return;
        }
        self.dynamic_size += field.size;
        self.dynamic.push_front(field);
        self.evict_to_max();
    }

    fn evict_to_max(&mut self) {
        while self.dynamic_size > self.dynamic_max_size {
            let Some(back) = self.dynamic.pop_back() else {
                self.dynamic_size = 0;
                break;
            };
            self.dynamic_size = self.dynamic_size.saturating_sub(back.size);
        }
    }
}

fn decode_integer(buf: &[u8], prefix_bits: u8) -> Result<(usize, usize), HpackError> {
    if buf.is_empty() || prefix_bits == 0 || prefix_bits > 8 {
        return Err(HpackError::InvalidInteger);
    }
    let prefix_max = (1usize << prefix_bits) - 1;
    let mut value = usize::from(buf[0] & (prefix_max as u8));
    if value < prefix_max {
        return Ok((value, 1));
    }
    let mut m = 0usize;
    let mut idx = 1usize;
    loop {
        let b = *buf.get(idx).ok_or(HpackError::InvalidInteger)?;
        idx += 1;
        value = value
            .checked_add((usize::from(b & 0x7f)) << m)
            .ok_or(HpackError::InvalidInteger)?;
        if (b & 0x80) == 0 {
            break;
        }
        m = m.checked_add(7).ok_or(HpackError::InvalidInteger)?;
        if m > 63 {
            return Err(HpackError::InvalidInteger);
        }
    }
    Ok((value, idx))
}

fn decode_string(buf: &[u8]) -> Result<(Vec<u8>, usize), HpackError> {
    if buf.is_empty() {
        return Err(HpackError::InvalidString);
    }
    let huffman = (buf[0] & 0x80) != 0;
    let (len, used) = decode_integer(buf, 7)?;
    let start = used;
    let end = start.checked_add(len).ok_or(HpackError::InvalidString)?;
    let s = buf.get(start..end).ok_or(HpackError::InvalidString)?;
    if huffman {
        Ok((huffman_decode(s)?, end))
    } else {
        Ok((s.to_vec(), end))
    }
}

fn encode_integer(out: &mut Vec<u8>, first: u8, prefix_bits: u8, mut value: usize) {
    let prefix_max = (1usize << prefix_bits) - 1;
    if value < prefix_max {
        out.push(first | (value as u8));
        return;
    }
    out.push(first | (prefix_max as u8));
    value -= prefix_max;
    while value >= 128 {
        out.push(((value & 0x7f) as u8) | 0x80);
        value >>= 7;
    }
    out.push(value as u8);
}

fn encode_string(out: &mut Vec<u8>, bytes: &[u8]) {
    encode_integer(out, 0x00, 7, bytes.len());
    out.extend_from_slice(bytes);
}

/// Encode a literal header field without indexing: no Huffman, no dynamic
/// table, literal name. Deliberately the simplest valid encoding.
pub fn hpack_encode_literal_without_indexing(out: &mut Vec<u8>, name: &[u8], value: &[u8]) {
    encode_integer(out, 0x00, 4, 0);
    encode_string(out, name);
    encode_string(out, value);
}

// Static table: RFC 7541 Appendix A.
const STATIC_TABLE: [(&[u8], &[u8]); 61] = [
    (b":authority", b""),
    (b":method", b"GET"),
    (b":method", b"POST"),
    (b":path", b"/"),
    (b":path", b"/index.html"),
    (b":scheme", b"http"),
    (b":scheme", b"https"),
    (b":status", b"200"),
    (b":status", b"204"),
    (b":status", b"206"),
    (b":status", b"304"),
    (b":status", b"400"),
    (b":status", b"404"),
    (b":status", b"500"),
    (b"accept-charset", b""),
    (b"accept-encoding", b"gzip, deflate"),
    (b"accept-language", b""),
    (b"accept-ranges", b""),
    (b"accept", b""),
    (b"access-control-allow-origin", b""),
    (b"age", b""),
    (b"allow", b""),
    (b"authorization", b""),
    (b"cache-control", b""),
    (b"content-disposition", b""),
    (b"content-encoding", b""),
    (b"content-language", b""),
    (b"content-length", b""),
    (b"content-location", b""),
    (b"content-range", b""),
    (b"content-type", b""),
    (b"cookie", b""),
    (b"date", b""),
    (b"etag", b""),
    (b"expect", b""),
    (b"expires", b""),
    (b"from", b""),
    (b"host", b""),
    (b"if-match", b""),
    (b"if-modified-since", b""),
    (b"if-none-match", b""),
    (b"if-range", b""),
    (b"if-unmodified-since", b""),
    (b"last-modified", b""),
    (b"link", b""),
    (b"location", b""),
    (b"max-forwards", b""),
    (b"proxy-authenticate", b""),
    (b"proxy-authorization", b""),
    (b"range", b""),
    (b"referer", b""),
    (b"refresh", b""),
    (b"retry-after", b""),
    (b"server", b""),
    (b"set-cookie", b""),
    (b"strict-transport-security", b""),
    (b"transfer-encoding", b""),
    (b"user-agent", b""),
    (b"vary", b""),
    (b"via", b""),
    (b"www-authenticate", b""),
];

#[derive(Debug, Clone, Copy)]
struct HuffmanNode {
    left: Option<usize>,
    right: Option<usize>,
    sym: Option<u16>,
}

fn huffman_tree() -> &'static Vec<HuffmanNode> {
    static TREE: OnceLock<Vec<HuffmanNode>> = OnceLock::new();
    TREE.get_or_init(|| {
        let mut nodes = vec![HuffmanNode {
            left: None,
            right: None,
            sym: None,
        }];

        for (sym, (&code, &bits)) in HUFFMAN_CODES.iter().zip(HUFFMAN_BITS.iter()).enumerate() {
            let mut cur = 0usize;
            for bit_index in (0..bits).rev() {
                let bit = (code >> bit_index) & 1;
                let next_idx = if bit == 0 {
                    nodes[cur].left
                } else {
                    nodes[cur].right
                };

                cur = if let Some(idx) = next_idx {
                    idx
                } else {
                    let idx = nodes.len();
                    nodes.push(HuffmanNode {
                        left: None,
                        right: None,
                        sym: None,
                    });
                    if bit == 0 {
                        nodes[cur].left = Some(idx);
                    } else {
                        nodes[cur].right = Some(idx);
                    }
                    idx
                };
            }
            nodes[cur].sym = Some(u16::try_from(sym).unwrap_or(256));
        }

        nodes
    })
}

fn eos_prefix_nodes() -> &'static Vec<bool> {
    static NODES: OnceLock<Vec<bool>> = OnceLock::new();
    NODES.get_or_init(|| {
        let tree = huffman_tree();
        let mut is_prefix = vec![false; tree.len()];
        let eos_code = HUFFMAN_CODES[256];
        let eos_bits = HUFFMAN_BITS[256];

        let mut cur = 0usize;
        is_prefix[cur] = true;
        for bit_index in (0..eos_bits).rev() {
            let bit = (eos_code >> bit_index) & 1;
            cur = match if bit == 0 {
                tree[cur].left
            } else {
                tree[cur].right
            } {
                Some(idx) => idx,
                None => break,
            };
            if cur >= is_prefix.len() {
                break;
            }
            is_prefix[cur] = true;
        }
        is_prefix
    })
}

fn huffman_decode(bytes: &[u8]) -> Result<Vec<u8>, HpackError> {
    let tree = huffman_tree();
    let eos_prefix = eos_prefix_nodes();

    let mut out = Vec::with_capacity(bytes.len());
    let mut cur = 0usize;

    for &byte in bytes {
        for bit_shift in (0..8).rev() {
            let bit = (byte >> bit_shift) & 1;
            cur = if bit == 0 {
                tree[cur].left.ok_or(HpackError::InvalidHuffman)?
            } else {
                tree[cur].right.ok_or(HpackError::InvalidHuffman)?
            };
            if let Some(sym) = tree[cur].sym {
                if sym == 256 {
                    return Err(HpackError::InvalidHuffman);
                }
                out.push(u8::try_from(sym).map_err(|_| HpackError::InvalidHuffman)?);
                cur = 0;
            }
        }
    }

    // Padding must be a prefix of EOS.
    if cur != 0 && !eos_prefix.get(cur).copied().unwrap_or(false) {
        return Err(HpackError::InvalidHuffman);
    }
    Ok(out)
}

// Huffman table: RFC 7541 Appendix B. Code (MSB-first) + bit length for
// symbols 0..=256 (EOS).
#[rustfmt::skip]
#[allow(clippy::unreadable_literal)]
const HUFFMAN_CODES: [u32; 257] = [
    0x1ff8,0x7fffd8,0xfffffe2,0xfffffe3,0xfffffe4,0xfffffe5,0xfffffe6,0xfffffe7,
    0xfffffe8,0xffffea,0x3ffffffc,0xfffffe9,0xfffffea,0x3ffffffd,0xfffffeb,0xfffffec,
    0xfffffed,0xfffffee,0xfffffef,0xffffff0,0xffffff1,0xffffff2,0x3ffffffe,0xffffff3,
    0xffffff4,0xffffff5,0xffffff6,0xffffff7,0xffffff8,0xffffff9,0xffffffa,0xffffffb,
    0x14,0x3f8,0x3f9,0xffa,0x1ff9,0x15,0xf8,0x7fa,0x3fa,0x3fb,0xf9,0x7fb,0xfa,
    0x16,0x17,0x18,0x0,0x1,0x2,0x19,0x1a,0x1b,0x1c,0x1d,0x1e,0x1f,0x5c,0xfb,
    0x7ffc,0x20,0xffb,0x3fc,0x1ffa,0x21,0x5d,0x5e,0x5f,0x60,0x61,0x62,0x63,
    0x64,0x65,0x66,0x67,0x68,0x69,0x6a,0x6b,0x6c,0x6d,0x6e,0x6f,0x70,0x71,
    0x72,0xfc,0x73,0xfd,0x1ffb,0x7fff0,0x1ffc,0x3ffc,0x22,0x7ffd,0x3,0x23,0x4,
    0x24,0x5,0x25,0x26,0x27,0x6,0x74,0x75,0x28,0x29,0x2a,0x7,0x2b,0x76,0x2c,
    0x8,0x9,0x2d,0x77,0x78,0x79,0x7a,0x7b,0x7ffe,0x7fc,0x3ffd,0x1ffd,0xffffffc,
    0xfffe6,0x3fffd2,0xfffe7,0xfffe8,0x3fffd3,0x3fffd4,0x3fffd5,0x7fffd9,0x3fffd6,
    0x7fffda,0x7fffdb,0x7fffdc,0x7fffdd,0x7fffde,0xffffeb,0x7fffdf,0xffffec,0xffffed,
    0x3fffd7,0x7fffe0,0xffffee,0x7fffe1,0x7fffe2,0x7fffe3,0x7fffe4,0x1fffdc,0x3fffd8,
    0x7fffe5,0x3fffd9,0x7fffe6,0x7fffe7,0xffffef,0x3fffda,0x1fffdd,0xfffe9,0x3fffdb,
    0x3fffdc,0x7fffe8,0x7fffe9,0x1fffde,0x7fffea,0x3fffdd,0x3fffde,0xfffff0,0x1fffdf,
    0x3fffdf,0x7fffeb,0x7fffec,0x1fffe0,0x1fffe1,0x3fffe0,0x1fffe2,0x7fffed,0x3fffe1,
    0x7fffee,0x7fffef,0xfffea,0x3fffe2,0x3fffe3,0x3fffe4,0x7ffff0,0x3fffe5,0x3fffe6,
    0x7ffff1,0x3ffffe0,0x3ffffe1,0xfffeb,0x7fff1,0x3fffe7,0x7ffff2,0x3fffe8,0x1ffffec,
    0x3ffffe2,0x3ffffe3,0x3ffffe4,0x7ffffde,0x7ffffdf,0x3ffffe5,0xfffff1,0x1ffffed,
    0x7fff2,0x1fffe3,0x3ffffe6,0x7ffffe0,0x7ffffe1,0x3ffffe7,0x7ffffe2,0xfffff2,
    0x1fffe4,0x1fffe5,0x3ffffe8,0x3ffffe9,0xffffffd,0x7ffffe3,0x7ffffe4,0x7ffffe5,
    0xfffec,0xfffff3,0xfffed,0x1fffe6,0x3fffe9,0x1fffe7,0x1fffe8,0x7ffff3,0x3fffea,
    0x3fffeb,0x1ffffee,0x1ffffef,0xfffff4,0xfffff5,0x3ffffea,0x7ffff4,0x3ffffeb,
    0x7ffffe6,0x3ffffec,0x3ffffed,0x7ffffe7,0x7ffffe8,0x7ffffe9,0x7ffffea,0x7ffffeb,
    0xffffffe,0x7ffffec,0x7ffffed,0x7ffffee,0x7ffffef,0x7fffff0,0x3ffffee,0x3fffffff,
];

#[rustfmt::skip]
const HUFFMAN_BITS: [u8; 257] = [
    13,23,28,28,28,28,28,28,28,24,30,28,28,30,28,28,
    28,28,28,28,28,28,30,28,28,28,28,28,28,28,28,28,
    6,10,10,12,13,6,8,11,10,10,8,11,8,6,6,6,
    5,5,5,6,6,6,6,6,6,6,7,8,15,6,12,10,
    13,6,7,7,7,7,7,7,7,7,7,7,7,7,7,7,
    7,7,7,7,7,7,7,7,8,7,8,13,19,13,14,6,
    15,5,6,5,6,5,6,6,6,5,7,7,6,6,6,5,
    6,7,6,5,5,6,7,7,7,7,7,15,11,14,13,28,
    20,22,20,20,22,22,22,23,22,23,23,23,23,23,24,23,
    24,24,22,23,24,23,23,23,23,21,22,23,22,23,23,24,
    22,21,20,22,22,23,23,21,23,22,22,24,21,22,23,23,
    21,21,22,21,23,22,23,23,20,22,22,22,23,22,22,23,
    26,26,20,19,22,23,22,25,26,26,26,27,27,26,24,25,
    19,21,26,27,27,26,27,24,21,21,26,26,28,27,27,27,
    20,24,20,21,22,21,21,23,22,22,25,25,24,24,26,23,
    26,27,26,26,27,27,27,27,27,28,27,27,27,27,27,26,
    30,
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preface_constant_matches_rfc() {
        assert_eq!(PREFACE, b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n");
        assert_eq!(PREFACE.len(), 24);
    }

    #[test]
    fn hpack_rfc_vector_first_request() {
        // RFC 7541 C.2.1-style first request block with Huffman authority.
        let block: [u8; 17] = [
            0x82, 0x86, 0x84, 0x41, 0x8c, 0xf1, 0xe3, 0xc2, 0xe5, 0xf2, 0x3a, 0x6b, 0xa0, 0xab,
            0x90, 0xf4, 0xff,
        ];
        let mut dec = HpackDecoder::new();
        let headers = dec.decode(&block).unwrap();

        assert!(headers.contains(&(b":method".to_vec(), b"GET".to_vec())));
        assert!(headers.contains(&(b":scheme".to_vec(), b"http".to_vec())));
        assert!(headers.contains(&(b":path".to_vec(), b"/".to_vec())));
        assert!(headers.contains(&(b":authority".to_vec(), b"www.example.com".to_vec())));
    }

    #[test]
    fn hpack_literal_with_indexing_populates_dynamic_table() {
        // 0x40 = literal with incremental indexing, literal name.
        let mut block = Vec::new();
        block.push(0x40);
        encode_string(&mut block, b"x-custom");
        encode_string(&mut block, b"one");
        // Indexed reference to the entry just inserted (static 61 + 1).
        encode_integer(&mut block, 0x80, 7, 62);

        let mut dec = HpackDecoder::new();
        let headers = dec.decode(&block).unwrap();
        assert_eq!(headers.len(), 2);
        assert_eq!(headers[0], (b"x-custom".to_vec(), b"one".to_vec()));
        assert_eq!(headers[1], (b"x-custom".to_vec(), b"one".to_vec()));
    }

    #[test]
    fn hpack_rejects_eos_symbol() {
        // EOS code provided as a huffman string is invalid.
        let buf: [u8; 5] = [0x80 | 4, 0xff, 0xff, 0xff, 0xff];
        let res = decode_string(&buf);
        assert!(matches!(res, Err(HpackError::InvalidHuffman)));
    }

    #[test]
    fn hpack_encoder_decodes_back() {
        let mut block = Vec::new();
        hpack_encode_literal_without_indexing(&mut block, b":status", b"200");
        hpack_encode_literal_without_indexing(&mut block, b"content-type", b"text/plain");

        let mut dec = HpackDecoder::new();
        let headers = dec.decode(&block).unwrap();
        assert_eq!(
            headers,
            vec![
                (b":status".to_vec(), b"200".to_vec()),
                (b"content-type".to_vec(), b"text/plain".to_vec()),
            ]
        );
    }

    #[test]
    fn integer_encoding_round_trips() {
        for value in [0usize, 1, 30, 31, 127, 128, 255, 16384, 1_000_000] {
            for prefix in [4u8, 5, 6, 7] {
                let mut out = Vec::new();
                encode_integer(&mut out, 0, prefix, value);
                let (decoded, used) = decode_integer(&out, prefix).unwrap();
                assert_eq!(decoded, value, "prefix {prefix}");
                assert_eq!(used, out.len());
            }
        }
    }

    #[test]
    fn frame_header_round_trip_via_bytes() {
        // Encode a frame and parse the header back by hand.
        let payload = b"ping-pong".to_vec();
        let mut bytes = Vec::new();
        let len = payload.len() as u32;
        bytes.push(((len >> 16) & 0xff) as u8);
        bytes.push(((len >> 8) & 0xff) as u8);
        bytes.push((len & 0xff) as u8);
        bytes.push(FrameType::Ping as u8);
        bytes.push(FLAG_ACK);
        bytes.extend_from_slice(&7u32.to_be_bytes());
        bytes.extend_from_slice(&payload);

        assert_eq!(bytes.len(), FrameHeader::LEN + payload.len());
        assert_eq!(FrameType::from_u8(bytes[3]), FrameType::Ping);
        assert_eq!(bytes[4] & FLAG_ACK, FLAG_ACK);
    }

    #[test]
    fn padded_data_frames_strip_padding() {
        let frame = Frame {
            header: FrameHeader {
                length: 7,
                frame_type: FrameType::Data as u8,
                flags: FLAG_PADDED,
                stream_id: 1,
            },
            payload: {
                let mut p = vec![2u8]; // pad length
                p.extend_from_slice(b"data");
                p.extend_from_slice(&[0, 0]);
                p
            },
        };
        assert_eq!(strip_data_padding(&frame).unwrap(), b"data");
    }

    #[test]
    fn padding_longer_than_payload_rejected() {
        let frame = Frame {
            header: FrameHeader {
                length: 2,
                frame_type: FrameType::Data as u8,
                flags: FLAG_PADDED,
                stream_id: 1,
            },
            payload: vec![9u8, b'x'],
        };
        assert!(strip_data_padding(&frame).is_err());
    }

    #[test]
    fn headers_priority_fields_stripped() {
        let frame = Frame {
            header: FrameHeader {
                length: 8,
                frame_type: FrameType::Headers as u8,
                flags: FLAG_PRIORITY | FLAG_END_HEADERS,
                stream_id: 1,
            },
            payload: {
                let mut p = vec![0u8; 5]; // stream dependency + weight
                p.extend_from_slice(b"abc");
                p
            },
        };
        assert_eq!(strip_headers_payload(&frame).unwrap(), b"abc");
    }
}
