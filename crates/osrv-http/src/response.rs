//! HTTP/1.1 response serialization.
//!
//! The writer owns message framing: it computes `content-length` for
//! buffered bodies and switches to chunked transfer coding for streams.
//! User-supplied hop-by-hop headers are dropped on this path too (the writer
//! decides connection semantics itself); `set-cookie` multiplicity and
//! header order otherwise survive as given.

use asupersync::io::AsyncWrite;
use asupersync::stream::StreamExt;
use std::io;

use osrv_core::response::{Response, ResponseBody};
use osrv_core::runtime::HttpVersion;

use crate::connection::is_hop_by_hop;
use crate::io::{flush, write_all};

/// Serialize the head of a response.
fn head_bytes(response: &Response, version: HttpVersion, keep_alive: bool) -> Vec<u8> {
    let status = response.status();
    let mut out = Vec::with_capacity(256);
    let version_token = match version {
        HttpVersion::Http10 => "HTTP/1.0",
        _ => "HTTP/1.1",
    };
    out.extend_from_slice(
        format!(
            "{version_token} {} {}\r\n",
            status.as_u16(),
            response.reason_phrase()
        )
        .as_bytes(),
    );

    for (name, value) in response.headers() {
        if is_hop_by_hop(name) || name.eq_ignore_ascii_case("content-length") {
            continue;
        }
        out.extend_from_slice(name.as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value);
        out.extend_from_slice(b"\r\n");
    }

    match response.body_ref() {
        ResponseBody::Stream(_) if status.allows_body() => {
            out.extend_from_slice(b"transfer-encoding: chunked\r\n");
        }
        body => {
            if status.allows_body() {
                let len = body.len().unwrap_or(0);
                out.extend_from_slice(format!("content-length: {len}\r\n").as_bytes());
            }
        }
    }

    if !keep_alive {
        out.extend_from_slice(b"connection: close\r\n");
    }
    out.extend_from_slice(b"\r\n");
    out
}

/// Write a response to the stream.
///
/// `head_only` suppresses the body (HEAD requests) while keeping the framing
/// headers the full response would carry.
///
/// # Errors
///
/// Propagates stream I/O failures.
pub async fn write_response<S: AsyncWrite + Unpin + ?Sized>(
    stream: &mut S,
    mut response: Response,
    version: HttpVersion,
    keep_alive: bool,
    head_only: bool,
) -> io::Result<()> {
    let allows_body = response.status().allows_body();
    let head = head_bytes(&response, version, keep_alive);
    write_all(stream, &head).await?;

    if !head_only && allows_body {
        match response.take_body() {
            ResponseBody::Empty => {}
            ResponseBody::Bytes(bytes) => {
                write_all(stream, &bytes).await?;
            }
            ResponseBody::Stream(mut body) => {
                while let Some(chunk) = body.next().await {
                    if chunk.is_empty() {
                        continue;
                    }
                    let size_line = format!("{:X}\r\n", chunk.len());
                    write_all(stream, size_line.as_bytes()).await?;
                    write_all(stream, &chunk).await?;
                    write_all(stream, b"\r\n").await?;
                }
                write_all(stream, b"0\r\n\r\n").await?;
            }
        }
    }

    flush(stream).await
}
