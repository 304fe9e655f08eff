//! Small async I/O helpers shared by the transport modules.

use asupersync::io::{AsyncRead, AsyncWrite, ReadBuf};
use std::future::poll_fn;
use std::io;
use std::pin::Pin;
use std::task::Poll;

/// A byte-stream a request can ride on: plain TCP or a TLS session.
///
/// Object-safe so an upgraded WebSocket can own either kind behind one box.
pub trait RawDuplex: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> RawDuplex for T {}

/// Read once into the buffer; returns the number of bytes read (0 = EOF).
pub async fn read_once<S: AsyncRead + Unpin + ?Sized>(
    stream: &mut S,
    buffer: &mut [u8],
) -> io::Result<usize> {
    poll_fn(|cx| {
        let mut read_buf = ReadBuf::new(buffer);
        match Pin::new(&mut *stream).poll_read(cx, &mut read_buf) {
            Poll::Ready(Ok(())) => Poll::Ready(Ok(read_buf.filled().len())),
            Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
            Poll::Pending => Poll::Pending,
        }
    })
    .await
}

/// Write the whole buffer.
pub async fn write_all<S: AsyncWrite + Unpin + ?Sized>(stream: &mut S, mut buf: &[u8]) -> io::Result<()> {
    while !buf.is_empty() {
        let n = poll_fn(|cx| Pin::new(&mut *stream).poll_write(cx, buf)).await?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                "failed to write whole buffer",
            ));
        }
        buf = &buf[n..];
    }
    Ok(())
}

/// Flush the stream.
pub async fn flush<S: AsyncWrite + Unpin + ?Sized>(stream: &mut S) -> io::Result<()> {
    poll_fn(|cx| Pin::new(&mut *stream).poll_flush(cx)).await
}

/// Read exactly `n` bytes, drawing from `buffer` first and the stream after.
///
/// `buffer` holds bytes already read past the previous parse point; consumed
/// bytes are drained from it.
pub async fn read_exact_buffered<S: AsyncRead + Unpin + ?Sized>(
    stream: &mut S,
    buffer: &mut Vec<u8>,
    n: usize,
) -> io::Result<Vec<u8>> {
    while buffer.len() < n {
        let mut tmp = [0u8; 8192];
        let read = read_once(stream, &mut tmp).await?;
        if read == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed mid-body",
            ));
        }
        buffer.extend_from_slice(&tmp[..read]);
    }
    Ok(buffer.drain(..n).collect())
}

/// Read until the buffer contains a full line (`\n`), returning it without
/// the trailing CRLF. Draws from `buffer` first.
pub async fn read_line_buffered<S: AsyncRead + Unpin + ?Sized>(
    stream: &mut S,
    buffer: &mut Vec<u8>,
    max_len: usize,
) -> io::Result<Vec<u8>> {
    loop {
        if let Some(pos) = buffer.iter().position(|&b| b == b'\n') {
            let mut line: Vec<u8> = buffer.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            return Ok(line);
        }
        if buffer.len() > max_len {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "line too long"));
        }
        let mut tmp = [0u8; 8192];
        let read = read_once(stream, &mut tmp).await?;
        if read == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed mid-line",
            ));
        }
        buffer.extend_from_slice(&tmp[..read]);
    }
}
