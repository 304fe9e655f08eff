//! Size-limited request body reading.
//!
//! Bodies are read off the connection up to `max_request_body_bytes`. A
//! declared `Content-Length` over the limit fails immediately without
//! reading; chunked bodies count cumulative bytes and fail at the point the
//! limit is crossed. Either way the request carries a body that surfaces
//! `BodyError::TooLarge` when consumed, which dispatch turns into the 413
//! response.

use asupersync::io::AsyncRead;
use std::io;

use osrv_core::request::{Body, BodyError};
use osrv_core::TransportError;

use crate::io::{read_exact_buffered, read_line_buffered};
use crate::parser::BodyLength;

/// Maximum length of one chunk-size line.
const MAX_CHUNK_LINE: usize = 1024;

/// Outcome of reading a request body.
#[derive(Debug)]
pub enum BodyOutcome {
    /// The body fit the limit.
    Complete(Vec<u8>),
    /// The body crossed the limit.
    OverLimit {
        /// Configured limit.
        max: u64,
        /// Declared or counted size when the limit tripped.
        actual: u64,
        /// Whether the over-limit bytes were fully drained off the
        /// connection (keep-alive is only safe when true).
        drained: bool,
    },
}

impl BodyOutcome {
    /// Convert into the request body value.
    #[must_use]
    pub fn into_body(self) -> Body {
        match self {
            Self::Complete(bytes) if bytes.is_empty() => Body::Empty,
            Self::Complete(bytes) => Body::Bytes(bytes),
            Self::OverLimit { max, actual, .. } => Body::failed(BodyError::TooLarge { max, actual }),
        }
    }

    /// Whether the connection can be reused after this body.
    #[must_use]
    pub fn keep_alive_safe(&self) -> bool {
        match self {
            Self::Complete(_) => true,
            Self::OverLimit { drained, .. } => *drained,
        }
    }
}

/// Read a request body according to its delimitation, enforcing the byte
/// limit.
///
/// `buffer` holds bytes already read past the request head.
///
/// # Errors
///
/// Fails on connection I/O errors or malformed chunked framing; the size
/// limit is not an error here but an [`BodyOutcome::OverLimit`] outcome.
pub async fn read_body<S: AsyncRead + Unpin + ?Sized>(
    stream: &mut S,
    buffer: &mut Vec<u8>,
    length: BodyLength,
    max: u64,
) -> Result<BodyOutcome, TransportError> {
    match length {
        BodyLength::None => Ok(BodyOutcome::Complete(Vec::new())),
        BodyLength::ContentLength(declared) => {
            if declared > max {
                // Fail without reading; the unread body poisons keep-alive.
                return Ok(BodyOutcome::OverLimit {
                    max,
                    actual: declared,
                    drained: false,
                });
            }
            let len = usize::try_from(declared).map_err(|_| {
                TransportError::Protocol("content-length exceeds addressable memory".to_string())
            })?;
            let bytes = read_exact_buffered(stream, buffer, len).await?;
            Ok(BodyOutcome::Complete(bytes))
        }
        BodyLength::Chunked => read_chunked(stream, buffer, max).await,
    }
}

async fn read_chunked<S: AsyncRead + Unpin + ?Sized>(
    stream: &mut S,
    buffer: &mut Vec<u8>,
    max: u64,
) -> Result<BodyOutcome, TransportError> {
    let mut body = Vec::new();
    let mut total: u64 = 0;

    loop {
        let line = read_line_buffered(stream, buffer, MAX_CHUNK_LINE).await?;
        let size = parse_chunk_size(&line)?;
        if size == 0 {
            // Trailer section: consume lines through the blank terminator.
            loop {
                let trailer = read_line_buffered(stream, buffer, MAX_CHUNK_LINE).await?;
                if trailer.is_empty() {
                    return Ok(BodyOutcome::Complete(body));
                }
            }
        }

        total = total.saturating_add(size);
        if total > max {
            // The limit is crossed inside this chunk; stop reading and give
            // up on the connection.
            return Ok(BodyOutcome::OverLimit {
                max,
                actual: total,
                drained: false,
            });
        }

        let chunk_len = usize::try_from(size).map_err(|_| {
            TransportError::Protocol("chunk size exceeds addressable memory".to_string())
        })?;
        let chunk = read_exact_buffered(stream, buffer, chunk_len).await?;
        body.extend_from_slice(&chunk);

        // Chunk data is followed by CRLF.
        let terminator = read_exact_buffered(stream, buffer, 2).await?;
        if terminator != b"\r\n" {
            return Err(TransportError::Protocol(
                "chunk data not terminated by CRLF".to_string(),
            ));
        }
    }
}

fn parse_chunk_size(line: &[u8]) -> Result<u64, TransportError> {
    let text = std::str::from_utf8(line)
        .map_err(|_| TransportError::Protocol("chunk size is not ASCII".to_string()))?;
    // Chunk extensions after ';' are ignored.
    let size_part = text.split(';').next().unwrap_or_default().trim();
    u64::from_str_radix(size_part, 16)
        .map_err(|_| TransportError::Protocol(format!("invalid chunk size: {size_part:?}")))
}

/// Map a transport I/O failure to the body error the handler observes.
#[must_use]
pub fn io_body_error(err: &io::Error) -> BodyError {
    match err.kind() {
        io::ErrorKind::UnexpectedEof => BodyError::ConnectionClosed,
        io::ErrorKind::TimedOut => BodyError::Timeout,
        _ => BodyError::Io(err.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// An AsyncRead over a fixed script of reads.
    struct ScriptedRead {
        data: Vec<u8>,
        pos: usize,
    }

    impl ScriptedRead {
        fn new(data: &[u8]) -> Self {
            Self {
                data: data.to_vec(),
                pos: 0,
            }
        }
    }

    impl AsyncRead for ScriptedRead {
        fn poll_read(
            mut self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
            buf: &mut asupersync::io::ReadBuf<'_>,
        ) -> std::task::Poll<io::Result<()>> {
            let remaining = &self.data[self.pos..];
            if remaining.is_empty() {
                return std::task::Poll::Ready(Ok(()));
            }
            let n = remaining.len().min(buf.remaining()).min(7);
            buf.put_slice(&remaining[..n]);
            self.pos += n;
            std::task::Poll::Ready(Ok(()))
        }
    }

    #[test]
    fn content_length_body_reads_exactly() {
        let mut stream = ScriptedRead::new(b"hello worldEXTRA");
        let mut buffer = Vec::new();
        let outcome = futures_executor::block_on(read_body(
            &mut stream,
            &mut buffer,
            BodyLength::ContentLength(11),
            1024,
        ))
        .unwrap();
        match outcome {
            BodyOutcome::Complete(bytes) => assert_eq!(bytes, b"hello world"),
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn declared_over_limit_fails_without_reading() {
        let mut stream = ScriptedRead::new(b"1234567890");
        let mut buffer = Vec::new();
        let outcome = futures_executor::block_on(read_body(
            &mut stream,
            &mut buffer,
            BodyLength::ContentLength(10),
            4,
        ))
        .unwrap();
        match &outcome {
            BodyOutcome::OverLimit {
                max,
                actual,
                drained,
            } => {
                assert_eq!((*max, *actual), (4, 10));
                assert!(!drained);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert!(!outcome_keep_alive(&outcome));

        // Consuming the body yields the documented error.
        let body = outcome_into_body(BodyOutcome::OverLimit {
            max: 4,
            actual: 10,
            drained: false,
        });
        let err = futures_executor::block_on(body.into_bytes_async()).unwrap_err();
        assert_eq!(err, BodyError::TooLarge { max: 4, actual: 10 });
    }

    fn outcome_keep_alive(outcome: &BodyOutcome) -> bool {
        outcome.keep_alive_safe()
    }

    fn outcome_into_body(outcome: BodyOutcome) -> Body {
        outcome.into_body()
    }

    #[test]
    fn chunked_body_reassembles() {
        let wire = b"5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n";
        let mut stream = ScriptedRead::new(wire);
        let mut buffer = Vec::new();
        let outcome = futures_executor::block_on(read_body(
            &mut stream,
            &mut buffer,
            BodyLength::Chunked,
            1024,
        ))
        .unwrap();
        match outcome {
            BodyOutcome::Complete(bytes) => assert_eq!(bytes, b"hello world"),
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn chunked_body_over_limit_counts_cumulative_bytes() {
        let wire = b"5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n";
        let mut stream = ScriptedRead::new(wire);
        let mut buffer = Vec::new();
        let outcome = futures_executor::block_on(read_body(
            &mut stream,
            &mut buffer,
            BodyLength::Chunked,
            8,
        ))
        .unwrap();
        match outcome {
            BodyOutcome::OverLimit { max, actual, .. } => {
                assert_eq!(max, 8);
                assert_eq!(actual, 11, "limit tripped at the second chunk");
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn chunk_extensions_are_ignored() {
        let wire = b"5;ext=1\r\nhello\r\n0\r\n\r\n";
        let mut stream = ScriptedRead::new(wire);
        let mut buffer = Vec::new();
        let outcome = futures_executor::block_on(read_body(
            &mut stream,
            &mut buffer,
            BodyLength::Chunked,
            1024,
        ))
        .unwrap();
        assert!(matches!(outcome, BodyOutcome::Complete(b) if b == b"hello"));
    }

    #[test]
    fn malformed_chunk_size_is_protocol_error() {
        let wire = b"zz\r\nhello\r\n";
        let mut stream = ScriptedRead::new(wire);
        let mut buffer = Vec::new();
        let err = futures_executor::block_on(read_body(
            &mut stream,
            &mut buffer,
            BodyLength::Chunked,
            1024,
        ))
        .unwrap_err();
        assert!(matches!(err, TransportError::Protocol(_)));
    }
}
