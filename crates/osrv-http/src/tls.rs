//! TLS termination over rustls.
//!
//! rustls is sans-io: [`TlsStream`] owns the raw stream and a
//! `ServerConnection`, feeding ciphertext between them and exposing the
//! plaintext session as `AsyncRead + AsyncWrite`. ALPN advertises `h2` and
//! `http/1.1` (or only `http/1.1` when HTTP/2 is disabled), and the
//! negotiated protocol picks the serving path after the handshake.

use std::io::{Read, Write};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use asupersync::io::{AsyncRead, AsyncWrite, ReadBuf};
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::{ServerConfig, ServerConnection};

use osrv_core::config::{PemSource, TlsConfig};
use osrv_core::TransportError;

use crate::io::read_once;

const LOG_TARGET: &str = "osrv::tls";

/// ALPN token for HTTP/2.
pub const ALPN_H2: &[u8] = b"h2";
/// ALPN token for HTTP/1.1.
pub const ALPN_HTTP11: &[u8] = b"http/1.1";

fn load_certs(source: &PemSource) -> Result<Vec<CertificateDer<'static>>, TransportError> {
    let certs: Result<Vec<_>, _> = match source {
        PemSource::Inline(text) => CertificateDer::pem_slice_iter(text.as_bytes()).collect(),
        PemSource::Path(path) => CertificateDer::pem_file_iter(path)
            .map_err(|e| TransportError::Tls(format!("cannot open certificate {path}: {e}")))?
            .collect(),
    };
    let certs = certs.map_err(|e| TransportError::Tls(format!("invalid certificate PEM: {e}")))?;
    if certs.is_empty() {
        return Err(TransportError::Tls(
            "certificate source contains no certificates".to_string(),
        ));
    }
    Ok(certs)
}

fn load_key(source: &PemSource) -> Result<PrivateKeyDer<'static>, TransportError> {
    match source {
        PemSource::Inline(text) => PrivateKeyDer::from_pem_slice(text.as_bytes())
            .map_err(|e| TransportError::Tls(format!("invalid private key PEM: {e}"))),
        PemSource::Path(path) => PrivateKeyDer::from_pem_file(path)
            .map_err(|e| TransportError::Tls(format!("cannot load private key {path}: {e}"))),
    }
}

/// Build the rustls server config from TLS options.
///
/// # Errors
///
/// Fails when the PEM material cannot be loaded or the certificate/key pair
/// is rejected. Passphrase-protected keys are not supported; the passphrase
/// is reported back in the error to make the misconfiguration obvious.
pub fn build_server_config(
    tls: &TlsConfig,
    http2: bool,
) -> Result<Arc<ServerConfig>, TransportError> {
    if tls.passphrase.is_some() {
        return Err(TransportError::Tls(
            "passphrase-protected keys are not supported; provide an unencrypted PKCS#8 key"
                .to_string(),
        ));
    }
    let certs = load_certs(&tls.cert)?;
    let key = load_key(&tls.key)?;

    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| TransportError::Tls(format!("certificate/key rejected: {e}")))?;

    config.alpn_protocols = if http2 {
        vec![ALPN_H2.to_vec(), ALPN_HTTP11.to_vec()]
    } else {
        osrv_core::logging::warn(
            LOG_TARGET,
            "HTTP/2 disabled; advertising http/1.1 only over ALPN",
        );
        vec![ALPN_HTTP11.to_vec()]
    };
    Ok(Arc::new(config))
}

/// The protocol negotiated by ALPN.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiatedProtocol {
    /// HTTP/2.
    H2,
    /// HTTP/1.1 (also the fallback when the client sent no ALPN).
    Http11,
}

/// A TLS session over a raw stream.
pub struct TlsStream<S> {
    inner: S,
    conn: ServerConnection,
    /// TLS records produced by rustls, waiting to go out on `inner`.
    out_buf: Vec<u8>,
    /// Peer closed the raw stream.
    eof: bool,
}

impl<S: AsyncRead + AsyncWrite + Unpin> TlsStream<S> {
    /// Perform the server-side handshake.
    ///
    /// # Errors
    ///
    /// Fails on I/O errors or TLS alerts during the handshake.
    pub async fn accept(config: Arc<ServerConfig>, inner: S) -> Result<Self, TransportError> {
        let conn = ServerConnection::new(config)
            .map_err(|e| TransportError::Tls(format!("session setup failed: {e}")))?;
        let mut stream = Self {
            inner,
            conn,
            out_buf: Vec::new(),
            eof: false,
        };
        stream.drive_handshake().await?;
        Ok(stream)
    }

    /// The ALPN-negotiated protocol.
    #[must_use]
    pub fn negotiated(&self) -> NegotiatedProtocol {
        match self.conn.alpn_protocol() {
            Some(p) if p == ALPN_H2 => NegotiatedProtocol::H2,
            _ => NegotiatedProtocol::Http11,
        }
    }

    /// SNI hostname presented by the client, if any.
    #[must_use]
    pub fn sni_hostname(&self) -> Option<&str> {
        self.conn.server_name()
    }

    async fn drive_handshake(&mut self) -> Result<(), TransportError> {
        while self.conn.is_handshaking() {
            self.blocking_flush_tls().await?;
            if !self.conn.is_handshaking() {
                break;
            }
            self.blocking_read_tls().await?;
        }
        // Flush the final flight.
        self.blocking_flush_tls().await?;
        Ok(())
    }

    /// Pull one batch of ciphertext from the raw stream into rustls.
    async fn blocking_read_tls(&mut self) -> Result<(), TransportError> {
        let mut buf = [0u8; 16 * 1024];
        let n = read_once(&mut self.inner, &mut buf)
            .await
            .map_err(TransportError::Io)?;
        if n == 0 {
            self.eof = true;
            return Err(TransportError::Tls(
                "connection closed during handshake".to_string(),
            ));
        }
        let mut cursor = std::io::Cursor::new(&buf[..n]);
        while (cursor.position() as usize) < n {
            self.conn
                .read_tls(&mut cursor)
                .map_err(TransportError::Io)?;
        }
        self.conn
            .process_new_packets()
            .map_err(|e| TransportError::Tls(e.to_string()))?;
        Ok(())
    }

    /// Write every pending TLS record to the raw stream.
    async fn blocking_flush_tls(&mut self) -> Result<(), TransportError> {
        while self.conn.wants_write() {
            self.conn
                .write_tls(&mut self.out_buf)
                .map_err(TransportError::Io)?;
        }
        if !self.out_buf.is_empty() {
            let data = std::mem::take(&mut self.out_buf);
            crate::io::write_all(&mut self.inner, &data)
                .await
                .map_err(TransportError::Io)?;
            crate::io::flush(&mut self.inner)
                .await
                .map_err(TransportError::Io)?;
        }
        Ok(())
    }

    /// Queue pending rustls output and push as much as possible to `inner`.
    fn poll_flush_tls(&mut self, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        while self.conn.wants_write() {
            self.conn.write_tls(&mut self.out_buf)?;
        }
        while !self.out_buf.is_empty() {
            match Pin::new(&mut self.inner).poll_write(cx, &self.out_buf) {
                Poll::Ready(Ok(0)) => {
                    return Poll::Ready(Err(std::io::Error::new(
                        std::io::ErrorKind::WriteZero,
                        "tls transport closed",
                    )));
                }
                Poll::Ready(Ok(n)) => {
                    self.out_buf.drain(..n);
                }
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => return Poll::Pending,
            }
        }
        Poll::Ready(Ok(()))
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncRead for TlsStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        loop {
            // Drain decrypted plaintext first.
            let mut plain = [0u8; 8 * 1024];
            let want = buf.remaining().min(plain.len());
            if want == 0 {
                return Poll::Ready(Ok(()));
            }
            match this.conn.reader().read(&mut plain[..want]) {
                Ok(0) => {
                    // Clean close_notify from the peer.
                    return Poll::Ready(Ok(()));
                }
                Ok(n) => {
                    buf.put_slice(&plain[..n]);
                    return Poll::Ready(Ok(()));
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(e) => return Poll::Ready(Err(e)),
            }

            if this.eof {
                // Raw EOF without close_notify: surface as EOF.
                return Poll::Ready(Ok(()));
            }

            // Need more ciphertext.
            let mut cipher = [0u8; 16 * 1024];
            let mut read_buf = ReadBuf::new(&mut cipher);
            match Pin::new(&mut this.inner).poll_read(cx, &mut read_buf) {
                Poll::Ready(Ok(())) => {
                    let data = read_buf.filled();
                    if data.is_empty() {
                        this.eof = true;
                        continue;
                    }
                    let len = data.len();
                    let mut cursor = std::io::Cursor::new(data);
                    while (cursor.position() as usize) < len {
                        if let Err(e) = this.conn.read_tls(&mut cursor) {
                            return Poll::Ready(Err(e));
                        }
                    }
                    if let Err(e) = this.conn.process_new_packets() {
                        return Poll::Ready(Err(std::io::Error::new(
                            std::io::ErrorKind::InvalidData,
                            e.to_string(),
                        )));
                    }
                    // Session data (tickets, key updates) may need to go out.
                    if let Poll::Ready(Err(e)) = this.poll_flush_tls(cx) {
                        return Poll::Ready(Err(e));
                    }
                }
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncWrite for TlsStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        let this = self.get_mut();
        let n = this.conn.writer().write(buf)?;
        // Push records out opportunistically; buffered output is completed
        // by later writes or an explicit flush.
        let _ = this.poll_flush_tls(cx)?;
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        match this.poll_flush_tls(cx) {
            Poll::Ready(Ok(())) => Pin::new(&mut this.inner).poll_flush(cx),
            other => other,
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        this.conn.send_close_notify();
        match this.poll_flush_tls(cx) {
            Poll::Ready(Ok(())) => Pin::new(&mut this.inner).poll_shutdown(cx),
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use osrv_core::config::PemSource;

    #[test]
    fn missing_certificate_file_is_a_tls_error() {
        let tls = TlsConfig {
            cert: PemSource::Path("/nonexistent/cert.pem".to_string()),
            key: PemSource::Path("/nonexistent/key.pem".to_string()),
            passphrase: None,
        };
        let err = build_server_config(&tls, true).unwrap_err();
        assert!(matches!(err, TransportError::Tls(_)));
    }

    #[test]
    fn empty_inline_pem_is_rejected() {
        let tls = TlsConfig {
            cert: PemSource::Inline(String::new()),
            key: PemSource::Inline(String::new()),
            passphrase: None,
        };
        let err = build_server_config(&tls, true).unwrap_err();
        assert!(matches!(err, TransportError::Tls(_)));
    }

    #[test]
    fn passphrase_is_rejected_up_front() {
        // The passphrase check runs before any PEM parsing.
        let tls = TlsConfig {
            cert: PemSource::Inline(String::new()),
            key: PemSource::Inline(String::new()),
            passphrase: Some("secret".to_string()),
        };
        let err = build_server_config(&tls, true).unwrap_err();
        let TransportError::Tls(msg) = err else {
            panic!("expected tls error");
        };
        assert!(msg.contains("passphrase"));
    }
}
