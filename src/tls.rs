//! Server-side TLS collaborator.
//!
//! `rustls::ServerConfig` built from PEM material via `rustls_pemfile`,
//! wrapped by a `tokio_rustls::TlsAcceptor` on the accept side. No root
//! store is configured unless mutual TLS is explicitly enabled — a
//! server-side acceptor has no client certs to trust otherwise.

use std::io;
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::ServerConfig as RustlsServerConfig;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor as TokioRustlsAcceptor;

use crate::config::TlsConfig;

/// Parse PEM-encoded certificate chain and private key bytes into the
/// types `rustls::ServerConfig` expects.
fn load_server_config(tls: &TlsConfig) -> io::Result<RustlsServerConfig> {
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut tls.cert_pem.as_slice())
        .collect::<Result<_, _>>()
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, format!("invalid certificate PEM: {err}")))?;
    if certs.is_empty() {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "no certificates found in TLS config"));
    }

    let key: PrivateKeyDer<'static> = rustls_pemfile::private_key(&mut tls.key_pem.as_slice())
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, format!("invalid private key PEM: {err}")))?
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "no private key found in TLS config"))?;

    let mut config = RustlsServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, format!("invalid TLS certificate/key pair: {err}")))?;
    config.alpn_protocols = vec![b"h2".to_vec()];
    Ok(config)
}

/// Wraps accepted TCP sockets in TLS. Swappable at runtime by
/// `ServerHandle::reload_tls`.
#[derive(Clone)]
pub struct RustlsAcceptor {
    inner: TokioRustlsAcceptor,
}

impl RustlsAcceptor {
    pub fn new(tls: &TlsConfig) -> io::Result<Self> {
        let config = load_server_config(tls)?;
        Ok(Self {
            inner: TokioRustlsAcceptor::from(Arc::new(config)),
        })
    }

    pub async fn accept(&self, stream: TcpStream) -> io::Result<TlsStream<TcpStream>> {
        self.inner.accept(stream).await
    }
}

/// Transport abstraction over a plaintext or TLS-wrapped connection: manual
/// `AsyncRead`/`AsyncWrite` delegation so the connection runtime above it is
/// oblivious to which variant it's driving.
pub enum ServerConnectionStream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl ServerConnectionStream {
    pub fn peer_addr(&self) -> io::Result<std::net::SocketAddr> {
        match self {
            Self::Plain(stream) => stream.peer_addr(),
            Self::Tls(stream) => stream.get_ref().0.peer_addr(),
        }
    }

    /// The client certificate chain presented during the handshake, if
    /// mutual TLS was negotiated.
    pub fn peer_certificate(&self) -> Option<Vec<u8>> {
        match self {
            Self::Plain(_) => None,
            Self::Tls(stream) => stream
                .get_ref()
                .1
                .peer_certificates()
                .and_then(|certs| certs.first())
                .map(|cert| cert.as_ref().to_vec()),
        }
    }
}

impl AsyncRead for ServerConnectionStream {
    fn poll_read(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> std::task::Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(stream) => std::pin::Pin::new(stream).poll_read(cx, buf),
            Self::Tls(stream) => std::pin::Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for ServerConnectionStream {
    fn poll_write(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &[u8],
    ) -> std::task::Poll<io::Result<usize>> {
        match self.get_mut() {
            Self::Plain(stream) => std::pin::Pin::new(stream).poll_write(cx, buf),
            Self::Tls(stream) => std::pin::Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(stream) => std::pin::Pin::new(stream).poll_flush(cx),
            Self::Tls(stream) => std::pin::Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(stream) => std::pin::Pin::new(stream).poll_shutdown(cx),
            Self::Tls(stream) => std::pin::Pin::new(stream).poll_shutdown(cx),
        }
    }
}
