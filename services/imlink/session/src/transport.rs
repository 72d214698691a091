//! TCP and TLS transport for client sessions.
//!
//! A [`Transport`] opens a [`Connection`]; the connection can be upgraded to
//! TLS with [`Connection::start_secure`] and is then split into a writer the
//! session actor keeps and a channel of inbound [`TransportEvent`]s fed by a
//! reader task.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::error::TransportError;

/// Read chunk size for the reader task
pub const READ_CHUNK_SIZE: usize = 16 * 1024;

/// Inbound queue depth between the reader task and the session
pub const INBOUND_QUEUE_DEPTH: usize = 64;

/// Unified stream type that can be either plain TCP or TLS
pub enum IoStream {
    /// Plain TCP stream
    Plain(TcpStream),
    /// TLS client stream
    #[cfg(feature = "tls")]
    TlsClient(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl std::fmt::Debug for IoStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IoStream::Plain(_) => f.write_str("IoStream::Plain"),
            #[cfg(feature = "tls")]
            IoStream::TlsClient(_) => f.write_str("IoStream::TlsClient"),
        }
    }
}

impl AsyncRead for IoStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            IoStream::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            #[cfg(feature = "tls")]
            IoStream::TlsClient(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for IoStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<Result<usize, std::io::Error>> {
        match self.get_mut() {
            IoStream::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            #[cfg(feature = "tls")]
            IoStream::TlsClient(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), std::io::Error>> {
        match self.get_mut() {
            IoStream::Plain(stream) => Pin::new(stream).poll_flush(cx),
            #[cfg(feature = "tls")]
            IoStream::TlsClient(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Result<(), std::io::Error>> {
        match self.get_mut() {
            IoStream::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            #[cfg(feature = "tls")]
            IoStream::TlsClient(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
        }
    }
}

impl IoStream {
    /// Get the peer address of the underlying stream
    pub fn peer_addr(&self) -> std::io::Result<SocketAddr> {
        match self {
            IoStream::Plain(stream) => stream.peer_addr(),
            #[cfg(feature = "tls")]
            IoStream::TlsClient(stream) => stream.get_ref().0.peer_addr(),
        }
    }
}

/// TLS parameters for one session
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsSettings {
    /// SNI name; the connect host when unset
    pub server_name: Option<String>,
    /// PEM bundle of trusted CAs
    pub ca_pem: Option<String>,
    /// PEM client certificate chain for mutual TLS
    pub cert_pem: Option<String>,
    /// PEM PKCS#8 client key for mutual TLS
    pub key_pem: Option<String>,
}

/// What the reader task reports
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Bytes in arrival order
    Data(Bytes),
    /// Stream ended; `Some` carries the read error
    Closed(Option<String>),
}

/// Opens connections
#[async_trait]
pub trait Transport: Send + Sync + std::fmt::Debug {
    /// Connect to `host:port`
    async fn connect(&self, host: &str, port: u16) -> Result<Box<dyn Connection>, TransportError>;
}

/// An open, unsplit connection
#[async_trait]
pub trait Connection: Send + std::fmt::Debug {
    /// Upgrade to TLS
    async fn start_secure(
        self: Box<Self>,
        settings: &TlsSettings,
    ) -> Result<Box<dyn Connection>, TransportError>;

    /// Remote address
    fn peer_addr(&self) -> Option<SocketAddr>;

    /// Start the reader task and hand back the write side
    fn split(self: Box<Self>) -> (Box<dyn ConnectionWriter>, mpsc::Receiver<TransportEvent>);
}

/// Write side of a split connection
#[async_trait]
pub trait ConnectionWriter: Send + std::fmt::Debug {
    /// Write and flush one encoded frame
    async fn send(&mut self, data: &[u8]) -> Result<(), TransportError>;

    /// Shut the stream down and stop the reader
    async fn close(&mut self);
}

/// `tokio::net` transport
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpTransport;

#[async_trait]
impl Transport for TcpTransport {
    async fn connect(&self, host: &str, port: u16) -> Result<Box<dyn Connection>, TransportError> {
        let stream = TcpStream::connect((host, port))
            .await
            .map_err(|e| TransportError::Connect {
                addr: format!("{host}:{port}"),
                reason: e.to_string(),
            })?;
        let _ = stream.set_nodelay(true);
        debug!(host, port, "tcp connected");
        Ok(Box::new(TcpConnection {
            stream: IoStream::Plain(stream),
            host: host.to_string(),
        }))
    }
}

/// A connection over [`IoStream`]
#[derive(Debug)]
pub struct TcpConnection {
    stream: IoStream,
    host: String,
}

impl TcpConnection {
    /// Wrap an already connected stream
    pub fn new(stream: IoStream, host: impl Into<String>) -> Self {
        Self {
            stream,
            host: host.into(),
        }
    }
}

#[async_trait]
impl Connection for TcpConnection {
    #[cfg(feature = "tls")]
    async fn start_secure(
        self: Box<Self>,
        settings: &TlsSettings,
    ) -> Result<Box<dyn Connection>, TransportError> {
        let TcpConnection { stream, host } = *self;
        let IoStream::Plain(tcp) = stream else {
            return Err(TransportError::Tls("connection is already secured".into()));
        };
        let sni = settings.server_name.clone().unwrap_or_else(|| host.clone());
        let config =
            tls::make_client_config(settings).map_err(|e| TransportError::Tls(format!("{e:#}")))?;
        let stream = tls::connect_tls(config, tcp, &sni)
            .await
            .map_err(|e| TransportError::Tls(format!("{e:#}")))?;
        Ok(Box::new(TcpConnection { stream, host }))
    }

    #[cfg(not(feature = "tls"))]
    async fn start_secure(
        self: Box<Self>,
        _settings: &TlsSettings,
    ) -> Result<Box<dyn Connection>, TransportError> {
        Err(TransportError::TlsUnavailable)
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.stream.peer_addr().ok()
    }

    fn split(self: Box<Self>) -> (Box<dyn ConnectionWriter>, mpsc::Receiver<TransportEvent>) {
        let (mut read_half, write_half) = tokio::io::split(self.stream);
        let (tx, rx) = mpsc::channel(INBOUND_QUEUE_DEPTH);

        let reader = tokio::spawn(async move {
            let mut buf = BytesMut::with_capacity(READ_CHUNK_SIZE);
            loop {
                buf.reserve(READ_CHUNK_SIZE);
                match read_half.read_buf(&mut buf).await {
                    Ok(0) => {
                        let _ = tx.send(TransportEvent::Closed(None)).await;
                        break;
                    }
                    Ok(n) => {
                        trace!(bytes = n, "transport read");
                        if tx.send(TransportEvent::Data(buf.split().freeze())).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        let _ = tx.send(TransportEvent::Closed(Some(e.to_string()))).await;
                        break;
                    }
                }
            }
        });

        let writer = TcpWriter {
            half: write_half,
            reader,
        };
        (Box::new(writer), rx)
    }
}

struct TcpWriter {
    half: WriteHalf<IoStream>,
    reader: JoinHandle<()>,
}

impl std::fmt::Debug for TcpWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpWriter").finish_non_exhaustive()
    }
}

#[async_trait]
impl ConnectionWriter for TcpWriter {
    async fn send(&mut self, data: &[u8]) -> Result<(), TransportError> {
        self.half.write_all(data).await?;
        self.half.flush().await?;
        Ok(())
    }

    async fn close(&mut self) {
        let _ = self.half.shutdown().await;
        self.reader.abort();
    }
}

impl Drop for TcpWriter {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// Client-side TLS for session connections
#[cfg(feature = "tls")]
pub mod tls {
    use super::*;
    use anyhow::{Context as AnyhowContext, Result};
    use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
    use rustls::{ClientConfig, RootCertStore};
    use std::sync::Arc;
    use tokio_rustls::TlsConnector;
    use tracing::info;

    /// ALPN protocol id
    pub const ALPN_PROTOCOL: &[u8] = b"imlink/1";

    /// Build a client configuration from PEM material; client auth is used
    /// when both a certificate chain and a key are supplied
    pub fn make_client_config(settings: &TlsSettings) -> Result<ClientConfig> {
        let _ = rustls::crypto::ring::default_provider().install_default();

        let ca_pem = settings
            .ca_pem
            .as_deref()
            .context("No CA bundle configured for TLS")?;
        let mut roots = RootCertStore::empty();
        let ca_results: Result<Vec<_>, _> = rustls_pemfile::certs(&mut ca_pem.as_bytes()).collect();
        let ca_certs = ca_results.context("Failed to parse CA certificates")?;
        if ca_certs.is_empty() {
            anyhow::bail!("No certificates found in CA bundle");
        }
        for ca_cert in ca_certs {
            roots
                .add(CertificateDer::from(ca_cert))
                .context("Failed to add CA certificate to root store")?;
        }

        let builder = ClientConfig::builder().with_root_certificates(roots);
        let mut config = match (&settings.cert_pem, &settings.key_pem) {
            (Some(cert_pem), Some(key_pem)) => {
                let cert_results: Result<Vec<_>, _> =
                    rustls_pemfile::certs(&mut cert_pem.as_bytes()).collect();
                let certs = cert_results.context("Failed to parse certificate chain")?;
                if certs.is_empty() {
                    anyhow::bail!("No certificates found in certificate chain");
                }
                let key_results: Result<Vec<_>, _> =
                    rustls_pemfile::pkcs8_private_keys(&mut key_pem.as_bytes()).collect();
                let mut keys = key_results.context("Failed to parse private key")?;
                if keys.is_empty() {
                    anyhow::bail!("No private key found");
                }
                builder
                    .with_client_auth_cert(certs, PrivateKeyDer::from(keys.remove(0)))
                    .context("Failed to configure client certificate")?
            }
            _ => builder.with_no_client_auth(),
        };

        config.alpn_protocols = vec![ALPN_PROTOCOL.to_vec()];
        info!(mutual = settings.cert_pem.is_some(), "TLS client configuration created");
        Ok(config)
    }

    /// Run the client handshake over an open TCP stream
    pub async fn connect_tls(config: ClientConfig, tcp: TcpStream, sni: &str) -> Result<IoStream> {
        let peer = tcp.peer_addr().ok();
        debug!(?peer, sni, "starting TLS handshake");

        let connector = TlsConnector::from(Arc::new(config));
        let server_name = ServerName::try_from(sni.to_owned())
            .map_err(|_| anyhow::anyhow!("Invalid server name: {}", sni))?;
        let stream = connector
            .connect(server_name, tcp)
            .await
            .with_context(|| format!("TLS handshake failed with {:?} (SNI: {})", peer, sni))?;

        debug!(?peer, "TLS established");
        Ok(IoStream::TlsClient(Box::new(stream)))
    }
}
