//! Tokio transports for the rsdc core. [`TcpConnector`] dials plain TCP,
//! [`TlsConnector`] wraps the stream with rustls; both hand back connections
//! whose clones share the stream so the demultiplexer can read while
//! dispatchers write. For example:
//!
//! ```ignore
//! use rsdc_tokio::{Core, CoreConfig, TcpConnector};
//! use rsdc_core::compress::SnappyCompressor;
//! use rsdc_core::events::NullEventBus;
//! use std::sync::Arc;
//!
//! let config = CoreConfig::from_connstr("couchbase://localhost/travel", "app", "pw")?;
//! let core = Core::new(config, TcpConnector, SnappyCompressor::default(), Arc::new(NullEventBus));
//! let doc = core.get("airline_10").await?;
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::pki_types::ServerName;

use rsdc_core::client::{Connection, Connector};
use rsdc_core::error::{Error, ErrorKind, Result};

pub use rsdc_core::client::CoreConfig;
#[cfg(feature = "snappy")]
pub use rsdc_core::compress::SnappyCompressor;
pub use rsdc_core::compress::{Compressor, NoCompressor};

/// A core wired to the plain TCP transport.
pub type Core<P> = rsdc_core::dispatcher::Core<TcpConnector, P>;
/// A core wired to the TLS transport.
pub type TlsCore<P> = rsdc_core::dispatcher::Core<TlsConnector, P>;

/// A TokioConnection uses the tokio runtime to talk to one service endpoint
/// over TCP. Reader and writer halves carry separate locks so reads do not
/// starve writes.
#[derive(Debug, Clone)]
pub struct TokioConnection {
    reader: Arc<Mutex<OwnedReadHalf>>,
    writer: Arc<Mutex<OwnedWriteHalf>>,
    local: Option<String>,
    peer: Option<String>,
}

#[async_trait]
impl Connection for TokioConnection {
    async fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        let mut reader = self.reader.lock().await;
        reader.read_exact(buf).await?;
        Ok(())
    }

    async fn write_all(&mut self, data: &[u8]) -> Result<()> {
        let mut writer = self.writer.lock().await;
        writer.write_all(data).await?;
        Ok(())
    }

    async fn shutdown(&mut self) {
        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
    }

    fn local_addr(&self) -> Option<String> {
        self.local.clone()
    }

    fn peer_addr(&self) -> Option<String> {
        self.peer.clone()
    }
}

/// Dials plain TCP connections with nodelay set, the transport for
/// `couchbase://` connection strings.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpConnector;

#[async_trait]
impl Connector for TcpConnector {
    type Conn = TokioConnection;

    async fn connect(&self, addr: &str) -> Result<TokioConnection> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let local = stream.local_addr().ok().map(|a| a.to_string());
        let peer = stream.peer_addr().ok().map(|a| a.to_string());
        let (reader, writer) = stream.into_split();
        Ok(TokioConnection {
            reader: Arc::new(Mutex::new(reader)),
            writer: Arc::new(Mutex::new(writer)),
            local,
            peer,
        })
    }
}

/// A connection running over rustls on top of TCP.
#[derive(Debug, Clone)]
pub struct TlsConnection {
    reader: Arc<Mutex<ReadHalf<TlsStream<TcpStream>>>>,
    writer: Arc<Mutex<WriteHalf<TlsStream<TcpStream>>>>,
    local: Option<String>,
    peer: Option<String>,
}

#[async_trait]
impl Connection for TlsConnection {
    async fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        let mut reader = self.reader.lock().await;
        reader.read_exact(buf).await?;
        Ok(())
    }

    async fn write_all(&mut self, data: &[u8]) -> Result<()> {
        let mut writer = self.writer.lock().await;
        writer.write_all(data).await?;
        Ok(())
    }

    async fn shutdown(&mut self) {
        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
    }

    fn local_addr(&self) -> Option<String> {
        self.local.clone()
    }

    fn peer_addr(&self) -> Option<String> {
        self.peer.clone()
    }
}

/// The TLS handshake hook for `couchbases://` connection strings. Trust
/// roots, client certificates and verifier policy are whatever the provided
/// rustls config says; this connector only performs the handshake.
#[derive(Clone)]
pub struct TlsConnector {
    inner: tokio_rustls::TlsConnector,
}

impl TlsConnector {
    pub fn new(config: Arc<tokio_rustls::rustls::ClientConfig>) -> Self {
        Self {
            inner: tokio_rustls::TlsConnector::from(config),
        }
    }
}

#[async_trait]
impl Connector for TlsConnector {
    type Conn = TlsConnection;

    async fn connect(&self, addr: &str) -> Result<TlsConnection> {
        let host = addr.rsplit_once(':').map(|(host, _)| host).unwrap_or(addr);
        let server_name = ServerName::try_from(host.to_string()).map_err(|_| {
            Error::new(ErrorKind::InvalidArgument(format!(
                "not a valid TLS server name: {}",
                host
            )))
        })?;

        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let local = stream.local_addr().ok().map(|a| a.to_string());
        let peer = stream.peer_addr().ok().map(|a| a.to_string());
        let stream = self.inner.connect(server_name, stream).await?;
        let (reader, writer) = tokio::io::split(stream);
        Ok(TlsConnection {
            reader: Arc::new(Mutex::new(reader)),
            writer: Arc::new(Mutex::new(writer)),
            local,
            peer,
        })
    }
}
