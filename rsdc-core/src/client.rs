//! The transport seams and core configuration. Regardless of the async
//! runtime used, all transports plug in through the same [`Connection`] and
//! [`Connector`] traits, and tests script conversations with in-memory
//! implementations.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::connstr::{ConnectionString, CredentialsProvider, StaticCredentials};
use crate::error::Result;
use crate::pool::PoolConfig;
use crate::protocol::{Header, Packet, ServerFeature};

/// A connection is an async byte stream to one service endpoint, which
/// requires a concrete implementation using an underlying async runtime
/// (e.g. tokio). Clones share the stream so one task can read while another
/// writes.
#[async_trait]
pub trait Connection: Clone + Send + Sync + 'static {
    /// Read exactly `buf.len()` bytes.
    async fn read_exact(&mut self, buf: &mut [u8]) -> Result<()>;

    /// Write an entire buffer to the stream.
    async fn write_all(&mut self, data: &[u8]) -> Result<()>;

    /// Close the stream. Reads in flight fail afterwards.
    async fn shutdown(&mut self);

    fn local_addr(&self) -> Option<String> {
        None
    }

    fn peer_addr(&self) -> Option<String> {
        None
    }

    /// Read one response frame. It is most likely unnecessary to implement
    /// this yourself.
    async fn read_packet(&mut self) -> Result<Packet> {
        let mut buf = [0_u8; 24];
        self.read_exact(&mut buf).await?;
        let header = Header::read_response(&buf)?;
        let mut body = vec![0_u8; header.body_len as usize];
        if !body.is_empty() {
            self.read_exact(&mut body).await?;
        }
        Ok(header.read_packet(&body)?)
    }

    /// Write one request frame. It is most likely unnecessary to implement
    /// this yourself.
    async fn write_packet(&mut self, packet: Packet) -> Result<()> {
        let bytes: Vec<u8> = packet.into();
        self.write_all(&bytes[..]).await
    }
}

/// Dials new connections. The TLS handshake hook lives behind this seam: a
/// connector decides whether the stream it hands back is plain or encrypted.
#[async_trait]
pub trait Connector: Clone + Send + Sync + 'static {
    type Conn: Connection;

    /// Connect to a `host:port` address.
    async fn connect(&self, addr: &str) -> Result<Self::Conn>;
}

/// All the proposable features, in the order they are offered to servers.
pub fn all_features() -> Vec<ServerFeature> {
    vec![
        ServerFeature::Tls,
        ServerFeature::TcpNodelay,
        ServerFeature::MutationSeqno,
        ServerFeature::Xattr,
        ServerFeature::Xerror,
        ServerFeature::SelectBucket,
        ServerFeature::Snappy,
        ServerFeature::Json,
        ServerFeature::Duplex,
        ServerFeature::UnorderedExecution,
        ServerFeature::AltRequests,
        ServerFeature::SyncReplication,
        ServerFeature::Collections,
        ServerFeature::Vattr,
    ]
}

/// Set configuration values for the core.
#[derive(Debug, Clone)]
pub struct CoreConfig {
    /// Seed `host:port` addresses to bootstrap the topology from.
    pub seeds: Vec<String>,
    /// The bucket data channels select after authentication.
    pub bucket: Option<String>,
    pub credentials: Arc<dyn CredentialsProvider>,
    pub tls: bool,
    /// Features proposed during HELLO negotiation.
    pub features: Vec<ServerFeature>,
    /// The name this client advertises in HELLO, visible in server logs.
    pub connection_name: String,
    /// Budget for the whole bootstrap chain of a new channel.
    pub bootstrap_timeout: Duration,
    /// Default per-request deadline when the request does not carry one.
    pub request_timeout: Duration,
    /// How long shutdown waits for in-flight requests before force-closing.
    pub shutdown_grace: Duration,
    /// The error map version the client asks for.
    pub error_map_version: u16,
    pub pool: PoolConfig,
}

impl CoreConfig {
    /// Build a config from a connection string and credentials.
    pub fn from_connstr(input: &str, username: &str, password: &str) -> Result<Self> {
        let parsed = ConnectionString::parse(input)?;
        Ok(Self {
            seeds: parsed.seed_addresses(),
            bucket: parsed.bucket.clone(),
            tls: parsed.tls(),
            credentials: Arc::new(StaticCredentials::new(username, password)),
            ..Self::default()
        })
    }

    pub fn with_bucket<B: Into<String>>(mut self, bucket: B) -> Self {
        self.bucket = Some(bucket.into());
        self
    }

    pub fn with_pool(mut self, pool: PoolConfig) -> Self {
        self.pool = pool;
        self
    }

    pub fn with_bootstrap_timeout(mut self, timeout: Duration) -> Self {
        self.bootstrap_timeout = timeout;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            seeds: vec![],
            bucket: None,
            credentials: Arc::new(StaticCredentials::new("", "")),
            tls: false,
            features: all_features(),
            connection_name: format!("rsdc/{}", env!("CARGO_PKG_VERSION")),
            bootstrap_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_millis(2500),
            shutdown_grace: Duration::from_secs(5),
            error_map_version: 2,
            pool: PoolConfig::default(),
        }
    }
}
