// QUIC transport configuration and primitives for the ingestion server.
// Vehicles keep one long-lived connection each, so the transport carries
// keep-alive and idle-timeout settings instead of stream-count tuning.
use anyhow::{Context, Result, anyhow};
use quinn::{ClientConfig, Connection, Endpoint, RecvStream, SendStream, ServerConfig, VarInt};
use rustls::pki_types::CertificateDer;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

/// Transport-level configuration defaults.
///
/// ```
/// use fleetline_transport::TransportConfig;
///
/// let config = TransportConfig::default();
/// assert!(config.keep_alive_interval.as_secs() < config.max_idle_timeout.as_secs());
/// ```
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Interval between QUIC keep-alive pings. Serves as the connection
    /// heartbeat; vehicles do not send an application-level ping.
    pub keep_alive_interval: Duration,
    /// Idle deadline after which the connection is presumed dead.
    pub max_idle_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            keep_alive_interval: Duration::from_secs(15),
            max_idle_timeout: Duration::from_secs(60),
        }
    }
}

impl TransportConfig {
    fn quinn_transport_config(&self) -> Result<quinn::TransportConfig> {
        let mut config = quinn::TransportConfig::default();
        config.keep_alive_interval(Some(self.keep_alive_interval));
        config.max_idle_timeout(Some(
            self.max_idle_timeout
                .try_into()
                .context("idle timeout out of range")?,
        ));
        Ok(config)
    }
}

/// Stable connection identifier used for tracing/logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub u64);

/// QUIC server endpoint wrapper.
#[derive(Debug)]
pub struct QuicServer {
    endpoint: Endpoint,
}

impl QuicServer {
    pub fn bind(
        addr: SocketAddr,
        mut server_config: ServerConfig,
        transport: TransportConfig,
    ) -> Result<Self> {
        let quinn_transport = transport.quinn_transport_config()?;
        server_config.transport_config(Arc::new(quinn_transport));
        let endpoint = Endpoint::server(server_config, addr).context("bind QUIC server")?;
        Ok(Self { endpoint })
    }

    /// Accept the next connection. `Ok(None)` means the endpoint has been
    /// closed; a handshake failure is an `Err` and the endpoint stays up.
    pub async fn accept(&self) -> Result<Option<QuicConnection>> {
        let Some(connecting) = self.endpoint.accept().await else {
            return Ok(None);
        };
        let connection = connecting.await.context("accept QUIC connection")?;
        Ok(Some(QuicConnection::new(connection)))
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.endpoint
            .local_addr()
            .context("read QUIC local address")
    }

    /// Stop accepting and tear down all connections with the given reason.
    pub fn close(&self, reason: &[u8]) {
        self.endpoint.close(VarInt::from_u32(0), reason);
    }
}

/// QUIC client endpoint wrapper, used by tests and fleet simulators.
#[derive(Debug)]
pub struct QuicClient {
    endpoint: Endpoint,
}

impl QuicClient {
    pub fn bind(
        addr: SocketAddr,
        mut client_config: ClientConfig,
        transport: TransportConfig,
    ) -> Result<Self> {
        let quinn_transport = transport.quinn_transport_config()?;
        client_config.transport_config(Arc::new(quinn_transport));
        let mut endpoint = Endpoint::client(addr).context("bind QUIC client")?;
        endpoint.set_default_client_config(client_config);
        Ok(Self { endpoint })
    }

    pub async fn connect(&self, addr: SocketAddr, server_name: &str) -> Result<QuicConnection> {
        let connecting = self
            .endpoint
            .connect(addr, server_name)
            .context("initiate QUIC connection")?;
        let connection = connecting.await.context("establish QUIC connection")?;
        Ok(QuicConnection::new(connection))
    }
}

/// Active QUIC connection wrapper with convenience helpers.
#[derive(Debug, Clone)]
pub struct QuicConnection {
    inner: Connection,
    id: ConnectionId,
}

impl QuicConnection {
    fn new(connection: Connection) -> Self {
        let id = ConnectionId(u64::try_from(connection.stable_id()).expect("stable id fits u64"));
        Self {
            inner: connection,
            id,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.inner.remote_address()
    }

    /// Peer certificate chain presented during the TLS handshake, leaf
    /// first. `None` when the peer presented no certificate.
    pub fn peer_certificates(&self) -> Option<Vec<CertificateDer<'static>>> {
        let identity = self.inner.peer_identity()?;
        identity
            .downcast_ref::<Vec<CertificateDer<'static>>>()
            .cloned()
    }

    pub async fn open_bi(&self) -> Result<(SendStream, RecvStream)> {
        self.inner.open_bi().await.context("open bidi stream")
    }

    pub async fn accept_bi(&self) -> Result<(SendStream, RecvStream)> {
        self.inner.accept_bi().await.context("accept bidi stream")
    }

    /// Close immediately. Pending acks are lost; callers drain first.
    pub fn close(&self, reason: &[u8]) {
        self.inner.close(VarInt::from_u32(0), reason);
    }

    /// Resolves when the connection is fully closed.
    pub async fn closed(&self) {
        let _ = self.inner.closed().await;
    }

    pub fn stats(&self) -> quinn::ConnectionStats {
        self.inner.stats()
    }
}
