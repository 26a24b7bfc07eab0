use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use quinn::{ClientConfig, Connection, Endpoint, TransportConfig};
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadHalf, WriteHalf};
use tokio::sync::mpsc::Sender;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::config::Config;
use crate::db::QueueCommand;

/// Name the cluster certificate is issued for.
pub const SERVER_NAME: &str = "jobswarm";
pub const KEEP_ALIVE_SECS: u64 = 120;
const LOCAL_STREAM_CAPACITY: usize = 64 * 1024;

/// Opens bidirectional byte streams to the queue, one per request.
#[async_trait]
pub trait Transport: Send + Sync {
    type Send: AsyncWrite + Unpin + Send + 'static;
    type Recv: AsyncRead + Unpin + Send + 'static;

    async fn open(&self) -> Result<(Self::Send, Self::Recv)>;
}

/// QUIC transport that reconnects lazily when the connection drops.
pub struct QuicTransport {
    endpoint: Endpoint,
    addr: SocketAddr,
    conn: Mutex<Option<Connection>>,
}

impl QuicTransport {
    pub fn new(config: &Config) -> Result<Self> {
        let addr = config
            .server
            .to_socket_addrs()
            .with_context(|| format!("resolving {}", config.server))?
            .next()
            .ok_or_else(|| anyhow!("{} did not resolve to an address", config.server))?;
        Ok(Self {
            endpoint: make_endpoint(config)?,
            addr,
            conn: Mutex::new(None),
        })
    }

    async fn connection(&self) -> Result<Connection> {
        let mut conn = self.conn.lock().await;
        if let Some(c) = conn.as_ref() {
            match c.close_reason() {
                None => return Ok(c.clone()),
                Some(reason) => debug!(%reason, "queue connection closed, reconnecting"),
            }
        }
        let fresh = self
            .endpoint
            .connect(self.addr, SERVER_NAME)?
            .await
            .with_context(|| format!("connecting to queue at {}", self.addr))?;
        *conn = Some(fresh.clone());
        Ok(fresh)
    }
}

#[async_trait]
impl Transport for QuicTransport {
    type Send = quinn::SendStream;
    type Recv = quinn::RecvStream;

    async fn open(&self) -> Result<(Self::Send, Self::Recv)> {
        let conn = self.connection().await?;
        match conn.open_bi().await {
            Ok(streams) => Ok(streams),
            Err(e) => {
                // force a reconnect on the next request
                self.conn.lock().await.take();
                Err(e.into())
            }
        }
    }
}

pub fn transport_config() -> Result<TransportConfig> {
    let mut transport = TransportConfig::default();
    transport.max_idle_timeout(Some(Duration::from_secs(KEEP_ALIVE_SECS).try_into()?));
    transport.keep_alive_interval(Some(Duration::from_secs(KEEP_ALIVE_SECS - 10)));
    Ok(transport)
}

/// Client endpoint that only trusts the cluster certificate.
pub fn make_endpoint(config: &Config) -> Result<Endpoint> {
    let mut endpoint = Endpoint::client("0.0.0.0:0".parse()?)?;
    let mut certs = rustls::RootCertStore::empty();
    certs.add(&config.cert)?;
    let mut client_config = ClientConfig::with_root_certificates(certs);
    client_config.transport_config(Arc::new(transport_config()?));
    endpoint.set_default_client_config(client_config);

    Ok(endpoint)
}

/// In-process transport: every stream is served by the queue handlers of the
/// same process.
#[derive(Clone)]
pub struct LocalTransport {
    queue: Sender<QueueCommand>,
}

impl LocalTransport {
    pub fn new(queue: Sender<QueueCommand>) -> Self {
        Self { queue }
    }
}

#[async_trait]
impl Transport for LocalTransport {
    type Send = WriteHalf<DuplexStream>;
    type Recv = ReadHalf<DuplexStream>;

    async fn open(&self) -> Result<(Self::Send, Self::Recv)> {
        if self.queue.is_closed() {
            return Err(anyhow!("local queue has shut down"));
        }
        let (client, server) = tokio::io::duplex(LOCAL_STREAM_CAPACITY);
        let (server_recv, server_send) = tokio::io::split(server);
        let queue = self.queue.clone();
        tokio::spawn(async move {
            if let Err(e) = crate::server::handle_bi(server_send, server_recv, queue).await {
                warn!(error = %e, "local stream failed");
            }
        });
        let (recv, send) = tokio::io::split(client);
        Ok((send, recv))
    }
}
