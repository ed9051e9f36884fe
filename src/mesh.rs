//! Mesh provider contract
//!
//! A mesh provider is a factory for endpoints bound to a hostname. An
//! endpoint joins the overlay as an independent node, vends listeners for the
//! node's ports, and reports its join state as a stream of events.

use std::net::SocketAddr;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_rustls::TlsAcceptor;

use crate::model::{Identity, ProxyConfig};

/// Join state reported by an endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointStatus {
    /// Contacting the control plane
    Starting,
    /// A human must visit the auth URL to authorize the node
    NeedsLogin,
    /// Joined; the node has a DNS name
    Running,
}

/// Join-state transition emitted on the endpoint's event stream
#[derive(Debug, Clone)]
pub struct EndpointEvent {
    pub status: EndpointStatus,
    /// Set while awaiting login
    pub auth_url: Option<String>,
    /// Set once running
    pub dns_name: Option<String>,
}

/// Bidirectional stream accepted from a mesh listener
pub trait MeshStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> MeshStream for T {}

/// A listener vended by an endpoint for one proxy port.
///
/// TLS-terminating listeners decrypt with the node certificate before
/// handing the stream to the port worker.
pub enum MeshListener {
    Plain(TcpListener),
    Tls {
        listener: TcpListener,
        acceptor: TlsAcceptor,
    },
}

impl std::fmt::Debug for MeshListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MeshListener::Plain(listener) => {
                f.debug_tuple("Plain").field(listener).finish()
            }
            MeshListener::Tls { listener, .. } => f
                .debug_struct("Tls")
                .field("listener", listener)
                .field("acceptor", &"TlsAcceptor")
                .finish(),
        }
    }
}

impl MeshListener {
    pub async fn accept(&self) -> std::io::Result<(Box<dyn MeshStream>, SocketAddr)> {
        match self {
            MeshListener::Plain(listener) => {
                let (stream, addr) = listener.accept().await?;
                Ok((Box::new(stream), addr))
            }
            MeshListener::Tls { listener, acceptor } => {
                let (stream, addr) = listener.accept().await?;
                let tls_stream = acceptor.accept(stream).await?;
                Ok((Box::new(tls_stream), addr))
            }
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        match self {
            MeshListener::Plain(listener) => listener.local_addr(),
            MeshListener::Tls { listener, .. } => listener.local_addr(),
        }
    }
}

#[async_trait]
pub trait MeshEndpoint: Send + Sync {
    /// Initialize the node asynchronously. Returns once the local process is
    /// accepting control commands, not necessarily once joined.
    async fn start(&self) -> anyhow::Result<()>;

    /// Tear the node down
    async fn close(&self) -> anyhow::Result<()>;

    /// Vend a listener for the proxy port registered under `port_key`.
    /// Honors per-port flags: funnel yields a publicly-exposed listener,
    /// https yields a TLS-terminating one, anything else a plain one.
    async fn listener(&self, port_key: &str) -> anyhow::Result<MeshListener>;

    /// The lazy, single-consumer stream of join-state transitions. Returns
    /// `None` once taken.
    fn take_events(&self) -> Option<mpsc::Receiver<EndpointEvent>>;

    /// Externally-visible URL of the node once known
    fn url(&self) -> Option<String>;

    /// URL a human must visit to authorize the node, while awaiting login
    fn auth_url(&self) -> Option<String>;

    /// Resolve the mesh identity behind an inbound connection. Returns an
    /// empty identity on failure.
    async fn whois(&self, remote: SocketAddr) -> Identity;

    /// Best-effort certificate prefetch so the first TLS request is not
    /// delayed by issuance
    async fn prefetch_tls_certificates(&self);
}

/// Factory for mesh endpoints
#[async_trait]
pub trait MeshProvider: Send + Sync {
    async fn new_endpoint(&self, config: &ProxyConfig) -> anyhow::Result<Box<dyn MeshEndpoint>>;
}
