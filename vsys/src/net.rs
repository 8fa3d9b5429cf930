//! Network virtual table for vsys
//!
//! Outbound connections and name resolution are checked against
//! `NetConnect` rules keyed by host and port before a backend sees them.

use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream};
use tokio::sync::mpsc;
use url::Url;

use crate::error::{VsysError, VsysResult};
use crate::gate::PermissionGate;
use crate::permissions::{CapabilityKind, CapabilityRequest, Domain};

/// Bidirectional byte stream returned by [`NetBackend::connect`]
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

pub type NetStream = Box<dyn AsyncStream>;

/// Buffer size of each direction of a [`MockNet`] connection
const MOCK_BUFFER: usize = 64 * 1024;

#[async_trait]
pub trait NetBackend: Send + Sync {
    async fn resolve(&self, host: &str, port: u16) -> VsysResult<Vec<SocketAddr>>;
    async fn connect(&self, host: &str, port: u16) -> VsysResult<NetStream>;
}

/// Host networking through tokio
#[derive(Debug, Clone, Copy, Default)]
pub struct RealNet;

#[async_trait]
impl NetBackend for RealNet {
    async fn resolve(&self, host: &str, port: u16) -> VsysResult<Vec<SocketAddr>> {
        let addrs = tokio::net::lookup_host((host, port))
            .await
            .map_err(|e| VsysError::io(Domain::Net, e))?;
        Ok(addrs.collect())
    }

    async fn connect(&self, host: &str, port: u16) -> VsysResult<NetStream> {
        let stream = tokio::net::TcpStream::connect((host, port))
            .await
            .map_err(|e| VsysError::io(Domain::Net, e))?;
        Ok(Box::new(stream))
    }
}

/// In-process network for tests.
///
/// Hosts resolve to the addresses registered with [`MockNet::with_host`].
/// Connecting to an endpoint registered with [`MockNet::listen`] hands the
/// caller one end of an in-memory duplex pipe and delivers the other end to
/// the listener.
#[derive(Debug, Default)]
pub struct MockNet {
    hosts: Mutex<HashMap<String, Vec<IpAddr>>>,
    listeners: Mutex<HashMap<(String, u16), mpsc::UnboundedSender<DuplexStream>>>,
}

impl MockNet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_host(self, host: &str, addrs: impl IntoIterator<Item = IpAddr>) -> Self {
        self.hosts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(host.to_ascii_lowercase(), addrs.into_iter().collect());
        self
    }

    /// Accept connections to `host:port`
    pub fn listen(&self, host: &str, port: u16) -> mpsc::UnboundedReceiver<DuplexStream> {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert((host.to_ascii_lowercase(), port), sender);
        receiver
    }
}

fn refused(host: &str, port: u16) -> VsysError {
    VsysError::io(
        Domain::Net,
        io::Error::new(
            io::ErrorKind::ConnectionRefused,
            format!("connection refused: {host}:{port}"),
        ),
    )
}

#[async_trait]
impl NetBackend for MockNet {
    async fn resolve(&self, host: &str, port: u16) -> VsysResult<Vec<SocketAddr>> {
        let hosts = self.hosts.lock().unwrap_or_else(|e| e.into_inner());
        match hosts.get(&host.to_ascii_lowercase()) {
            Some(addrs) => Ok(addrs.iter().map(|ip| SocketAddr::new(*ip, port)).collect()),
            None => Err(VsysError::NotFound(format!("host {host}"))),
        }
    }

    async fn connect(&self, host: &str, port: u16) -> VsysResult<NetStream> {
        let mut listeners = self.listeners.lock().unwrap_or_else(|e| e.into_inner());
        let key = (host.to_ascii_lowercase(), port);
        let Some(listener) = listeners.get(&key) else {
            return Err(refused(host, port));
        };
        let (local, remote) = tokio::io::duplex(MOCK_BUFFER);
        if listener.send(remote).is_err() {
            listeners.remove(&key);
            return Err(refused(host, port));
        }
        Ok(Box::new(local))
    }
}

/// Backend that refuses every operation
#[derive(Debug, Clone, Copy, Default)]
pub struct DeniedNet;

#[async_trait]
impl NetBackend for DeniedNet {
    async fn resolve(&self, host: &str, port: u16) -> VsysResult<Vec<SocketAddr>> {
        Err(VsysError::denied(CapabilityKind::NetConnect, format!("{host}:{port}")))
    }

    async fn connect(&self, host: &str, port: u16) -> VsysResult<NetStream> {
        Err(VsysError::denied(CapabilityKind::NetConnect, format!("{host}:{port}")))
    }
}

#[derive(Clone)]
pub struct NetVTable {
    backend: Arc<dyn NetBackend>,
    gate: PermissionGate,
}

impl std::fmt::Debug for NetVTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetVTable")
            .field("context", self.gate.context())
            .finish_non_exhaustive()
    }
}

impl NetVTable {
    pub fn new(backend: Arc<dyn NetBackend>, gate: PermissionGate) -> Self {
        Self { backend, gate }
    }

    pub fn with_gate(&self, gate: PermissionGate) -> Self {
        Self {
            backend: Arc::clone(&self.backend),
            gate,
        }
    }

    pub fn gate(&self) -> &PermissionGate {
        &self.gate
    }

    pub fn same_backend(&self, other: &NetVTable) -> bool {
        Arc::ptr_eq(&self.backend, &other.backend)
    }

    pub async fn resolve(&self, host: &str, port: u16) -> VsysResult<Vec<SocketAddr>> {
        self.gate
            .authorize(&CapabilityRequest::net(host, Some(port)))
            .await?;
        tracing::debug!(host, port, "resolving");
        self.backend.resolve(host, port).await
    }

    pub async fn connect(&self, host: &str, port: u16) -> VsysResult<NetStream> {
        self.gate
            .authorize(&CapabilityRequest::net(host, Some(port)))
            .await?;
        tracing::debug!(host, port, "connecting");
        self.backend.connect(host, port).await
    }

    /// Check that `url` may be fetched and return its host and effective port
    pub async fn ensure_url_access(&self, url: &str) -> VsysResult<(String, u16)> {
        let (host, port) = url_endpoint(url)?;
        self.gate
            .authorize(&CapabilityRequest::net(&host, Some(port)))
            .await?;
        Ok((host, port))
    }

    pub fn ensure_url_access_sync(&self, url: &str) -> VsysResult<(String, u16)> {
        let (host, port) = url_endpoint(url)?;
        self.gate
            .authorize_sync(&CapabilityRequest::net(&host, Some(port)))?;
        Ok((host, port))
    }
}

/// Host and port an URL connects to; ports default by scheme
pub fn url_endpoint(url: &str) -> VsysResult<(String, u16)> {
    let parsed =
        Url::parse(url).map_err(|e| VsysError::InvalidArgument(format!("{url}: {e}")))?;
    let host = match parsed.host() {
        Some(url::Host::Domain(domain)) => domain.to_ascii_lowercase(),
        Some(url::Host::Ipv4(addr)) => addr.to_string(),
        Some(url::Host::Ipv6(addr)) => addr.to_string(),
        None => {
            return Err(VsysError::InvalidArgument(format!("{url}: missing host")));
        }
    };
    let port = parsed.port_or_known_default().ok_or_else(|| {
        VsysError::NotSupported(format!("{} URLs", parsed.scheme()))
    })?;
    Ok((host, port))
}
