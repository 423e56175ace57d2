//! Socket and transport seams of the tunnel client.
//!
//! The encrypted multiplexed transport and the HTTP-style exchange it carries
//! are external collaborators: this module only defines the contract the
//! client relies on ([`Transport`], [`TransportStream`], [`Connector`]) plus
//! the raw datagram socket layer beneath it ([`PacketSocket`], [`Dialer`],
//! [`BoundSocket`]).

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tunnel_wire::Headers;

use crate::error::TransportError;

/// Default ALPN negotiated when none is configured
pub const DEFAULT_ALPN: &str = "h3";
/// Default per-stream receive window (8 MiB)
pub const DEFAULT_STREAM_RECEIVE_WINDOW: u64 = 8 * 1024 * 1024;
/// Default connection receive window (20 MiB)
pub const DEFAULT_CONN_RECEIVE_WINDOW: u64 = 20 * 1024 * 1024;
/// Default idle timeout
pub const DEFAULT_MAX_IDLE_TIMEOUT: Duration = Duration::from_secs(30);
/// Default keep-alive period
pub const DEFAULT_KEEP_ALIVE_PERIOD: Duration = Duration::from_secs(10);

/// TLS and transport parameters handed to the [`Connector`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportParams {
    /// TLS server name (SNI)
    pub server_name: String,
    /// ALPN protocols; [`DEFAULT_ALPN`] is used when empty
    pub alpn: Vec<String>,
    /// Skip certificate verification
    pub insecure: bool,
    /// Idle timeout
    pub max_idle_timeout: Duration,
    /// Keep-alive period
    pub keep_alive_period: Duration,
    /// Per-stream receive window in bytes
    pub stream_receive_window: u64,
    /// Connection receive window in bytes
    pub conn_receive_window: u64,
    /// Negotiate unreliable messages
    pub enable_datagrams: bool,
}

impl Default for TransportParams {
    fn default() -> Self {
        Self {
            server_name: String::new(),
            alpn: Vec::new(),
            insecure: false,
            max_idle_timeout: DEFAULT_MAX_IDLE_TIMEOUT,
            keep_alive_period: DEFAULT_KEEP_ALIVE_PERIOD,
            stream_receive_window: DEFAULT_STREAM_RECEIVE_WINDOW,
            conn_receive_window: DEFAULT_CONN_RECEIVE_WINDOW,
            enable_datagrams: true,
        }
    }
}

impl TransportParams {
    /// Fill in the protocol identifier when none is set
    pub fn with_default_alpn(mut self) -> Self {
        if self.alpn.is_empty() {
            self.alpn = vec![DEFAULT_ALPN.to_string()];
        }
        self
    }
}

/// Congestion strategy installed into the transport after authentication
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CongestionControl {
    /// Send at a fixed negotiated rate regardless of loss
    RatePaced {
        /// Send rate in bits/second
        bps: u64,
        /// Emit controller diagnostics
        debug: bool,
    },
    /// Infer available capacity from loss and delay feedback
    AdaptiveLoss {
        /// Initial congestion window override in packets
        initial_window: Option<usize>,
    },
}

/// Request sent through the transport's request/response exchange
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    /// Request method
    pub method: String,
    /// Virtual host
    pub host: String,
    /// Request path
    pub path: String,
    /// Header fields
    pub headers: Headers,
}

/// Response read back from the request/response exchange
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    /// Status code
    pub status: u16,
    /// Header fields
    pub headers: Headers,
}

/// Unreliable datagram socket beneath the transport
#[async_trait]
pub trait PacketSocket: Send + Sync {
    /// Send one datagram to `target`; returns the payload length written
    async fn send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize>;
    /// Receive one datagram into `buf`
    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)>;
    /// Local address of the socket
    fn local_addr(&self) -> io::Result<SocketAddr>;
    /// Close the socket; pending and future operations fail
    fn close(&self);
}

/// Produces datagram sockets bound toward a server address
#[async_trait]
pub trait Dialer: Send + Sync {
    /// Create a datagram socket suitable for talking to `server`
    async fn listen_packet(&self, server: SocketAddr) -> io::Result<Arc<dyn PacketSocket>>;
}

/// One bidirectional stream of the transport
pub trait TransportStream: AsyncRead + AsyncWrite + Send + Unpin {
    /// Abort the receive side; blocked and future reads fail
    fn cancel_read(&mut self, code: u64);
}

/// The encrypted, multiplexed transport session
#[async_trait]
pub trait Transport: Send + Sync {
    /// Perform one request/response exchange
    async fn round_trip(&self, request: HttpRequest) -> Result<HttpResponse, TransportError>;
    /// Open a new bidirectional stream
    async fn open_stream(&self) -> Result<Box<dyn TransportStream>, TransportError>;
    /// Queue one unreliable message
    fn send_datagram(&self, data: Bytes) -> Result<(), TransportError>;
    /// Wait for the next unreliable message
    async fn read_datagram(&self) -> Result<Bytes, TransportError>;
    /// Current unreliable-message size limit, if datagrams are negotiated
    fn max_datagram_size(&self) -> Option<usize>;
    /// Whether the transport has concluded
    fn is_closed(&self) -> bool;
    /// Resolves once the transport concludes, with the reason
    async fn closed(&self) -> TransportError;
    /// Close with an application error code
    fn close(&self, code: u64, reason: &[u8]);
    /// Install the congestion strategy
    fn set_congestion_control(&self, cc: CongestionControl);
}

/// Establishes a [`Transport`] over a datagram socket
#[async_trait]
pub trait Connector: Send + Sync {
    /// Run the secure-channel handshake toward `server`
    async fn connect(
        &self,
        socket: Arc<dyn PacketSocket>,
        server: SocketAddr,
        params: &TransportParams,
    ) -> Result<Arc<dyn Transport>, TransportError>;
}

/// [`PacketSocket`] over a tokio UDP socket
#[derive(Debug)]
pub struct UdpPacketSocket {
    socket: UdpSocket,
    closed: CancellationToken,
}

impl UdpPacketSocket {
    /// Wrap an already bound socket
    pub fn new(socket: UdpSocket) -> Self {
        Self {
            socket,
            closed: CancellationToken::new(),
        }
    }

    fn closed_error() -> io::Error {
        io::Error::new(io::ErrorKind::NotConnected, "socket closed")
    }
}

#[async_trait]
impl PacketSocket for UdpPacketSocket {
    async fn send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize> {
        if self.closed.is_cancelled() {
            return Err(Self::closed_error());
        }
        self.socket.send_to(buf, target).await
    }

    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        tokio::select! {
            _ = self.closed.cancelled() => Err(Self::closed_error()),
            result = self.socket.recv_from(buf) => result,
        }
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    fn close(&self) {
        self.closed.cancel();
    }
}

/// Default [`Dialer`]: an unconnected UDP socket on the wildcard address of
/// the server's family
#[derive(Debug, Clone, Copy, Default)]
pub struct UdpDialer;

#[async_trait]
impl Dialer for UdpDialer {
    async fn listen_packet(&self, server: SocketAddr) -> io::Result<Arc<dyn PacketSocket>> {
        let bind: SocketAddr = match server {
            SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
            SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
        };
        let socket = UdpSocket::bind(bind).await?;
        debug!("Bound UDP socket {} for server {}", socket.local_addr()?, server);
        Ok(Arc::new(UdpPacketSocket::new(socket)))
    }
}

/// Socket pinned to one remote address, re-pointable in place.
///
/// Every send goes to the current remote regardless of the requested target,
/// and every receive reports the address the transport was established
/// with, so hopping stays invisible to the transport.
pub struct BoundSocket {
    inner: Arc<dyn PacketSocket>,
    peer: SocketAddr,
    remote: RwLock<SocketAddr>,
}

impl BoundSocket {
    /// Bind `inner` to `remote`
    pub fn new(inner: Arc<dyn PacketSocket>, remote: SocketAddr) -> Self {
        Self {
            inner,
            peer: remote,
            remote: RwLock::new(remote),
        }
    }

    /// Redirect future sends to `remote`
    pub fn hop_to(&self, remote: SocketAddr) {
        *self.remote.write() = remote;
    }

    /// Address sends currently go to
    pub fn remote_addr(&self) -> SocketAddr {
        *self.remote.read()
    }

    /// Address reported to the transport
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }
}

#[async_trait]
impl PacketSocket for BoundSocket {
    async fn send_to(&self, buf: &[u8], _target: SocketAddr) -> io::Result<usize> {
        let remote = self.remote_addr();
        self.inner.send_to(buf, remote).await
    }

    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        let (n, _) = self.inner.recv_from(buf).await?;
        Ok((n, self.peer))
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }

    fn close(&self) {
        self.inner.close();
    }
}
