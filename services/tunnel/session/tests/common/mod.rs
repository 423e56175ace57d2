//! In-memory dialer, connector and transport for client tests.

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tunnel_session::{
    ClientOptions, CongestionControl, Connector, Dialer, HttpRequest, HttpResponse, PacketSocket,
    Transport, TransportError, TransportParams, TransportStream,
};
use tunnel_wire::{AuthResponse, STATUS_AUTH_OK};

pub fn addr(port: u16) -> SocketAddr {
    SocketAddr::from(([192, 0, 2, 1], port))
}

/// Raw socket recording what reaches the wire
#[derive(Default)]
pub struct RawSocket {
    pub sent: Mutex<Vec<(Vec<u8>, SocketAddr)>>,
    pub closes: AtomicUsize,
    closed: CancellationToken,
}

#[async_trait]
impl PacketSocket for RawSocket {
    async fn send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize> {
        self.sent.lock().push((buf.to_vec(), target));
        Ok(buf.len())
    }

    async fn recv_from(&self, _buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        self.closed.cancelled().await;
        Err(io::ErrorKind::NotConnected.into())
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(SocketAddr::from(([127, 0, 0, 1], 50000)))
    }

    fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.closed.cancel();
    }
}

/// Dialer handing out [`RawSocket`]s
#[derive(Default)]
pub struct MockDialer {
    pub sockets: Mutex<Vec<Arc<RawSocket>>>,
    pub fail: AtomicBool,
}

#[async_trait]
impl Dialer for MockDialer {
    async fn listen_packet(&self, _server: SocketAddr) -> io::Result<Arc<dyn PacketSocket>> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::AddrInUse, "no ports left"));
        }
        let socket = Arc::new(RawSocket::default());
        self.sockets.lock().push(socket.clone());
        Ok(socket)
    }
}

/// Stream over an in-memory pipe
pub struct PipeStream {
    inner: DuplexStream,
    read_cancelled: bool,
}

impl AsyncRead for PipeStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.read_cancelled {
            return Poll::Ready(Err(io::ErrorKind::ConnectionAborted.into()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for PipeStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

impl TransportStream for PipeStream {
    fn cancel_read(&mut self, _code: u64) {
        self.read_cancelled = true;
    }
}

/// Transport double with scripted auth response
pub struct FakeTransport {
    auth: HttpResponse,
    closed: CancellationToken,
    pub closes: AtomicUsize,
    pub round_trips: AtomicUsize,
    pub congestion: Mutex<Option<CongestionControl>>,
    pub datagrams: Mutex<Vec<Bytes>>,
    pub servers: Mutex<Vec<DuplexStream>>,
    inbound_tx: mpsc::UnboundedSender<Bytes>,
    inbound_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Bytes>>,
}

impl FakeTransport {
    fn new(auth: HttpResponse) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        Self {
            auth,
            closed: CancellationToken::new(),
            closes: AtomicUsize::new(0),
            round_trips: AtomicUsize::new(0),
            congestion: Mutex::new(None),
            datagrams: Mutex::new(Vec::new()),
            servers: Mutex::new(Vec::new()),
            inbound_tx,
            inbound_rx: tokio::sync::Mutex::new(inbound_rx),
        }
    }

    pub fn push_datagram(&self, data: Bytes) {
        let _ = self.inbound_tx.send(data);
    }

    pub fn kill(&self) {
        self.closed.cancel();
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn round_trip(&self, _request: HttpRequest) -> Result<HttpResponse, TransportError> {
        self.round_trips.fetch_add(1, Ordering::SeqCst);
        Ok(self.auth.clone())
    }

    async fn open_stream(&self) -> Result<Box<dyn TransportStream>, TransportError> {
        let (client, server) = tokio::io::duplex(64 * 1024);
        self.servers.lock().push(server);
        Ok(Box::new(PipeStream {
            inner: client,
            read_cancelled: false,
        }))
    }

    fn send_datagram(&self, data: Bytes) -> Result<(), TransportError> {
        self.datagrams.lock().push(data);
        Ok(())
    }

    async fn read_datagram(&self) -> Result<Bytes, TransportError> {
        let mut rx = self.inbound_rx.lock().await;
        tokio::select! {
            _ = self.closed.cancelled() => Err(TransportError::ConnectionClosed("closed".into())),
            data = rx.recv() => data.ok_or_else(|| TransportError::Other("inbound ended".into())),
        }
    }

    fn max_datagram_size(&self) -> Option<usize> {
        Some(1200)
    }

    fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    async fn closed(&self) -> TransportError {
        self.closed.cancelled().await;
        TransportError::ConnectionClosed("closed".into())
    }

    fn close(&self, _code: u64, _reason: &[u8]) {
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.closed.cancel();
    }

    fn set_congestion_control(&self, cc: CongestionControl) {
        *self.congestion.lock() = Some(cc);
    }
}

/// Connector producing [`FakeTransport`]s
pub struct MockConnector {
    pub status: u16,
    pub response: AuthResponse,
    pub delay: Duration,
    pub probe: Option<Vec<u8>>,
    pub connects: AtomicUsize,
    pub params: Mutex<Vec<TransportParams>>,
    pub transports: Mutex<Vec<Arc<FakeTransport>>>,
}

impl MockConnector {
    pub fn accepting(response: AuthResponse) -> Self {
        Self {
            status: STATUS_AUTH_OK,
            response,
            delay: Duration::ZERO,
            probe: None,
            connects: AtomicUsize::new(0),
            params: Mutex::new(Vec::new()),
            transports: Mutex::new(Vec::new()),
        }
    }

    pub fn rejecting(status: u16) -> Self {
        Self {
            status,
            ..Self::accepting(AuthResponse::default())
        }
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn last_transport(&self) -> Arc<FakeTransport> {
        self.transports.lock().last().cloned().expect("no transport")
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(
        &self,
        socket: Arc<dyn PacketSocket>,
        server: SocketAddr,
        params: &TransportParams,
    ) -> Result<Arc<dyn Transport>, TransportError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        self.params.lock().push(params.clone());
        if let Some(probe) = &self.probe {
            socket
                .send_to(probe, server)
                .await
                .map_err(|e| TransportError::Other(e.to_string()))?;
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let transport = Arc::new(FakeTransport::new(HttpResponse {
            status: self.status,
            headers: self.response.to_headers(),
        }));
        self.transports.lock().push(transport.clone());
        Ok(transport)
    }
}

pub fn udp_response() -> AuthResponse {
    AuthResponse {
        udp_enabled: true,
        rx: 0,
        rx_auto: false,
    }
}

pub fn options(dialer: Arc<MockDialer>, connector: Arc<MockConnector>) -> ClientOptions {
    ClientOptions::new(addr(443), "secret", dialer, connector)
}
