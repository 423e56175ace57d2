//! In-memory transport doubles for unit tests.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll, Waker};
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::TransportError;
use crate::transport::{
    CongestionControl, HttpRequest, HttpResponse, PacketSocket, Transport, TransportStream,
};

/// Raw socket that records closes and never receives
pub(crate) struct MockSocket {
    closes: AtomicUsize,
    closed: CancellationToken,
}

impl MockSocket {
    pub(crate) fn new() -> Self {
        Self {
            closes: AtomicUsize::new(0),
            closed: CancellationToken::new(),
        }
    }

    pub(crate) fn close_calls(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PacketSocket for MockSocket {
    async fn send_to(&self, buf: &[u8], _target: SocketAddr) -> io::Result<usize> {
        Ok(buf.len())
    }

    async fn recv_from(&self, _buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        self.closed.cancelled().await;
        Err(io::ErrorKind::NotConnected.into())
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(SocketAddr::from(([127, 0, 0, 1], 40000)))
    }

    fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.closed.cancel();
    }
}

/// Transport stream over an in-memory duplex pipe
pub(crate) struct MockStream {
    inner: DuplexStream,
    read_cancelled: Arc<AtomicBool>,
    reader: Arc<Mutex<Option<Waker>>>,
}

impl MockStream {
    pub(crate) fn pair() -> (Self, DuplexStream) {
        let (client, server) = tokio::io::duplex(64 * 1024);
        (
            Self {
                inner: client,
                read_cancelled: Arc::new(AtomicBool::new(false)),
                reader: Arc::new(Mutex::new(None)),
            },
            server,
        )
    }

    pub(crate) fn read_cancelled(&self) -> Arc<AtomicBool> {
        self.read_cancelled.clone()
    }
}

impl AsyncRead for MockStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.read_cancelled.load(Ordering::SeqCst) {
            return Poll::Ready(Err(io::ErrorKind::ConnectionAborted.into()));
        }
        *self.reader.lock() = Some(cx.waker().clone());
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for MockStream {
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

impl TransportStream for MockStream {
    fn cancel_read(&mut self, _code: u64) {
        self.read_cancelled.store(true, Ordering::SeqCst);
        if let Some(waker) = self.reader.lock().take() {
            waker.wake();
        }
    }
}

/// Transport that records everything the client does to it
pub(crate) struct MockTransport {
    closed: CancellationToken,
    reason: Mutex<Option<TransportError>>,
    closes: AtomicUsize,
    sent: Mutex<Vec<Bytes>>,
    inbound_tx: mpsc::UnboundedSender<Bytes>,
    inbound_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Bytes>>,
    max_datagram: Mutex<Option<usize>>,
    servers: Mutex<Vec<DuplexStream>>,
}

impl MockTransport {
    pub(crate) fn new() -> Self {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        Self {
            closed: CancellationToken::new(),
            reason: Mutex::new(None),
            closes: AtomicUsize::new(0),
            sent: Mutex::new(Vec::new()),
            inbound_tx,
            inbound_rx: tokio::sync::Mutex::new(inbound_rx),
            max_datagram: Mutex::new(Some(1200)),
            servers: Mutex::new(Vec::new()),
        }
    }

    /// Conclude the transport as if the peer went away
    pub(crate) fn fail(&self, reason: &str) {
        *self.reason.lock() = Some(TransportError::ConnectionClosed(reason.to_string()));
        self.closed.cancel();
    }

    pub(crate) fn close_calls(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub(crate) fn push_datagram(&self, data: Bytes) {
        let _ = self.inbound_tx.send(data);
    }

    pub(crate) fn sent_datagrams(&self) -> Vec<Bytes> {
        self.sent.lock().clone()
    }

    pub(crate) fn set_max_datagram_size(&self, size: Option<usize>) {
        *self.max_datagram.lock() = size;
    }

    pub(crate) fn take_server_stream(&self) -> Option<DuplexStream> {
        self.servers.lock().pop()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn round_trip(&self, _request: HttpRequest) -> Result<HttpResponse, TransportError> {
        Err(TransportError::Other("no auth endpoint".into()))
    }

    async fn open_stream(&self) -> Result<Box<dyn TransportStream>, TransportError> {
        let (stream, server) = MockStream::pair();
        self.servers.lock().push(server);
        Ok(Box::new(stream))
    }

    fn send_datagram(&self, data: Bytes) -> Result<(), TransportError> {
        if self.closed.is_cancelled() {
            return Err(TransportError::ConnectionClosed("closed".into()));
        }
        self.sent.lock().push(data);
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
        *self.max_datagram.lock()
    }

    fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    async fn closed(&self) -> TransportError {
        self.closed.cancelled().await;
        self.reason
            .lock()
            .clone()
            .unwrap_or_else(|| TransportError::ConnectionClosed("local close".into()))
    }

    fn close(&self, _code: u64, _reason: &[u8]) {
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.closed.cancel();
    }

    fn set_congestion_control(&self, _cc: CongestionControl) {}
}
