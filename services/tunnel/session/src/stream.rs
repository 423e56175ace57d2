//! Stream relay: a transport stream carrying one proxied TCP connection.
//!
//! The first write sends the relay request together with the caller's first
//! payload chunk; the first read consumes the relay response before any
//! payload is returned. Callers only ever see their own bytes.

use bytes::{Buf, Bytes, BytesMut};
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tracing::{debug, trace};
use tunnel_wire::{TcpRequest, TcpResponse};

use crate::error::TunnelError;
use crate::transport::TransportStream;

/// Error code passed to the transport when reads are abandoned
const CANCEL_READ_CODE: u64 = 0;

const READ_CHUNK: usize = 512;

enum WriteState {
    /// Nothing written yet
    Initial,
    /// Request frame in flight. Once any of it is written, the caller must
    /// retry with the same buffer until the write completes.
    Sending {
        frame: Bytes,
        frame_len: usize,
        payload_len: usize,
    },
    /// Request sent; writes pass through
    Established,
}

enum ReadState {
    /// Waiting for a complete response frame
    AwaitingResponse(BytesMut),
    /// Response accepted; payload bytes that arrived with it come first
    Draining(Bytes),
    /// Reads pass through
    Established,
    /// Remote refused the relay
    Rejected(String),
}

/// Stream relayed to one destination through the tunnel
pub struct StreamRelay {
    stream: Box<dyn TransportStream>,
    destination: String,
    write: WriteState,
    read: ReadState,
    read_cancelled: bool,
}

impl StreamRelay {
    /// Relay `stream` to `destination` (`host:port`)
    pub fn new(stream: Box<dyn TransportStream>, destination: impl Into<String>) -> Self {
        Self {
            stream,
            destination: destination.into(),
            write: WriteState::Initial,
            read: ReadState::AwaitingResponse(BytesMut::new()),
            read_cancelled: false,
        }
    }

    /// Destination this relay was opened for
    pub fn destination(&self) -> &str {
        &self.destination
    }

    /// True until the relay request has been written
    pub fn needs_handshake(&self) -> bool {
        matches!(self.write, WriteState::Initial)
    }

    /// Placeholder; transport addressing is not exposed
    pub fn local_addr(&self) -> SocketAddr {
        SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))
    }

    /// Placeholder; transport addressing is not exposed
    pub fn remote_addr(&self) -> SocketAddr {
        SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))
    }

    /// Cancel pending reads, then close the write side
    pub async fn close(&mut self) -> io::Result<()> {
        self.shutdown().await
    }

    fn cancel_read(&mut self) {
        if !self.read_cancelled {
            self.read_cancelled = true;
            self.stream.cancel_read(CANCEL_READ_CODE);
        }
    }

    fn rejected(message: &str) -> io::Error {
        io::Error::other(TunnelError::Remote(message.to_string()))
    }

    /// Read until a response frame parses; returns false on clean EOF
    fn poll_response(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<bool>> {
        loop {
            let ReadState::AwaitingResponse(pending) = &mut self.read else {
                return Poll::Ready(Ok(true));
            };

            match TcpResponse::decode(pending) {
                Ok(Some((response, consumed))) => {
                    pending.advance(consumed);
                    let leftover = pending.split().freeze();
                    if !response.ok {
                        debug!(
                            "Relay to {} rejected: {}",
                            self.destination, response.message
                        );
                        self.read = ReadState::Rejected(response.message);
                        return Poll::Ready(Ok(true));
                    }
                    trace!("Relay to {} accepted", self.destination);
                    self.read = if leftover.is_empty() {
                        ReadState::Established
                    } else {
                        ReadState::Draining(leftover)
                    };
                    return Poll::Ready(Ok(true));
                }
                Ok(None) => {}
                Err(e) => return Poll::Ready(Err(io::Error::new(io::ErrorKind::InvalidData, e))),
            }

            let mut chunk = [0u8; READ_CHUNK];
            let mut read_buf = ReadBuf::new(&mut chunk);
            match ready!(Pin::new(&mut self.stream).poll_read(cx, &mut read_buf)) {
                Ok(()) => {
                    let filled = read_buf.filled();
                    if filled.is_empty() {
                        if pending.is_empty() {
                            return Poll::Ready(Ok(false));
                        }
                        return Poll::Ready(Err(io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            "stream ended inside relay response",
                        )));
                    }
                    pending.extend_from_slice(filled);
                }
                Err(e) if is_reset(&e) => return Poll::Ready(Ok(false)),
                Err(e) => return Poll::Ready(Err(e)),
            }
        }
    }
}

fn is_reset(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionAborted
    )
}

fn normalize_write_error(err: io::Error) -> io::Error {
    match err.kind() {
        io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::BrokenPipe => io::Error::new(io::ErrorKind::BrokenPipe, err),
        _ => err,
    }
}

impl AsyncRead for StreamRelay {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;
        if matches!(this.read, ReadState::AwaitingResponse(_))
            && !ready!(this.poll_response(cx))?
        {
            return Poll::Ready(Ok(()));
        }

        match &mut this.read {
            ReadState::Rejected(message) => Poll::Ready(Err(Self::rejected(message))),
            ReadState::Draining(leftover) => {
                let n = leftover.len().min(buf.remaining());
                buf.put_slice(&leftover[..n]);
                leftover.advance(n);
                if leftover.is_empty() {
                    this.read = ReadState::Established;
                }
                Poll::Ready(Ok(()))
            }
            ReadState::Established => match ready!(Pin::new(&mut this.stream).poll_read(cx, buf)) {
                Err(e) if is_reset(&e) => Poll::Ready(Ok(())),
                other => Poll::Ready(other),
            },
            ReadState::AwaitingResponse(_) => Poll::Ready(Err(io::Error::other(
                "relay response not received",
            ))),
        }
    }
}

impl AsyncWrite for StreamRelay {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = &mut *self;
        loop {
            match &mut this.write {
                WriteState::Initial => {
                    let frame = TcpRequest::new(this.destination.clone())
                        .encode_with_payload(buf)
                        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
                    trace!(
                        "Sending relay request to {} ({} payload bytes)",
                        this.destination,
                        buf.len()
                    );
                    this.write = WriteState::Sending {
                        frame_len: frame.len(),
                        frame,
                        payload_len: buf.len(),
                    };
                }
                WriteState::Sending {
                    frame,
                    frame_len,
                    payload_len,
                } => {
                    while !frame.is_empty() {
                        let n = match Pin::new(&mut this.stream).poll_write(cx, frame) {
                            Poll::Ready(Ok(n)) if n > 0 => n,
                            other => {
                                // Nothing sent yet: the next write re-encodes its own buffer
                                if frame.len() == *frame_len {
                                    this.write = WriteState::Initial;
                                }
                                return match other {
                                    Poll::Ready(Ok(_)) => {
                                        Poll::Ready(Err(io::ErrorKind::WriteZero.into()))
                                    }
                                    Poll::Ready(Err(e)) => {
                                        Poll::Ready(Err(normalize_write_error(e)))
                                    }
                                    Poll::Pending => Poll::Pending,
                                };
                            }
                        };
                        frame.advance(n);
                    }
                    let written = *payload_len;
                    this.write = WriteState::Established;
                    return Poll::Ready(Ok(written));
                }
                WriteState::Established => {
                    return Pin::new(&mut this.stream)
                        .poll_write(cx, buf)
                        .map_err(normalize_write_error);
                }
            }
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream)
            .poll_flush(cx)
            .map_err(normalize_write_error)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.cancel_read();
        Pin::new(&mut self.stream)
            .poll_shutdown(cx)
            .map_err(normalize_write_error)
    }
}

impl std::fmt::Debug for StreamRelay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamRelay")
            .field("destination", &self.destination)
            .field("needs_handshake", &self.needs_handshake())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockStream;
    use std::sync::atomic::Ordering;
    use tokio::io::{AsyncReadExt, DuplexStream};

    fn relay(destination: &str) -> (StreamRelay, DuplexStream) {
        let (stream, server) = MockStream::pair();
        (StreamRelay::new(Box::new(stream), destination), server)
    }

    async fn read_request(server: &mut DuplexStream) -> (TcpRequest, Vec<u8>) {
        let mut raw = Vec::new();
        loop {
            let mut chunk = [0u8; 256];
            let n = server.read(&mut chunk).await.unwrap();
            raw.extend_from_slice(&chunk[..n]);
            if let Some((request, consumed)) = TcpRequest::decode(&raw).unwrap() {
                return (request, raw[consumed..].to_vec());
            }
        }
    }

    #[tokio::test]
    async fn test_first_write_sends_one_request() {
        let (mut relay, mut server) = relay("example.com:443");
        assert!(relay.needs_handshake());

        let n = relay.write(b"GET / HTTP/1.1\r\n").await.unwrap();
        assert_eq!(n, 16);
        assert!(!relay.needs_handshake());

        let (request, payload) = read_request(&mut server).await;
        assert_eq!(request.address, "example.com:443");
        assert_eq!(payload, b"GET / HTTP/1.1\r\n");

        // Later writes are not framed
        relay.write_all(b"more").await.unwrap();
        let mut buf = [0u8; 4];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"more");
    }

    /// Stream whose first write fails with a reset
    struct ResetOnFirstWrite {
        inner: MockStream,
        reset: bool,
    }

    impl AsyncRead for ResetOnFirstWrite {
        fn poll_read(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            Pin::new(&mut self.inner).poll_read(cx, buf)
        }
    }

    impl AsyncWrite for ResetOnFirstWrite {
        fn poll_write(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            if !self.reset {
                self.reset = true;
                return Poll::Ready(Err(io::ErrorKind::ConnectionReset.into()));
            }
            Pin::new(&mut self.inner).poll_write(cx, buf)
        }

        fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Pin::new(&mut self.inner).poll_flush(cx)
        }

        fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Pin::new(&mut self.inner).poll_shutdown(cx)
        }
    }

    impl TransportStream for ResetOnFirstWrite {
        fn cancel_read(&mut self, code: u64) {
            self.inner.cancel_read(code);
        }
    }

    #[tokio::test]
    async fn test_unsent_request_uses_next_buffer() {
        let (inner, mut server) = MockStream::pair();
        let stream = ResetOnFirstWrite {
            inner,
            reset: false,
        };
        let mut relay = StreamRelay::new(Box::new(stream), "example.com:80");

        let err = relay.write(b"first").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
        assert!(relay.needs_handshake());

        let n = relay.write(b"second").await.unwrap();
        assert_eq!(n, 6);
        assert!(!relay.needs_handshake());

        let (request, payload) = read_request(&mut server).await;
        assert_eq!(request.address, "example.com:80");
        assert_eq!(payload, b"second");
    }

    #[tokio::test]
    async fn test_zero_length_first_write() {
        let (mut relay, mut server) = relay("10.0.0.1:22");
        let n = relay.write(&[]).await.unwrap();
        assert_eq!(n, 0);
        assert!(!relay.needs_handshake());

        let (request, payload) = read_request(&mut server).await;
        assert_eq!(request.address, "10.0.0.1:22");
        assert!(payload.is_empty());
    }

    #[tokio::test]
    async fn test_response_then_payload() {
        let (mut relay, mut server) = relay("example.com:80");
        let mut response = TcpResponse::ok().encode().unwrap().to_vec();
        response.extend_from_slice(b"hello");
        server.write_all(&response).await.unwrap();
        server.write_all(b" world").await.unwrap();

        let mut out = vec![0u8; 11];
        relay.read_exact(&mut out).await.unwrap();
        assert_eq!(out, b"hello world");
    }

    #[tokio::test]
    async fn test_rejected_response() {
        let (mut relay, mut server) = relay("example.com:80");
        let mut response = TcpResponse::error("auth failed").encode().unwrap().to_vec();
        response.extend_from_slice(b"never returned");
        server.write_all(&response).await.unwrap();

        let mut buf = [0u8; 32];
        let err = relay.read(&mut buf).await.unwrap_err();
        assert!(err.to_string().contains("auth failed"));

        // Stays rejected
        let err = relay.read(&mut buf).await.unwrap_err();
        assert!(err.to_string().contains("auth failed"));
    }

    #[tokio::test]
    async fn test_response_split_across_reads() {
        let (mut relay, mut server) = relay("example.com:80");
        let response = TcpResponse::ok().encode().unwrap();
        let (head, tail) = response.split_at(1);
        let tail = tail.to_vec();
        server.write_all(head).await.unwrap();

        let reader = tokio::spawn(async move {
            let mut buf = [0u8; 3];
            relay.read_exact(&mut buf).await.map(|_| buf)
        });
        tokio::task::yield_now().await;
        server.write_all(&tail).await.unwrap();
        server.write_all(b"abc").await.unwrap();
        assert_eq!(&reader.await.unwrap().unwrap(), b"abc");
    }

    #[tokio::test]
    async fn test_close_cancels_reads() {
        let (stream, server) = MockStream::pair();
        let cancelled = stream.read_cancelled();
        let mut relay = StreamRelay::new(Box::new(stream), "example.com:80");

        relay.close().await.unwrap();
        assert!(cancelled.load(Ordering::SeqCst));

        // Cancelled reads surface as end of stream
        let mut buf = [0u8; 8];
        assert_eq!(relay.read(&mut buf).await.unwrap(), 0);
        drop(server);
    }

    #[test]
    fn test_placeholder_addresses() {
        let (stream, _server) = MockStream::pair();
        let relay = StreamRelay::new(Box::new(stream), "example.com:80");
        assert!(relay.local_addr().ip().is_unspecified());
        assert_eq!(relay.remote_addr().port(), 0);
    }
}
