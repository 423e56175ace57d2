//! Datagram relay multiplexer.
//!
//! Every [`DatagramEndpoint`] owns one session id on the transport's
//! unreliable-message channel. Outbound payloads are framed as
//! [`UdpMessage`]s (fragmented when they exceed the message limit); inbound
//! messages are demultiplexed by [`run_demux`] into per-endpoint queues.
//!
//! Queues hold [`INBOUND_QUEUE_CAPACITY`] messages. When an endpoint's
//! consumer falls behind, newly arriving messages for it are dropped so the
//! demultiplexer never stalls the other endpoints.

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};
use tunnel_wire::{fragment, UdpMessage};

use crate::error::{Result, TunnelError};
use crate::session::Session;
use crate::transport::Transport;

/// Inbound queue capacity per endpoint
pub const INBOUND_QUEUE_CAPACITY: usize = 64;

/// Read loop of one session: route every inbound message to its endpoint
/// until the session ends.
pub(crate) async fn run_demux(
    session: Weak<Session>,
    transport: Arc<dyn Transport>,
    mut done: watch::Receiver<bool>,
) {
    debug!("Datagram demultiplexer started");
    loop {
        let data = tokio::select! {
            _ = done.wait_for(|closed| *closed) => break,
            result = transport.read_datagram() => match result {
                Ok(data) => data,
                Err(e) => {
                    if let Some(session) = session.upgrade() {
                        session.close(TunnelError::Transport(e));
                    }
                    break;
                }
            },
        };

        let message = match UdpMessage::decode(data) {
            Ok(message) => message,
            Err(e) => {
                trace!("Dropping malformed datagram: {}", e);
                continue;
            }
        };

        let Some(session) = session.upgrade() else {
            break;
        };
        session.dispatch(message);
    }
    debug!("Datagram demultiplexer stopped");
}

/// Buffer-shape request for [`DatagramEndpoint::wait_read_packet`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReadWaitOptions {
    /// Bytes to reserve before the payload
    pub front_headroom: usize,
    /// Bytes to reserve after the payload
    pub rear_headroom: usize,
}

impl ReadWaitOptions {
    /// Whether payloads must be copied into a fresh buffer
    pub fn needs_headroom(&self) -> bool {
        self.front_headroom > 0 || self.rear_headroom > 0
    }

    fn packet_buffer(&self, payload: &[u8]) -> PacketBuffer {
        let mut buf =
            BytesMut::with_capacity(self.front_headroom + payload.len() + self.rear_headroom);
        buf.resize(self.front_headroom, 0);
        buf.extend_from_slice(payload);
        let end = buf.len();
        buf.resize(end + self.rear_headroom, 0);
        PacketBuffer {
            storage: Storage::Owned(buf),
            start: self.front_headroom,
            end,
        }
    }
}

enum Storage {
    Shared(Bytes),
    Owned(BytesMut),
}

/// One received payload, either the original receive buffer or a copy
/// laid out with the requested headroom
pub struct PacketBuffer {
    storage: Storage,
    start: usize,
    end: usize,
}

impl PacketBuffer {
    fn shared(payload: Bytes) -> Self {
        let end = payload.len();
        Self {
            storage: Storage::Shared(payload),
            start: 0,
            end,
        }
    }

    /// The payload bytes
    pub fn payload(&self) -> &[u8] {
        match &self.storage {
            Storage::Shared(bytes) => &bytes[self.start..self.end],
            Storage::Owned(buf) => &buf[self.start..self.end],
        }
    }

    /// Payload length
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    /// True for an empty payload
    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// Reserved bytes before the payload
    pub fn front_headroom(&self) -> usize {
        self.start
    }

    /// Reserved bytes after the payload
    pub fn rear_headroom(&self) -> usize {
        match &self.storage {
            Storage::Shared(bytes) => bytes.len() - self.end,
            Storage::Owned(buf) => buf.len() - self.end,
        }
    }

    /// True when this is the original receive buffer
    pub fn is_zero_copy(&self) -> bool {
        matches!(self.storage, Storage::Shared(_))
    }

    /// Whole copied buffer, headroom included, for in-place framing
    pub fn buffer_mut(&mut self) -> Option<&mut BytesMut> {
        match &mut self.storage {
            Storage::Owned(buf) => Some(buf),
            Storage::Shared(_) => None,
        }
    }

    /// Take the payload as `Bytes`
    pub fn into_payload(self) -> Bytes {
        match self.storage {
            Storage::Shared(bytes) => bytes.slice(self.start..self.end),
            Storage::Owned(buf) => buf.freeze().slice(self.start..self.end),
        }
    }
}

impl std::fmt::Debug for PacketBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketBuffer")
            .field("len", &self.len())
            .field("front_headroom", &self.front_headroom())
            .field("rear_headroom", &self.rear_headroom())
            .field("zero_copy", &self.is_zero_copy())
            .finish()
    }
}

/// Caller-visible unreliable relay socket multiplexed over one session
pub struct DatagramEndpoint {
    id: u32,
    session: Weak<Session>,
    rx: tokio::sync::Mutex<mpsc::Receiver<UdpMessage>>,
    cancel: CancellationToken,
    deadline: watch::Sender<Option<Instant>>,
    read_wait: Mutex<ReadWaitOptions>,
    dropped: Arc<AtomicU64>,
    closed: AtomicBool,
    udp_mtu: usize,
}

impl DatagramEndpoint {
    /// Register a new endpoint on `session`.
    ///
    /// Blocked reads wake with [`TunnelError::Closed`] once `cancel` fires.
    pub(crate) fn open(
        session: &Arc<Session>,
        cancel: &CancellationToken,
        udp_mtu: usize,
    ) -> Result<Self> {
        if !session.udp_enabled() {
            return Err(TunnelError::UdpDisabledByServer);
        }
        let registration = session.register(INBOUND_QUEUE_CAPACITY)?;
        let (deadline, _) = watch::channel(None);
        Ok(Self {
            id: registration.id,
            session: Arc::downgrade(session),
            rx: tokio::sync::Mutex::new(registration.rx),
            cancel: cancel.child_token(),
            deadline,
            read_wait: Mutex::new(ReadWaitOptions::default()),
            dropped: registration.dropped,
            closed: AtomicBool::new(false),
            udp_mtu,
        })
    }

    /// Session id carried by every message of this endpoint
    pub fn session_id(&self) -> u32 {
        self.id
    }

    /// Inbound messages dropped because the queue was full
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn live_session(&self) -> Result<Arc<Session>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TunnelError::Closed);
        }
        match self.session.upgrade() {
            Some(session) if session.is_live() => Ok(session),
            _ => Err(TunnelError::NotActive),
        }
    }

    /// Send `payload` to `destination` (`host:port`).
    ///
    /// Returns the payload length; framing overhead is not counted.
    pub fn send_to(&self, payload: &[u8], destination: &str) -> Result<usize> {
        let session = self.live_session()?;
        let transport = session.transport();

        let mut message = UdpMessage::new(self.id, destination, Bytes::copy_from_slice(payload));
        let limit = transport
            .max_datagram_size()
            .map_or(self.udp_mtu, |max| max.min(self.udp_mtu));

        if message.encoded_size() <= limit {
            transport.send_datagram(message.encode()?)?;
            return Ok(payload.len());
        }

        message.packet_id = rand::random();
        let fragments = fragment(&message, limit).map_err(|_| TunnelError::MessageTooLarge {
            size: payload.len(),
            max: limit.saturating_sub(message.header_size()) * u8::MAX as usize,
        })?;
        trace!(
            "Datagram session {} sending {} bytes in {} fragments",
            self.id,
            payload.len(),
            fragments.len()
        );
        for part in &fragments {
            transport.send_datagram(part.encode()?)?;
        }
        Ok(payload.len())
    }

    async fn next_message(&self) -> Result<UdpMessage> {
        if self.closed.load(Ordering::Acquire) || self.cancel.is_cancelled() {
            return Err(TunnelError::Closed);
        }
        if self.session.strong_count() == 0 {
            return Err(TunnelError::NotActive);
        }

        let mut rx = self.rx.lock().await;
        let mut deadline = self.deadline.subscribe();
        loop {
            let current = *deadline.borrow_and_update();
            let expired = async move {
                match current {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(TunnelError::Closed),
                message = rx.recv() => return message.ok_or(TunnelError::NotActive),
                _ = expired => return Err(TunnelError::Timeout),
                _ = deadline.changed() => continue,
            }
        }
    }

    /// Receive one payload into `buf`; returns its length (truncated to
    /// `buf`) and the source address
    pub async fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, String)> {
        let message = self.next_message().await?;
        let n = message.payload.len().min(buf.len());
        buf[..n].copy_from_slice(&message.payload[..n]);
        Ok((n, message.address))
    }

    /// Declare the buffer shape wanted from [`Self::wait_read_packet`].
    ///
    /// Returns true when payloads will be copied into fresh buffers.
    pub fn initialize_read_waiter(&self, options: ReadWaitOptions) -> bool {
        *self.read_wait.lock() = options;
        options.needs_headroom()
    }

    /// Wait for one payload shaped per [`Self::initialize_read_waiter`]
    pub async fn wait_read_packet(&self) -> Result<(PacketBuffer, String)> {
        let message = self.next_message().await?;
        let options = *self.read_wait.lock();
        let buffer = if options.needs_headroom() {
            options.packet_buffer(&message.payload)
        } else {
            PacketBuffer::shared(message.payload)
        };
        Ok((buffer, message.address))
    }

    /// Set or clear the read deadline; pending reads observe the change
    pub fn set_read_deadline(&self, deadline: Option<Instant>) {
        self.deadline.send_replace(deadline);
    }

    /// Close the endpoint and free its session id
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.cancel.cancel();
        if let Some(session) = self.session.upgrade() {
            session.deregister(self.id);
        }
    }

    /// Whether [`Self::close`] has been called
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl Drop for DatagramEndpoint {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for DatagramEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatagramEndpoint")
            .field("session_id", &self.id)
            .field("closed", &self.is_closed())
            .field("dropped", &self.dropped())
            .finish()
    }
}
