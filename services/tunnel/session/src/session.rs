//! One authenticated transport connection and the relays derived from it.
//!
//! A [`Session`] is shared by every stream relay and datagram endpoint opened
//! through it. Liveness is read without locking; teardown runs exactly once no
//! matter how many paths (transport failure, explicit close) race to it.

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, trace};
use tunnel_wire::{Defragger, UdpMessage};

use crate::datagram;
use crate::error::{Result, TunnelError};
use crate::transport::{BoundSocket, PacketSocket, Transport, TransportStream};

/// Application error code used when the client closes a transport
pub const CLOSE_CODE: u64 = 0;

/// Outcome of routing one inbound datagram
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Queued for the endpoint
    Delivered,
    /// Fragment stored, packet not complete yet
    Buffered,
    /// No endpoint with this session id
    Unmatched,
    /// Endpoint queue full, message dropped
    Dropped,
}

/// Inbound side of one registered datagram endpoint
struct Slot {
    tx: mpsc::Sender<UdpMessage>,
    defragger: Mutex<Defragger>,
    dropped: Arc<AtomicU64>,
}

/// Receiving half handed to a newly registered endpoint
pub(crate) struct Registration {
    pub(crate) id: u32,
    pub(crate) rx: mpsc::Receiver<UdpMessage>,
    pub(crate) dropped: Arc<AtomicU64>,
}

/// Live authenticated transport plus its datagram table
pub struct Session {
    transport: Arc<dyn Transport>,
    socket: Arc<BoundSocket>,
    udp_enabled: bool,
    closed: AtomicBool,
    done: watch::Sender<bool>,
    close_error: Mutex<Option<String>>,
    table: RwLock<HashMap<u32, Slot>>,
    next_id: AtomicU32,
}

impl Session {
    /// Wrap an authenticated transport and start its background tasks.
    ///
    /// `relay_udp` starts the inbound datagram demultiplexer; `udp_enabled`
    /// records whether the server agreed to relay datagrams.
    pub fn start(
        transport: Arc<dyn Transport>,
        socket: Arc<BoundSocket>,
        udp_enabled: bool,
        relay_udp: bool,
    ) -> Arc<Self> {
        let (done, _) = watch::channel(false);
        let session = Arc::new(Self {
            transport,
            socket,
            udp_enabled,
            closed: AtomicBool::new(false),
            done,
            close_error: Mutex::new(None),
            table: RwLock::new(HashMap::new()),
            next_id: AtomicU32::new(0),
        });

        tokio::spawn(watch_transport(
            Arc::downgrade(&session),
            session.transport.clone(),
            session.done.subscribe(),
        ));
        if relay_udp {
            tokio::spawn(datagram::run_demux(
                Arc::downgrade(&session),
                session.transport.clone(),
                session.done.subscribe(),
            ));
        }
        session
    }

    /// True while neither the transport nor this session has concluded
    pub fn is_live(&self) -> bool {
        !self.closed.load(Ordering::Acquire) && !self.transport.is_closed()
    }

    /// Tear the session down. Only the first call has any effect; it
    /// returns `true` when this call performed the teardown.
    pub fn close(&self, err: TunnelError) -> bool {
        if self
            .closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        info!("Session closed: {}", err);
        *self.close_error.lock() = Some(err.to_string());
        self.done.send_replace(true);
        self.transport.close(CLOSE_CODE, b"");
        self.socket.close();

        // Dropping the senders wakes every blocked endpoint reader
        self.table.write().clear();
        true
    }

    /// Resolves once the session has been closed
    pub async fn done(&self) {
        let mut rx = self.done.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    /// Error the session was closed with, if closed
    pub fn close_error(&self) -> Option<String> {
        self.close_error.lock().clone()
    }

    /// Whether the server relays datagrams for this session
    pub fn udp_enabled(&self) -> bool {
        self.udp_enabled
    }

    /// The transport this session runs over
    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Raw socket, re-pointable for address hopping
    pub fn raw_socket(&self) -> &Arc<BoundSocket> {
        &self.socket
    }

    /// Open a new bidirectional transport stream
    pub async fn open_stream(&self) -> Result<Box<dyn TransportStream>> {
        if !self.is_live() {
            return Err(TunnelError::NotActive);
        }
        Ok(self.transport.open_stream().await?)
    }

    /// Allocate a fresh session id and an inbound queue of `capacity`.
    ///
    /// Ids increase monotonically and are never handed out twice.
    pub(crate) fn register(&self, capacity: usize) -> Result<Registration> {
        let (tx, rx) = mpsc::channel(capacity);
        let dropped = Arc::new(AtomicU64::new(0));

        let mut table = self.table.write();
        if !self.is_live() {
            return Err(TunnelError::NotActive);
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        table.insert(
            id,
            Slot {
                tx,
                defragger: Mutex::new(Defragger::new()),
                dropped: dropped.clone(),
            },
        );
        debug!("Registered datagram session {}", id);
        Ok(Registration { id, rx, dropped })
    }

    /// Remove `id` from the table; later messages for it are unmatched
    pub fn deregister(&self, id: u32) -> bool {
        let removed = self.table.write().remove(&id).is_some();
        if removed {
            debug!("Deregistered datagram session {}", id);
        }
        removed
    }

    /// Number of registered datagram endpoints
    pub fn endpoint_count(&self) -> usize {
        self.table.read().len()
    }

    /// Route one decoded message to its endpoint
    pub fn dispatch(&self, message: UdpMessage) -> Delivery {
        let table = self.table.read();
        let Some(slot) = table.get(&message.session_id) else {
            trace!("No datagram session {}, dropping", message.session_id);
            return Delivery::Unmatched;
        };

        let Some(message) = slot.defragger.lock().feed(message) else {
            return Delivery::Buffered;
        };

        let session_id = message.session_id;
        match slot.tx.try_send(message) {
            Ok(()) => Delivery::Delivered,
            Err(mpsc::error::TrySendError::Full(_)) => {
                let total = slot.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                trace!(
                    "Datagram session {} queue full, dropped newest ({} total)",
                    session_id,
                    total
                );
                Delivery::Dropped
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Delivery::Unmatched,
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close(TunnelError::Closed);
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("remote", &self.socket.remote_addr())
            .field("udp_enabled", &self.udp_enabled)
            .field("live", &self.is_live())
            .finish()
    }
}

/// Close the session as soon as the transport concludes on its own
async fn watch_transport(
    session: Weak<Session>,
    transport: Arc<dyn Transport>,
    mut done: watch::Receiver<bool>,
) {
    tokio::select! {
        _ = done.wait_for(|closed| *closed) => {}
        reason = transport.closed() => {
            if let Some(session) = session.upgrade() {
                debug!("Transport concluded: {}", reason);
                session.close(TunnelError::Transport(reason));
            }
        }
    }
}
