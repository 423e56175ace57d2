//! Connection manager: lazily establishes one authenticated session and
//! hands out stream relays and datagram endpoints over it.
//!
//! Session creation is single-flight. The fast path is a read of the cached
//! session and its liveness flag; the slow path takes the manager lock,
//! re-checks, and runs dial → bind → obfuscate → connect → authenticate →
//! congestion selection while holding it. Callers queued behind an attempt
//! receive its outcome, success or failure, instead of starting their own.
//!
//! With more than one server address configured, a background loop hops the
//! live session's socket to a randomly drawn address on every tick.

use parking_lot::RwLock;
use rand::Rng;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tunnel_wire::AuthRequest;

use crate::datagram::DatagramEndpoint;
use crate::error::{Result, TunnelError};
use crate::handshake::{authenticate, select_congestion_control};
use crate::obfs::SalamanderSocket;
use crate::session::{Session, CLOSE_CODE};
use crate::stream::StreamRelay;
use crate::transport::{BoundSocket, Connector, Dialer, PacketSocket, TransportParams};

/// Default datagram payload limit
pub const DEFAULT_UDP_MTU: usize = 1200;
/// Default address hopping interval
pub const DEFAULT_HOP_INTERVAL: Duration = Duration::from_secs(30);

/// What the hopping loop does on a tick with no live session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum HopPolicy {
    /// Exit the loop for good; later sessions are never hopped
    #[default]
    StopWhenIdle,
    /// Keep ticking; the next session is hopped once it exists
    KeepRunning,
}

/// Everything the connection manager needs
#[derive(Clone)]
pub struct ClientOptions {
    /// Cancels background tasks and every endpoint read
    pub cancel: CancellationToken,
    /// Produces the raw datagram socket
    pub dialer: Arc<dyn Dialer>,
    /// Establishes the encrypted transport
    pub connector: Arc<dyn Connector>,
    /// Forwarded to the rate-paced congestion controller
    pub brutal_debug: bool,
    /// Address the first session dials
    pub server_address: SocketAddr,
    /// Hopping pool; hopping runs when it holds more than one address
    pub server_addresses: Vec<SocketAddr>,
    /// Position of `server_address` in the pool
    pub server_address_index: usize,
    /// Hopping interval
    pub hop_interval: Duration,
    /// Idle-tick behaviour of the hopping loop
    pub hop_policy: HopPolicy,
    /// Local send cap in bits/second (0 = none)
    pub send_bps: u64,
    /// Receive rate requested from the server in bits/second (0 = unknown)
    pub receive_bps: u64,
    /// Salamander obfuscation password
    pub salamander_password: Option<String>,
    /// Authentication credential
    pub auth: String,
    /// TLS and transport parameters
    pub transport: TransportParams,
    /// Relay datagrams
    pub udp_enabled: bool,
    /// Initial congestion window override in packets
    pub initial_window: Option<usize>,
    /// Largest datagram message, framing included
    pub udp_mtu: usize,
}

impl ClientOptions {
    /// Options for a single server with defaults everywhere else
    pub fn new(
        server_address: SocketAddr,
        auth: impl Into<String>,
        dialer: Arc<dyn Dialer>,
        connector: Arc<dyn Connector>,
    ) -> Self {
        Self {
            cancel: CancellationToken::new(),
            dialer,
            connector,
            brutal_debug: false,
            server_address,
            server_addresses: Vec::new(),
            server_address_index: 0,
            hop_interval: DEFAULT_HOP_INTERVAL,
            hop_policy: HopPolicy::default(),
            send_bps: 0,
            receive_bps: 0,
            salamander_password: None,
            auth: auth.into(),
            transport: TransportParams::default(),
            udp_enabled: true,
            initial_window: None,
            udp_mtu: DEFAULT_UDP_MTU,
        }
    }

    fn hopping(&self) -> bool {
        self.server_addresses.len() > 1
    }
}

impl std::fmt::Debug for ClientOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientOptions")
            .field("server_address", &self.server_address)
            .field("server_addresses", &self.server_addresses)
            .field("hop_interval", &self.hop_interval)
            .field("hop_policy", &self.hop_policy)
            .field("send_bps", &self.send_bps)
            .field("receive_bps", &self.receive_bps)
            .field("obfuscated", &self.salamander_password.is_some())
            .field("udp_enabled", &self.udp_enabled)
            .field("udp_mtu", &self.udp_mtu)
            .finish_non_exhaustive()
    }
}

/// State guarded by the manager lock: the current dial target and the
/// outcome of the latest establishment attempt
#[derive(Debug)]
struct Target {
    addr: SocketAddr,
    index: usize,
    attempts: u64,
    last_failure: Option<TunnelError>,
}

struct ClientInner {
    options: ClientOptions,
    current: RwLock<Option<Arc<Session>>>,
    target: Mutex<Target>,
    /// Mirror of `Target::attempts`, readable without the lock
    attempts: AtomicU64,
}

impl ClientInner {
    fn live_session(&self) -> Option<Arc<Session>> {
        self.current
            .read()
            .as_ref()
            .filter(|session| session.is_live())
            .cloned()
    }

    async fn establish(&self, addr: SocketAddr, cancel: &CancellationToken) -> Result<Arc<Session>> {
        let options = &self.options;
        debug!("Dialing {}", addr);

        let raw = options
            .dialer
            .listen_packet(addr)
            .await
            .map_err(TunnelError::dial)?;
        let bound = Arc::new(BoundSocket::new(raw, addr));
        let socket: Arc<dyn PacketSocket> = match options.salamander_password.as_deref() {
            Some(password) if !password.is_empty() => {
                Arc::new(SalamanderSocket::new(bound.clone(), password))
            }
            _ => bound.clone(),
        };

        let params = options.transport.clone().with_default_alpn();
        let connected = tokio::select! {
            _ = cancel.cancelled() => Err(TunnelError::Closed),
            result = options.connector.connect(socket, addr, &params) => {
                result.map_err(TunnelError::from)
            }
        };
        let transport = match connected {
            Ok(transport) => transport,
            Err(e) => {
                bound.close();
                return Err(e);
            }
        };

        let request = AuthRequest {
            auth: options.auth.clone(),
            rx: options.receive_bps,
        };
        let auth = match authenticate(&transport, &request, cancel).await {
            Ok(auth) => auth,
            Err(e) => {
                warn!("Handshake with {} failed: {}", addr, e);
                transport.close(CLOSE_CODE, b"");
                bound.close();
                return Err(e);
            }
        };

        let congestion = select_congestion_control(
            &auth,
            options.send_bps,
            options.initial_window,
            options.brutal_debug,
        );
        transport.set_congestion_control(congestion);

        info!(
            "Connected to {} (udp: {}, congestion: {:?})",
            addr, auth.udp_enabled, congestion
        );
        Ok(Session::start(
            transport,
            bound,
            auth.udp_enabled,
            options.udp_enabled && auth.udp_enabled,
        ))
    }

    /// One hopping tick; returns false when the loop should exit
    async fn hop(&self) -> bool {
        let pool = &self.options.server_addresses;
        let mut target = self.target.lock().await;
        let index = rand::thread_rng().gen_range(0..pool.len());
        target.addr = pool[index];
        target.index = index;

        if let Some(session) = self.live_session() {
            session.raw_socket().hop_to(target.addr);
            info!("Hopped to {}", target.addr);
            return true;
        }
        match self.options.hop_policy {
            HopPolicy::StopWhenIdle => false,
            HopPolicy::KeepRunning => {
                debug!("No live session; next session dials {}", target.addr);
                true
            }
        }
    }
}

async fn hop_loop(inner: Weak<ClientInner>, interval: Duration, cancel: CancellationToken) {
    let start = tokio::time::Instant::now() + interval;
    let mut ticker = tokio::time::interval_at(start, interval);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let Some(inner) = inner.upgrade() else {
            break;
        };
        if !inner.hop().await {
            break;
        }
    }
    info!("Exiting hop loop");
}

/// Tunnel client connection manager
pub struct Client {
    inner: Arc<ClientInner>,
    hop_task: Option<JoinHandle<()>>,
}

impl Client {
    /// Create a client. No connection is made until the first relay is
    /// requested. Must be called within a tokio runtime when hopping is
    /// configured.
    pub fn new(options: ClientOptions) -> Result<Self> {
        if options.hopping() {
            if options.hop_interval.is_zero() {
                return Err(TunnelError::config("hop interval must be positive"));
            }
            if options.server_address_index >= options.server_addresses.len() {
                return Err(TunnelError::config(format!(
                    "server address index {} out of range ({} addresses)",
                    options.server_address_index,
                    options.server_addresses.len()
                )));
            }
        }

        let target = Target {
            addr: options.server_address,
            index: options.server_address_index,
            attempts: 0,
            last_failure: None,
        };
        let inner = Arc::new(ClientInner {
            options,
            current: RwLock::new(None),
            target: Mutex::new(target),
            attempts: AtomicU64::new(0),
        });

        let hop_task = inner.options.hopping().then(|| {
            debug!(
                "Hopping across {} addresses every {:?}",
                inner.options.server_addresses.len(),
                inner.options.hop_interval
            );
            tokio::spawn(hop_loop(
                Arc::downgrade(&inner),
                inner.options.hop_interval,
                inner.options.cancel.clone(),
            ))
        });

        Ok(Self { inner, hop_task })
    }

    /// Return the live session, establishing one if needed.
    ///
    /// Concurrent callers share one attempt: all of them get the same
    /// session or a clone of the same error. An attempt aborted through the
    /// caller's own `cancel` is not shared.
    pub async fn acquire_session(&self, cancel: &CancellationToken) -> Result<Arc<Session>> {
        if let Some(session) = self.inner.live_session() {
            return Ok(session);
        }

        let queued_at = self.inner.attempts.load(Ordering::Acquire);
        let mut target = self.inner.target.lock().await;
        if let Some(session) = self.inner.live_session() {
            return Ok(session);
        }
        if target.attempts != queued_at {
            if let Some(err) = &target.last_failure {
                debug!("Sharing failed attempt: {}", err);
                return Err(err.clone());
            }
        }

        let result = self.inner.establish(target.addr, cancel).await;
        target.attempts += 1;
        self.inner.attempts.store(target.attempts, Ordering::Release);
        match result {
            Ok(session) => {
                target.last_failure = None;
                *self.inner.current.write() = Some(session.clone());
                Ok(session)
            }
            Err(e) => {
                target.last_failure = (!cancel.is_cancelled()).then(|| e.clone());
                Err(e)
            }
        }
    }

    /// Open a stream relay to `destination` (`host:port`)
    pub async fn dial_stream(
        &self,
        cancel: &CancellationToken,
        destination: impl Into<String>,
    ) -> Result<StreamRelay> {
        let session = self.acquire_session(cancel).await?;
        let stream = session.open_stream().await?;
        Ok(StreamRelay::new(stream, destination))
    }

    /// Open a datagram endpoint
    pub async fn listen_packet(&self, cancel: &CancellationToken) -> Result<DatagramEndpoint> {
        if !self.inner.options.udp_enabled {
            return Err(TunnelError::UdpDisabled);
        }
        let session = self.acquire_session(cancel).await?;
        DatagramEndpoint::open(
            &session,
            &self.inner.options.cancel,
            self.inner.options.udp_mtu,
        )
    }

    /// Tear down the current session, if any
    pub fn close_with_error(&self, err: TunnelError) {
        let session = self.inner.current.read().clone();
        if let Some(session) = session {
            session.close(err);
        }
    }

    /// The cached session, live or not
    pub fn current_session(&self) -> Option<Arc<Session>> {
        self.inner.current.read().clone()
    }

    /// Address the next session dials (and the live one sends to)
    pub async fn server_addr(&self) -> SocketAddr {
        self.inner.target.lock().await.addr
    }

    /// Pool index of [`Self::server_addr`]
    pub async fn server_address_index(&self) -> usize {
        self.inner.target.lock().await.index
    }

    /// Whether the hopping loop is still running
    pub fn is_hopping(&self) -> bool {
        self.hop_task
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    /// Options this client was built with
    pub fn options(&self) -> &ClientOptions {
        &self.inner.options
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        if let Some(task) = self.hop_task.take() {
            task.abort();
        }
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("options", &self.inner.options)
            .field("session", &self.inner.current.read().as_ref())
            .finish()
    }
}
