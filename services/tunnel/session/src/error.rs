//! Error types for the tunnel client runtime.

use std::io;
use std::sync::Arc;
use thiserror::Error;
use tunnel_wire::WireError;

/// Failures reported by the encrypted transport collaborator
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Connection was closed locally or by the peer
    #[error("connection closed: {0}")]
    ConnectionClosed(String),

    /// Connection timed out (idle timeout or handshake timeout)
    #[error("connection timed out")]
    TimedOut,

    /// Unreliable messages were not negotiated for this connection
    #[error("datagrams unsupported by peer")]
    DatagramsUnsupported,

    /// Unreliable message exceeds the current size limit
    #[error("datagram too large (limit {0})")]
    DatagramTooLarge(usize),

    /// Any other transport failure
    #[error("transport error: {0}")]
    Other(String),
}

/// Errors surfaced by the tunnel client.
///
/// Cloneable so one failed session attempt can be reported to every caller
/// that waited on it.
#[derive(Error, Debug, Clone)]
pub enum TunnelError {
    /// Raw socket creation or bind failed
    #[error("dial failed: {0}")]
    Dial(#[source] Arc<io::Error>),

    /// Transport establishment or round trip failed
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Server rejected the credential
    #[error("authentication failed, status code: {status}")]
    Auth {
        /// Status code returned by the server
        status: u16,
    },

    /// Auth round trip failed before a status was received
    #[error("authentication failed: {0}")]
    Handshake(String),

    /// Remote refused a stream relay request
    #[error("remote error: {0}")]
    Remote(String),

    /// Session was torn down before or during the operation
    #[error("connection not active")]
    NotActive,

    /// Datagram relay disabled in the local configuration
    #[error("UDP relay disabled")]
    UdpDisabled,

    /// Datagram relay disabled by the server
    #[error("UDP disabled by server")]
    UdpDisabledByServer,

    /// Read deadline elapsed
    #[error("i/o timeout")]
    Timeout,

    /// Endpoint closed or its context cancelled
    #[error("io: read/write on closed pipe")]
    Closed,

    /// Datagram payload cannot fit in the fragment limit
    #[error("message too large: {size} bytes (max {max})")]
    MessageTooLarge {
        /// Payload size
        size: usize,
        /// Largest payload that fragmentation can carry
        max: usize,
    },

    /// Relay frame could not be encoded or decoded
    #[error("wire error: {0}")]
    Wire(#[from] WireError),

    /// Invalid client configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// Socket I/O error
    #[error("network error: {0}")]
    Io(#[source] Arc<io::Error>),
}

impl From<io::Error> for TunnelError {
    fn from(err: io::Error) -> Self {
        TunnelError::Io(Arc::new(err))
    }
}

impl TunnelError {
    /// Raw socket creation failed
    pub fn dial(err: io::Error) -> Self {
        TunnelError::Dial(Arc::new(err))
    }

    /// Create a new configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        TunnelError::Config(msg.into())
    }

    /// Check if this error is a deadline expiry
    pub fn is_timeout(&self) -> bool {
        matches!(self, TunnelError::Timeout)
    }

    /// Check if this error indicates a closed endpoint or cancelled context
    pub fn is_closed(&self) -> bool {
        matches!(self, TunnelError::Closed | TunnelError::NotActive)
    }

    /// Check if this error indicates authentication failure
    pub fn is_auth_failure(&self) -> bool {
        matches!(self, TunnelError::Auth { .. } | TunnelError::Handshake(_))
    }
}

impl From<TunnelError> for io::Error {
    fn from(err: TunnelError) -> Self {
        let kind = match &err {
            TunnelError::Io(e) => e.kind(),
            TunnelError::Dial(e) => e.kind(),
            TunnelError::Timeout => io::ErrorKind::TimedOut,
            TunnelError::Closed => io::ErrorKind::BrokenPipe,
            TunnelError::NotActive => io::ErrorKind::NotConnected,
            TunnelError::Auth { .. } | TunnelError::Handshake(_) => io::ErrorKind::PermissionDenied,
            TunnelError::MessageTooLarge { .. } => io::ErrorKind::InvalidInput,
            TunnelError::Wire(_) => io::ErrorKind::InvalidData,
            TunnelError::Config(_) | TunnelError::UdpDisabled | TunnelError::UdpDisabledByServer => {
                io::ErrorKind::Unsupported
            }
            TunnelError::Transport(_) | TunnelError::Remote(_) => io::ErrorKind::Other,
        };
        io::Error::new(kind, err)
    }
}

/// Result type alias for tunnel operations
pub type Result<T> = std::result::Result<T, TunnelError>;
