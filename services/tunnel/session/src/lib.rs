//! Connection management, auth handshake, stream/datagram relays and
//! obfuscation for the tunnel client.
//!
//! The client multiplexes any number of relayed TCP streams and UDP flows over
//! one authenticated, encrypted transport session. The transport itself (and
//! the HTTP-style exchange used for authentication) is supplied by the caller
//! through the [`Connector`] and [`Transport`] traits.
//!
//! ## Features
//!
//! - **Lazy single-flight sessions**: the first relay request dials and
//!   authenticates; concurrent callers share the result
//! - **Address hopping**: the raw socket is re-pointed across a server pool
//!   without a new handshake
//! - **Stream relays**: request/response framing hidden behind
//!   `AsyncRead`/`AsyncWrite`
//! - **Datagram relays**: session-id multiplexing, fragmentation, deadlines
//! - **Salamander obfuscation**: salted XOR scrambling beneath the transport
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tokio::io::{AsyncReadExt, AsyncWriteExt};
//! use tokio_util::sync::CancellationToken;
//! use tunnel_session::{Client, ClientOptions, Connector, UdpDialer};
//!
//! # async fn example(connector: Arc<dyn Connector>) -> anyhow::Result<()> {
//! let server = "203.0.113.7:443".parse()?;
//! let options = ClientOptions::new(server, "password", Arc::new(UdpDialer), connector);
//! let client = Client::new(options)?;
//!
//! let cancel = CancellationToken::new();
//! let mut stream = client.dial_stream(&cancel, "example.com:80").await?;
//! stream.write_all(b"GET / HTTP/1.0\r\n\r\n").await?;
//! let mut response = Vec::new();
//! stream.read_to_end(&mut response).await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod client;
pub mod datagram;
pub mod error;
pub mod handshake;
pub mod obfs;
pub mod session;
pub mod stream;
pub mod transport;

#[cfg(test)]
mod mock;

// Re-export main types
pub use client::{Client, ClientOptions, HopPolicy, DEFAULT_HOP_INTERVAL, DEFAULT_UDP_MTU};
pub use datagram::{DatagramEndpoint, PacketBuffer, ReadWaitOptions, INBOUND_QUEUE_CAPACITY};
pub use error::{Result, TransportError, TunnelError};
pub use handshake::{authenticate, select_congestion_control};
pub use obfs::{deobfuscate, obfuscate, SalamanderSocket, OBFS_SALAMANDER, SALT_LEN};
pub use session::{Delivery, Session};
pub use stream::StreamRelay;
pub use transport::{
    BoundSocket, CongestionControl, Connector, Dialer, HttpRequest, HttpResponse, PacketSocket,
    Transport, TransportParams, TransportStream, UdpDialer, UdpPacketSocket,
};
