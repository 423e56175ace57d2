//! Relay framing, varints, fragmentation and auth header codecs for the tunnel client.
//!
//! This crate holds the pure encoders and decoders of the tunnel protocol. It
//! performs no I/O: the session crate feeds it bytes read from the transport
//! and writes out what it produces.
//!
//! ## Features
//!
//! - **QUIC varints**: length-prefixed fields use RFC 9000 variable-length integers
//! - **Stream relay frames**: one request and one response per relayed stream
//! - **Datagram relay frames**: session-id multiplexed messages with fragmentation
//! - **Auth headers**: credential / rate negotiation fields of the handshake
//! - **Padding**: random padding to blur handshake and request sizes
//!
//! ## Wire Format
//!
//! ```text
//! +----------------------+-----------------------------------------+
//! | stream request       | varint 0x401, addr, padding, payload... |
//! +----------------------+-----------------------------------------+
//! | stream response      | u8 status, message, padding, payload... |
//! +----------------------+-----------------------------------------+
//! | datagram message     | u32 sid, u16 pid, u8 fid, u8 fcount,    |
//! |                      | addr, payload                           |
//! +----------------------+-----------------------------------------+
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod auth;
pub mod error;
pub mod fragment;
pub mod frame;
pub mod padding;
pub mod varint;

// Re-export main types
pub use auth::{
    header, AuthRequest, AuthResponse, Headers, AUTH_METHOD, STATUS_AUTH_OK, URL_HOST, URL_PATH,
};
pub use error::WireError;
pub use fragment::{fragment, Defragger};
pub use frame::{
    TcpRequest, TcpResponse, UdpMessage, FRAME_TYPE_TCP_REQUEST, MAX_ADDRESS_LENGTH,
    MAX_MESSAGE_LENGTH, MAX_PADDING_LENGTH,
};
pub use varint::{get_varint, put_varint, varint_len, MAX_VARINT};
