//! Relay frames carried inside the encrypted transport.
//!
//! Stream relays open with one request frame and read back one response
//! frame; datagram relays wrap every payload in a [`UdpMessage`].
//!
//! ```text
//! TCP request   varint 0x401 | varint addr_len | addr | varint pad_len | pad
//! TCP response  u8 status    | varint msg_len  | msg  | varint pad_len | pad
//! UDP message   u32 session_id | u16 packet_id | u8 frag_id | u8 frag_count
//!               | varint addr_len | addr | payload
//! ```

use crate::error::WireError;
use crate::padding;
use crate::varint::{get_varint, put_varint, varint_len};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Stream frame type announcing a relay request
pub const FRAME_TYPE_TCP_REQUEST: u64 = 0x401;

/// Maximum destination address length in bytes
pub const MAX_ADDRESS_LENGTH: usize = 2048;
/// Maximum error message length in a stream response
pub const MAX_MESSAGE_LENGTH: usize = 2048;
/// Maximum padding length in any frame
pub const MAX_PADDING_LENGTH: usize = 4096;

/// Status byte signalling an accepted relay request
pub const TCP_RESPONSE_OK: u8 = 0x00;
/// Status byte signalling a rejected relay request
pub const TCP_RESPONSE_ERROR: u8 = 0x01;

/// Fixed part of the UDP message header (before the address varint)
pub const UDP_FIXED_HEADER_SIZE: usize = 4 + 2 + 1 + 1;

fn check_len(field: &'static str, len: u64, max: usize) -> Result<usize, WireError> {
    if len > max as u64 {
        return Err(WireError::TooLong {
            field,
            len,
            max: max as u64,
        });
    }
    Ok(len as usize)
}

fn take_bytes<'a>(buf: &mut &'a [u8], len: usize) -> Result<&'a [u8], WireError> {
    if buf.len() < len {
        return Err(WireError::Incomplete);
    }
    let (head, tail) = buf.split_at(len);
    *buf = tail;
    Ok(head)
}

fn into_option<T>(result: Result<T, WireError>) -> Result<Option<T>, WireError> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(WireError::Incomplete) => Ok(None),
        Err(e) => Err(e),
    }
}

/// Relay request sent as the first bytes of a stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpRequest {
    /// Destination in `host:port` form
    pub address: String,
}

impl TcpRequest {
    /// Create a request for `address`
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
        }
    }

    /// Encode the request with random padding, followed by `payload`.
    ///
    /// The result is meant to go out as a single stream write.
    pub fn encode_with_payload(&self, payload: &[u8]) -> Result<Bytes, WireError> {
        let addr = self.address.as_bytes();
        check_len("address", addr.len() as u64, MAX_ADDRESS_LENGTH)?;
        let pad = padding::tcp_request();

        let mut buf = BytesMut::with_capacity(
            varint_len(FRAME_TYPE_TCP_REQUEST)
                + varint_len(addr.len() as u64)
                + addr.len()
                + varint_len(pad.len() as u64)
                + pad.len()
                + payload.len(),
        );
        put_varint(&mut buf, FRAME_TYPE_TCP_REQUEST)?;
        put_varint(&mut buf, addr.len() as u64)?;
        buf.put_slice(addr);
        put_varint(&mut buf, pad.len() as u64)?;
        buf.put_slice(&pad);
        buf.put_slice(payload);
        Ok(buf.freeze())
    }

    /// Decode a request from the front of `data`, as the relay end reads it.
    ///
    /// Returns the request and the number of bytes it occupied, or `None`
    /// when more data is needed. The client itself only encodes requests.
    pub fn decode(data: &[u8]) -> Result<Option<(Self, usize)>, WireError> {
        let mut cursor = data;
        let parsed = into_option((|| -> Result<Self, WireError> {
            let typ = get_varint(&mut cursor)?;
            if typ != FRAME_TYPE_TCP_REQUEST {
                return Err(WireError::FrameType(typ));
            }
            let addr_len = check_len("address", get_varint(&mut cursor)?, MAX_ADDRESS_LENGTH)?;
            let addr = take_bytes(&mut cursor, addr_len)?;
            let address = std::str::from_utf8(addr)
                .map_err(|_| WireError::Utf8("address"))?
                .to_string();
            let pad_len = check_len("padding", get_varint(&mut cursor)?, MAX_PADDING_LENGTH)?;
            take_bytes(&mut cursor, pad_len)?;
            Ok(Self { address })
        })())?;
        Ok(parsed.map(|req| (req, data.len() - cursor.len())))
    }
}

/// Relay response read back before the first payload byte
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpResponse {
    /// Whether the remote accepted the relay request
    pub ok: bool,
    /// Error text supplied by the remote (empty on success)
    pub message: String,
}

impl TcpResponse {
    /// Successful response
    pub fn ok() -> Self {
        Self {
            ok: true,
            message: String::new(),
        }
    }

    /// Failed response carrying `message`
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            message: message.into(),
        }
    }

    /// Encode the response with random padding
    pub fn encode(&self) -> Result<Bytes, WireError> {
        let msg = self.message.as_bytes();
        check_len("message", msg.len() as u64, MAX_MESSAGE_LENGTH)?;
        let pad = padding::tcp_response();

        let mut buf = BytesMut::with_capacity(
            1 + varint_len(msg.len() as u64) + msg.len() + varint_len(pad.len() as u64) + pad.len(),
        );
        buf.put_u8(if self.ok {
            TCP_RESPONSE_OK
        } else {
            TCP_RESPONSE_ERROR
        });
        put_varint(&mut buf, msg.len() as u64)?;
        buf.put_slice(msg);
        put_varint(&mut buf, pad.len() as u64)?;
        buf.put_slice(&pad);
        Ok(buf.freeze())
    }

    /// Decode a response from the front of `data`.
    ///
    /// Returns the response and the number of bytes it occupied, or `None`
    /// when more data is needed. Bytes past the returned length belong to
    /// the relayed payload.
    pub fn decode(data: &[u8]) -> Result<Option<(Self, usize)>, WireError> {
        let mut cursor = data;
        let parsed = into_option((|| -> Result<Self, WireError> {
            if cursor.is_empty() {
                return Err(WireError::Incomplete);
            }
            let status = cursor.get_u8();
            let msg_len = check_len("message", get_varint(&mut cursor)?, MAX_MESSAGE_LENGTH)?;
            let msg = take_bytes(&mut cursor, msg_len)?;
            let message = String::from_utf8_lossy(msg).into_owned();
            let pad_len = check_len("padding", get_varint(&mut cursor)?, MAX_PADDING_LENGTH)?;
            take_bytes(&mut cursor, pad_len)?;
            Ok(Self {
                ok: status == TCP_RESPONSE_OK,
                message,
            })
        })())?;
        Ok(parsed.map(|resp| (resp, data.len() - cursor.len())))
    }
}

/// Datagram relay frame carried over the transport's unreliable channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdpMessage {
    /// Datagram endpoint the message belongs to
    pub session_id: u32,
    /// Packet id shared by all fragments of one payload
    pub packet_id: u16,
    /// Index of this fragment
    pub fragment_id: u8,
    /// Total number of fragments (1 when unfragmented)
    pub fragment_count: u8,
    /// Destination on send, source on receive, `host:port`
    pub address: String,
    /// Payload bytes
    pub payload: Bytes,
}

impl UdpMessage {
    /// Unfragmented message
    pub fn new(session_id: u32, address: impl Into<String>, payload: Bytes) -> Self {
        Self {
            session_id,
            packet_id: 0,
            fragment_id: 0,
            fragment_count: 1,
            address: address.into(),
            payload,
        }
    }

    /// Size of everything but the payload
    pub fn header_size(&self) -> usize {
        UDP_FIXED_HEADER_SIZE + varint_len(self.address.len() as u64) + self.address.len()
    }

    /// Total encoded size
    pub fn encoded_size(&self) -> usize {
        self.header_size() + self.payload.len()
    }

    /// Encode to a contiguous buffer
    pub fn encode(&self) -> Result<Bytes, WireError> {
        check_len("address", self.address.len() as u64, MAX_ADDRESS_LENGTH)?;
        let mut buf = BytesMut::with_capacity(self.encoded_size());
        buf.put_u32(self.session_id);
        buf.put_u16(self.packet_id);
        buf.put_u8(self.fragment_id);
        buf.put_u8(self.fragment_count);
        put_varint(&mut buf, self.address.len() as u64)?;
        buf.put_slice(self.address.as_bytes());
        buf.put_slice(&self.payload);
        Ok(buf.freeze())
    }

    /// Decode one message; the payload is a zero-copy slice of `data`
    pub fn decode(data: Bytes) -> Result<Self, WireError> {
        let mut cursor = &data[..];
        if cursor.len() < UDP_FIXED_HEADER_SIZE {
            return Err(WireError::Incomplete);
        }
        let session_id = cursor.get_u32();
        let packet_id = cursor.get_u16();
        let fragment_id = cursor.get_u8();
        let fragment_count = cursor.get_u8();
        if fragment_count == 0 || fragment_id >= fragment_count {
            return Err(WireError::Fragment {
                id: fragment_id,
                count: fragment_count,
            });
        }
        let addr_len = check_len("address", get_varint(&mut cursor)?, MAX_ADDRESS_LENGTH)?;
        let addr = take_bytes(&mut cursor, addr_len)?;
        let address = std::str::from_utf8(addr)
            .map_err(|_| WireError::Utf8("address"))?
            .to_string();
        let offset = data.len() - cursor.len();
        Ok(Self {
            session_id,
            packet_id,
            fragment_id,
            fragment_count,
            address,
            payload: data.slice(offset..),
        })
    }
}
