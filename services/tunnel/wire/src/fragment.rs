//! Datagram fragmentation for payloads larger than the transport's
//! unreliable-message limit.
//!
//! A payload is split into at most 255 fragments that share one packet id.
//! The receiver keeps only the packet it is currently assembling: a fragment
//! from a different packet id discards the partial one.

use crate::error::WireError;
use crate::frame::UdpMessage;
use bytes::{Bytes, BytesMut};
use tracing::trace;

/// Split `message` so every fragment encodes to at most `max_size` bytes.
///
/// A message that already fits is returned unchanged as the only element.
pub fn fragment(message: &UdpMessage, max_size: usize) -> Result<Vec<UdpMessage>, WireError> {
    if message.encoded_size() <= max_size {
        return Ok(vec![message.clone()]);
    }

    let header = message.header_size();
    if max_size <= header {
        return Err(WireError::TooLong {
            field: "datagram header",
            len: header as u64,
            max: max_size as u64,
        });
    }

    let per_fragment = max_size - header;
    let total = message.payload.len().div_ceil(per_fragment);
    if total > u8::MAX as usize {
        return Err(WireError::TooLong {
            field: "datagram payload",
            len: message.payload.len() as u64,
            max: (per_fragment * u8::MAX as usize) as u64,
        });
    }

    let mut fragments = Vec::with_capacity(total);
    let mut offset = 0;
    for fragment_id in 0..total {
        let end = std::cmp::min(offset + per_fragment, message.payload.len());
        fragments.push(UdpMessage {
            session_id: message.session_id,
            packet_id: message.packet_id,
            fragment_id: fragment_id as u8,
            fragment_count: total as u8,
            address: message.address.clone(),
            payload: message.payload.slice(offset..end),
        });
        offset = end;
    }
    Ok(fragments)
}

/// Reassembler for fragments of one packet at a time
#[derive(Debug, Default)]
pub struct Defragger {
    packet_id: u16,
    fragments: Vec<Option<Bytes>>,
    received: usize,
    size: usize,
}

impl Defragger {
    /// Create an empty reassembler
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one message; returns the complete message once all fragments
    /// of its packet have arrived.
    pub fn feed(&mut self, message: UdpMessage) -> Option<UdpMessage> {
        if message.fragment_count <= 1 {
            return Some(message);
        }
        let id = message.fragment_id as usize;
        let count = message.fragment_count as usize;
        if id >= count {
            return None;
        }

        if message.packet_id != self.packet_id || self.fragments.len() != count {
            if self.received > 0 {
                trace!(
                    "Discarding partial packet {} ({} fragments received)",
                    self.packet_id,
                    self.received
                );
            }
            self.packet_id = message.packet_id;
            self.fragments = vec![None; count];
            self.received = 0;
            self.size = 0;
        }

        if self.fragments[id].is_none() {
            self.size += message.payload.len();
            self.received += 1;
            self.fragments[id] = Some(message.payload.clone());
        }

        if self.received < count {
            return None;
        }

        let mut payload = BytesMut::with_capacity(self.size);
        for part in self.fragments.drain(..).flatten() {
            payload.extend_from_slice(&part);
        }
        self.received = 0;
        self.size = 0;

        Some(UdpMessage {
            fragment_id: 0,
            fragment_count: 1,
            payload: payload.freeze(),
            ..message
        })
    }
}
