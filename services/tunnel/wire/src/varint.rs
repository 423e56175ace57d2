//! QUIC variable-length integers (RFC 9000 §16).
//!
//! The two most significant bits of the first byte select a 1, 2, 4 or 8 byte
//! encoding; the remaining bits carry the value in network byte order.

use crate::error::WireError;
use bytes::{Buf, BufMut};

/// Largest value a varint can carry (2^62 - 1)
pub const MAX_VARINT: u64 = (1 << 62) - 1;

/// Number of bytes `value` occupies once encoded
pub fn varint_len(value: u64) -> usize {
    if value <= 63 {
        1
    } else if value <= 16_383 {
        2
    } else if value <= 1_073_741_823 {
        4
    } else {
        8
    }
}

/// Append `value` as a varint
pub fn put_varint<B: BufMut>(buf: &mut B, value: u64) -> Result<(), WireError> {
    if value > MAX_VARINT {
        return Err(WireError::VarInt(value));
    }
    match varint_len(value) {
        1 => buf.put_u8(value as u8),
        2 => buf.put_u16(0x4000 | value as u16),
        4 => buf.put_u32(0x8000_0000 | value as u32),
        _ => buf.put_u64(0xC000_0000_0000_0000 | value),
    }
    Ok(())
}

/// Read a varint from the front of `buf`, advancing past it.
///
/// Returns [`WireError::Incomplete`] without consuming anything when the
/// buffer holds only part of the encoding.
pub fn get_varint<B: Buf>(buf: &mut B) -> Result<u64, WireError> {
    if !buf.has_remaining() {
        return Err(WireError::Incomplete);
    }
    let first = buf.chunk()[0];
    let len = 1usize << (first >> 6);
    if buf.remaining() < len {
        return Err(WireError::Incomplete);
    }
    let value = match len {
        1 => u64::from(buf.get_u8() & 0x3F),
        2 => u64::from(buf.get_u16() & 0x3FFF),
        4 => u64::from(buf.get_u32() & 0x3FFF_FFFF),
        _ => buf.get_u64() & 0x3FFF_FFFF_FFFF_FFFF,
    };
    Ok(value)
}
