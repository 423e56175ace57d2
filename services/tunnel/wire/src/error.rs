//! Wire protocol error types.

use thiserror::Error;

/// Wire protocol errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    /// Incomplete frame (need more data)
    #[error("incomplete frame")]
    Incomplete,

    /// Value does not fit in a QUIC variable-length integer
    #[error("varint out of range: {0}")]
    VarInt(u64),

    /// Length-prefixed field exceeds its protocol limit
    #[error("{field} too long: {len} > {max}")]
    TooLong {
        /// Field name
        field: &'static str,
        /// Observed length
        len: u64,
        /// Protocol limit
        max: u64,
    },

    /// Unexpected stream frame type
    #[error("unknown frame type {0:#x}")]
    FrameType(u64),

    /// Text field was not valid UTF-8
    #[error("invalid utf-8 in {0}")]
    Utf8(&'static str),

    /// Missing or malformed auth header
    #[error("invalid header {0}")]
    Header(&'static str),

    /// Fragment id/count combination is impossible
    #[error("invalid fragment {id}/{count}")]
    Fragment {
        /// Fragment index
        id: u8,
        /// Fragment count
        count: u8,
    },
}
