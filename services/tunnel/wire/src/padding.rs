//! Random padding attached to handshake and relay frames.
//!
//! Padding only blurs frame sizes; receivers skip it without inspecting it.

use rand::distributions::Alphanumeric;
use rand::Rng;
use std::ops::RangeInclusive;

/// Padding length range for the auth request headers
pub const AUTH_REQUEST_PADDING: RangeInclusive<usize> = 256..=2048;
/// Padding length range for stream request frames
pub const TCP_REQUEST_PADDING: RangeInclusive<usize> = 64..=512;
/// Padding length range for stream response frames
pub const TCP_RESPONSE_PADDING: RangeInclusive<usize> = 128..=1024;

/// Random printable padding with a length drawn from `range`
pub fn random_padding(range: RangeInclusive<usize>) -> Vec<u8> {
    let mut rng = rand::thread_rng();
    let len = rng.gen_range(range);
    (&mut rng).sample_iter(&Alphanumeric).take(len).collect()
}

/// Padding for an auth request header value
pub fn auth_request() -> String {
    // Alphanumeric output is always valid UTF-8
    String::from_utf8_lossy(&random_padding(AUTH_REQUEST_PADDING)).into_owned()
}

/// Padding for a stream request frame
pub fn tcp_request() -> Vec<u8> {
    random_padding(TCP_REQUEST_PADDING)
}

/// Padding for a stream response frame
pub fn tcp_response() -> Vec<u8> {
    random_padding(TCP_RESPONSE_PADDING)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_padding_lengths_in_range() {
        for _ in 0..32 {
            let pad = tcp_request();
            assert!(TCP_REQUEST_PADDING.contains(&pad.len()));
            assert!(pad.iter().all(u8::is_ascii_alphanumeric));

            let header = auth_request();
            assert!(AUTH_REQUEST_PADDING.contains(&header.len()));
        }
    }
}
