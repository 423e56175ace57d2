//! Authentication exchange encoded as request/response header fields.
//!
//! The client issues `POST https://hysteria/auth` carrying its credential and
//! desired receive rate; the server answers with status 233 plus the rate it
//! is willing to send at and whether datagram relaying is enabled.

use crate::padding;

/// Virtual host of the auth request
pub const URL_HOST: &str = "hysteria";
/// Path of the auth request
pub const URL_PATH: &str = "/auth";
/// Method of the auth request
pub const AUTH_METHOD: &str = "POST";
/// Response status signalling successful authentication
pub const STATUS_AUTH_OK: u16 = 233;

/// Credential header
pub const HEADER_AUTH: &str = "Hysteria-Auth";
/// Congestion-control receive rate header (bits/second or `auto`)
pub const HEADER_CC_RX: &str = "Hysteria-CC-RX";
/// Padding header
pub const HEADER_PADDING: &str = "Hysteria-Padding";
/// Datagram relay enabled header
pub const HEADER_UDP: &str = "Hysteria-UDP";

/// Value of [`HEADER_CC_RX`] asking the client to pick its own rate
pub const CC_RX_AUTO: &str = "auto";

/// Ordered header list, as carried by the request-style exchange
pub type Headers = Vec<(String, String)>;

/// Case-insensitive header lookup
pub fn header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .map(|(_, value)| value.as_str())
}

/// Client side of the exchange
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthRequest {
    /// Credential
    pub auth: String,
    /// Requested receive rate in bits/second (0 = unknown)
    pub rx: u64,
}

impl AuthRequest {
    /// Encode as headers, including random padding
    pub fn to_headers(&self) -> Headers {
        vec![
            (HEADER_AUTH.to_string(), self.auth.clone()),
            (HEADER_CC_RX.to_string(), self.rx.to_string()),
            (HEADER_PADDING.to_string(), padding::auth_request()),
        ]
    }

    /// Decode from headers; missing or malformed fields read as defaults
    #[cfg(test)]
    pub fn from_headers(headers: &[(String, String)]) -> Self {
        Self {
            auth: header(headers, HEADER_AUTH).unwrap_or_default().to_string(),
            rx: header(headers, HEADER_CC_RX)
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(0),
        }
    }
}

/// Server side of the exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AuthResponse {
    /// Whether the server relays datagrams for this session
    pub udp_enabled: bool,
    /// Rate the server grants for client sends, bits/second (0 = unlimited)
    pub rx: u64,
    /// Server asks the client to adapt its rate on its own
    pub rx_auto: bool,
}

impl AuthResponse {
    /// Encode as headers, including random padding
    pub fn to_headers(&self) -> Headers {
        let rx = if self.rx_auto {
            CC_RX_AUTO.to_string()
        } else {
            self.rx.to_string()
        };
        vec![
            (HEADER_UDP.to_string(), self.udp_enabled.to_string()),
            (HEADER_CC_RX.to_string(), rx),
            (HEADER_PADDING.to_string(), padding::auth_request()),
        ]
    }

    /// Decode from headers; missing or malformed fields read as defaults
    pub fn from_headers(headers: &[(String, String)]) -> Self {
        let udp_enabled = header(headers, HEADER_UDP)
            .map(|v| v.trim().eq_ignore_ascii_case("true") || v.trim() == "1")
            .unwrap_or(false);
        let (rx, rx_auto) = match header(headers, HEADER_CC_RX).map(str::trim) {
            Some(v) if v.eq_ignore_ascii_case(CC_RX_AUTO) => (0, true),
            Some(v) => (v.parse().unwrap_or(0), false),
            None => (0, false),
        };
        Self {
            udp_enabled,
            rx,
            rx_auto,
        }
    }
}
