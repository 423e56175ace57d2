//! Authentication round trip and congestion-control selection.
//!
//! Right after the transport comes up the client performs exactly one
//! request/response exchange carrying its credential and desired receive
//! rate. The server's answer decides whether datagrams are relayed and which
//! congestion strategy the transport should run.

use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use tunnel_wire::{AuthRequest, AuthResponse, AUTH_METHOD, STATUS_AUTH_OK, URL_HOST, URL_PATH};

use crate::error::{Result, TunnelError};
use crate::transport::{CongestionControl, HttpRequest, Transport};

/// Authenticate over `transport`.
///
/// Any failure is returned as-is; tearing down the transport and the raw
/// socket is the caller's job.
pub async fn authenticate(
    transport: &Arc<dyn Transport>,
    request: &AuthRequest,
    cancel: &CancellationToken,
) -> Result<AuthResponse> {
    let http = HttpRequest {
        method: AUTH_METHOD.to_string(),
        host: URL_HOST.to_string(),
        path: URL_PATH.to_string(),
        headers: request.to_headers(),
    };

    let response = tokio::select! {
        _ = cancel.cancelled() => {
            debug!("Authentication cancelled");
            return Err(TunnelError::Closed);
        }
        result = transport.round_trip(http) => {
            result.map_err(|e| TunnelError::Handshake(e.to_string()))?
        }
    };

    if response.status != STATUS_AUTH_OK {
        warn!("Server rejected authentication (status {})", response.status);
        return Err(TunnelError::Auth {
            status: response.status,
        });
    }

    let auth = AuthResponse::from_headers(&response.headers);
    debug!(
        "Authenticated (udp: {}, rx: {}, auto: {})",
        auth.udp_enabled, auth.rx, auth.rx_auto
    );
    Ok(auth)
}

/// Pick the congestion strategy for a successful auth response.
///
/// A fixed rate granted by the server (and not flagged auto) selects
/// rate pacing, capped by the local `send_bps` when that is non-zero;
/// everything else selects the loss-adaptive controller.
pub fn select_congestion_control(
    response: &AuthResponse,
    send_bps: u64,
    initial_window: Option<usize>,
    debug: bool,
) -> CongestionControl {
    if !response.rx_auto && response.rx != 0 {
        let bps = if send_bps != 0 {
            response.rx.min(send_bps)
        } else {
            response.rx
        };
        CongestionControl::RatePaced { bps, debug }
    } else {
        CongestionControl::AdaptiveLoss { initial_window }
    }
}
