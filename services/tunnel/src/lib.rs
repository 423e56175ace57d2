//! Bootstrap layer for the tunnel client.
//!
//! Loads a [`TunnelConfig`] from YAML plus `TUNNEL_*` environment variables,
//! installs the log formatter, and builds a [`tunnel_session::Client`] from
//! the result. The transport itself is supplied by the embedding program.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod logging;

pub use config::{
    parse_bandwidth, parse_server, BandwidthConfig, HopPolicySetting, ObfsConfig, ServerSpec,
    TlsConfig, TransportConfig, TunnelConfig,
};
pub use logging::{build_filter, init_logging, TunnelLogFormatter};
pub use tunnel_session;
pub use tunnel_wire;
