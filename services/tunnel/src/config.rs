//! Configuration handling for the tunnel client.
//!
//! Configuration is read from a YAML file, overridden from `TUNNEL_*`
//! environment variables, validated, and finally turned into the
//! [`ClientOptions`] consumed by the connection manager.

use anyhow::{anyhow, bail, Context, Result};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tunnel_session::transport::{
    DEFAULT_CONN_RECEIVE_WINDOW, DEFAULT_KEEP_ALIVE_PERIOD, DEFAULT_MAX_IDLE_TIMEOUT,
    DEFAULT_STREAM_RECEIVE_WINDOW,
};
use tunnel_session::{
    Client, ClientOptions, Connector, Dialer, HopPolicy, TransportParams, DEFAULT_HOP_INTERVAL,
    DEFAULT_UDP_MTU, OBFS_SALAMANDER,
};

use crate::{component_info, component_warn};

/// Shortest accepted hopping interval
pub const MIN_HOP_INTERVAL: Duration = Duration::from_secs(5);
/// Smallest accepted datagram MTU
pub const MIN_UDP_MTU: usize = 256;
/// Largest accepted datagram MTU
pub const MAX_UDP_MTU: usize = 65535;

/// Environment variable overriding [`TunnelConfig::server`]
pub const ENV_SERVER: &str = "TUNNEL_SERVER";
/// Environment variable overriding [`TunnelConfig::auth`]
pub const ENV_AUTH: &str = "TUNNEL_AUTH";
/// Environment variable overriding the obfuscation password
pub const ENV_OBFS_PASSWORD: &str = "TUNNEL_OBFS_PASSWORD";
/// Environment variable overriding the upload bandwidth
pub const ENV_UP: &str = "TUNNEL_UP";
/// Environment variable overriding the download bandwidth
pub const ENV_DOWN: &str = "TUNNEL_DOWN";

mod duration_str {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*value).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        humantime::parse_duration(raw.trim()).map_err(serde::de::Error::custom)
    }
}

/// Tunnel client configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TunnelConfig {
    /// Server as `host:port` or `host:port1,port2-port3` for a hopping pool
    pub server: String,
    /// Authentication credential
    pub auth: String,
    /// Datagram obfuscation
    pub obfs: Option<ObfsConfig>,
    /// TLS settings
    pub tls: TlsConfig,
    /// Bandwidth hints
    pub bandwidth: BandwidthConfig,
    /// Transport tuning
    pub transport: TransportConfig,
    /// Address hopping interval
    #[serde(with = "duration_str")]
    pub hop_interval: Duration,
    /// Idle-tick behaviour of the hopping loop
    pub hop_policy: HopPolicySetting,
    /// Relay UDP
    pub udp: bool,
    /// Largest datagram message, framing included
    pub udp_mtu: usize,
    /// Initial congestion window override in packets
    pub initial_window: Option<usize>,
    /// Rate-paced congestion controller diagnostics
    pub brutal_debug: bool,
}

/// Datagram obfuscation settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObfsConfig {
    /// Obfuscation type; only `salamander` is known
    #[serde(rename = "type", default = "default_obfs_type")]
    pub kind: String,
    /// Obfuscation password
    pub password: String,
}

fn default_obfs_type() -> String {
    OBFS_SALAMANDER.to_string()
}

/// TLS configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    /// Server name; defaults to the server host
    pub sni: Option<String>,
    /// Skip certificate verification
    pub insecure: bool,
    /// ALPN protocols; `h3` when empty
    pub alpn: Vec<String>,
}

/// Bandwidth hints, e.g. `"100 mbps"`; empty means unknown
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BandwidthConfig {
    /// Upload (send) bandwidth
    pub up: String,
    /// Download (receive) bandwidth
    pub down: String,
}

/// Transport tuning
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Idle timeout
    #[serde(with = "duration_str")]
    pub idle_timeout: Duration,
    /// Keep-alive period
    #[serde(with = "duration_str")]
    pub keep_alive: Duration,
    /// Per-stream receive window in bytes
    pub stream_receive_window: u64,
    /// Connection receive window in bytes
    pub conn_receive_window: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            idle_timeout: DEFAULT_MAX_IDLE_TIMEOUT,
            keep_alive: DEFAULT_KEEP_ALIVE_PERIOD,
            stream_receive_window: DEFAULT_STREAM_RECEIVE_WINDOW,
            conn_receive_window: DEFAULT_CONN_RECEIVE_WINDOW,
        }
    }
}

/// Serializable form of [`HopPolicy`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HopPolicySetting {
    /// Stop hopping for good once a tick finds no live session
    #[default]
    StopWhenIdle,
    /// Keep hopping across sessions
    KeepRunning,
}

impl From<HopPolicySetting> for HopPolicy {
    fn from(setting: HopPolicySetting) -> Self {
        match setting {
            HopPolicySetting::StopWhenIdle => HopPolicy::StopWhenIdle,
            HopPolicySetting::KeepRunning => HopPolicy::KeepRunning,
        }
    }
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            server: String::new(),
            auth: String::new(),
            obfs: None,
            tls: TlsConfig::default(),
            bandwidth: BandwidthConfig::default(),
            transport: TransportConfig::default(),
            hop_interval: DEFAULT_HOP_INTERVAL,
            hop_policy: HopPolicySetting::default(),
            udp: true,
            udp_mtu: DEFAULT_UDP_MTU,
            initial_window: None,
            brutal_debug: false,
        }
    }
}

/// Server host plus the ports it listens on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerSpec {
    /// Host name or IP literal (without brackets)
    pub host: String,
    /// One port, or the hopping pool in configured order
    pub ports: Vec<u16>,
}

/// Parse `host:port` or `host:port1,port2-port3`
pub fn parse_server(server: &str) -> Result<ServerSpec> {
    let server = server.trim();
    let (host, ports) = server
        .rsplit_once(':')
        .ok_or_else(|| anyhow!("server {:?} has no port", server))?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        bail!("server {:?} has no host", server);
    }

    let mut parsed = Vec::new();
    for item in ports.split(',') {
        let item = item.trim();
        let (start, end) = match item.split_once('-') {
            Some((start, end)) => (start.trim(), end.trim()),
            None => (item, item),
        };
        let start: u16 = start
            .parse()
            .with_context(|| format!("invalid port {:?}", item))?;
        let end: u16 = end
            .parse()
            .with_context(|| format!("invalid port {:?}", item))?;
        if start == 0 || start > end {
            bail!("invalid port range {:?}", item);
        }
        for port in start..=end {
            if !parsed.contains(&port) {
                parsed.push(port);
            }
        }
    }

    Ok(ServerSpec {
        host: host.to_string(),
        ports: parsed,
    })
}

/// Parse a bandwidth string into bits/second.
///
/// Accepts a bare number (bits/second) or a number followed by `bps`,
/// `kbps`, `mbps`, `gbps` or `tbps` (also `b`, `k`, `kb`, ...), decimal
/// multiples, case-insensitive. An empty string means unknown (0).
pub fn parse_bandwidth(value: &str) -> Result<u64> {
    let value = value.trim().to_ascii_lowercase();
    if value.is_empty() {
        return Ok(0);
    }
    let split = value
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(value.len());
    let (number, unit) = value.split_at(split);
    let number: f64 = number
        .parse()
        .with_context(|| format!("invalid bandwidth {:?}", value))?;
    let multiplier: f64 = match unit.trim() {
        "" | "b" | "bps" => 1.0,
        "k" | "kb" | "kbps" => 1e3,
        "m" | "mb" | "mbps" => 1e6,
        "g" | "gb" | "gbps" => 1e9,
        "t" | "tb" | "tbps" => 1e12,
        other => bail!("unknown bandwidth unit {:?}", other),
    };
    Ok((number * multiplier) as u64)
}

impl TunnelConfig {
    /// Load configuration from file and environment variables.
    ///
    /// A missing file is not an error: defaults plus environment overrides
    /// are used instead.
    pub fn load_from_file<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let path = config_path.as_ref();
        let mut config = match std::fs::read_to_string(path) {
            Ok(content) => {
                let config: Self = serde_yaml::from_str(&content)
                    .with_context(|| format!("failed to parse config file {:?}", path))?;
                component_info!("config", "Loaded configuration from {:?}", path);
                config
            }
            Err(_) => {
                component_warn!("config", "Config file {:?} not found, using defaults", path);
                Self::default()
            }
        };

        config.apply_environment_overrides();
        config.validate()?;

        component_info!(
            "config",
            "Final tunnel configuration: server={}, udp={}, obfs={}, hop_interval={:?}",
            config.server,
            config.udp,
            config.obfs.is_some(),
            config.hop_interval
        );
        Ok(config)
    }

    /// Apply `TUNNEL_*` environment variable overrides
    pub fn apply_environment_overrides(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }

    /// Apply overrides from any variable source
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(server) = lookup(ENV_SERVER) {
            component_info!("config", "Server overridden by environment: {}", server);
            self.server = server;
        }
        if let Some(auth) = lookup(ENV_AUTH) {
            component_info!("config", "Auth overridden by environment");
            self.auth = auth;
        }
        if let Some(password) = lookup(ENV_OBFS_PASSWORD) {
            component_info!("config", "Obfuscation password overridden by environment");
            match &mut self.obfs {
                Some(obfs) => obfs.password = password,
                None => {
                    self.obfs = Some(ObfsConfig {
                        kind: default_obfs_type(),
                        password,
                    })
                }
            }
        }
        if let Some(up) = lookup(ENV_UP) {
            component_info!("config", "Upload bandwidth overridden by environment: {}", up);
            self.bandwidth.up = up;
        }
        if let Some(down) = lookup(ENV_DOWN) {
            component_info!("config", "Download bandwidth overridden by environment: {}", down);
            self.bandwidth.down = down;
        }
    }

    /// Check the configuration for errors
    pub fn validate(&self) -> Result<()> {
        if self.auth.is_empty() {
            bail!("auth must not be empty");
        }
        let server = parse_server(&self.server)?;
        if server.ports.len() > 1 && self.hop_interval < MIN_HOP_INTERVAL {
            bail!(
                "hop interval {:?} is shorter than {:?}",
                self.hop_interval,
                MIN_HOP_INTERVAL
            );
        }
        if !(MIN_UDP_MTU..=MAX_UDP_MTU).contains(&self.udp_mtu) {
            bail!(
                "udp_mtu {} outside {}..={}",
                self.udp_mtu,
                MIN_UDP_MTU,
                MAX_UDP_MTU
            );
        }
        if let Some(obfs) = &self.obfs {
            if obfs.kind != OBFS_SALAMANDER {
                bail!("unknown obfuscation type {:?}", obfs.kind);
            }
            if obfs.password.is_empty() {
                bail!("obfuscation password must not be empty");
            }
        }
        parse_bandwidth(&self.bandwidth.up).context("bandwidth.up")?;
        parse_bandwidth(&self.bandwidth.down).context("bandwidth.down")?;
        Ok(())
    }

    /// Resolve the server pool and build connection manager options
    pub async fn into_options(
        self,
        dialer: Arc<dyn Dialer>,
        connector: Arc<dyn Connector>,
        cancel: CancellationToken,
    ) -> Result<ClientOptions> {
        self.validate()?;
        let server = parse_server(&self.server)?;
        let ip = resolve_host(&server.host).await?;
        let pool: Vec<SocketAddr> = server
            .ports
            .iter()
            .map(|port| SocketAddr::new(ip, *port))
            .collect();

        let index = if pool.len() > 1 {
            rand::thread_rng().gen_range(0..pool.len())
        } else {
            0
        };

        let transport = TransportParams {
            server_name: self.tls.sni.clone().unwrap_or_else(|| server.host.clone()),
            alpn: self.tls.alpn.clone(),
            insecure: self.tls.insecure,
            max_idle_timeout: self.transport.idle_timeout,
            keep_alive_period: self.transport.keep_alive,
            stream_receive_window: self.transport.stream_receive_window,
            conn_receive_window: self.transport.conn_receive_window,
            enable_datagrams: self.udp,
        };

        let mut options = ClientOptions::new(pool[index], self.auth, dialer, connector);
        options.cancel = cancel;
        options.brutal_debug = self.brutal_debug;
        options.server_addresses = if pool.len() > 1 { pool } else { Vec::new() };
        options.server_address_index = index;
        options.hop_interval = self.hop_interval;
        options.hop_policy = self.hop_policy.into();
        options.send_bps = parse_bandwidth(&self.bandwidth.up)?;
        options.receive_bps = parse_bandwidth(&self.bandwidth.down)?;
        options.salamander_password = self.obfs.map(|obfs| obfs.password);
        options.transport = transport;
        options.udp_enabled = self.udp;
        options.initial_window = self.initial_window;
        options.udp_mtu = self.udp_mtu;
        Ok(options)
    }

    /// Build a [`Client`] from this configuration
    pub async fn build_client(
        self,
        dialer: Arc<dyn Dialer>,
        connector: Arc<dyn Connector>,
        cancel: CancellationToken,
    ) -> Result<Client> {
        let options = self.into_options(dialer, connector, cancel).await?;
        component_info!(
            "client",
            "Tunnel client for {} ({} hop addresses)",
            options.server_address,
            options.server_addresses.len()
        );
        Ok(Client::new(options)?)
    }
}

async fn resolve_host(host: &str) -> Result<IpAddr> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(ip);
    }
    tokio::net::lookup_host((host, 0))
        .await
        .with_context(|| format!("failed to resolve {}", host))?
        .next()
        .map(|addr| addr.ip())
        .ok_or_else(|| anyhow!("no addresses for {}", host))
}
