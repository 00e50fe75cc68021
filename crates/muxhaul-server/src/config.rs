//! Server configuration
//!
//! `TunnelConfig` is the YAML file format. It is validated and resolved once
//! at startup into an immutable `ServerConfig` shared by every generation.

use crate::error::ConfigError;
use crate::mapping::{normalize_bind_addr, PortMapping};
use muxhaul_transport::{SmuxConfig, SocketOptions};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Grace period between tearing down a generation and starting the next one
pub const DEFAULT_RESTART_GRACE: Duration = Duration::from_secs(2);

/// Tunnel server configuration file format
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelConfig {
    /// Address the remote agent connects to
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Shared secret the agent must present on the control channel
    #[serde(default)]
    pub token: String,

    /// Capacity of the tunnel pool and of each mapping queue
    #[serde(default = "default_channel_size")]
    pub channel_size: usize,

    /// Client connections carried per mux session
    #[serde(default = "default_mux_con")]
    pub mux_con: usize,

    #[serde(default = "default_mux_version")]
    pub mux_version: u8,

    /// Queue unit for the buffers below, not a cap on data frame size
    #[serde(default = "default_mux_frame_size")]
    pub mux_frame_size: usize,

    #[serde(default = "default_mux_receive_buffer")]
    pub mux_receive_buffer: usize,

    #[serde(default = "default_mux_stream_buffer")]
    pub mux_stream_buffer: usize,

    #[serde(default)]
    pub nodelay: bool,

    /// TCP keep-alive period in seconds
    #[serde(default = "default_keepalive_period")]
    pub keepalive_period: u64,

    /// Heartbeat interval in seconds
    #[serde(default = "default_heartbeat")]
    pub heartbeat: u64,

    /// Count relayed bytes per local port
    #[serde(default)]
    pub sniffer: bool,

    /// Dashboard port (0 disables it)
    #[serde(default)]
    pub web_port: u16,

    #[serde(default = "default_sniffer_log")]
    pub sniffer_log: PathBuf,

    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Port mappings, `"<local>=<remote>"` or a bare port
    #[serde(default)]
    pub ports: Vec<String>,
}

fn default_bind_addr() -> String {
    "0.0.0.0:3080".to_string()
}

fn default_channel_size() -> usize {
    2048
}

fn default_mux_con() -> usize {
    8
}

fn default_mux_version() -> u8 {
    1
}

fn default_mux_frame_size() -> usize {
    32768
}

fn default_mux_receive_buffer() -> usize {
    4194304
}

fn default_mux_stream_buffer() -> usize {
    65536
}

fn default_keepalive_period() -> u64 {
    75
}

fn default_heartbeat() -> u64 {
    40
}

fn default_sniffer_log() -> PathBuf {
    PathBuf::from("muxhaul.json")
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            token: String::new(),
            channel_size: default_channel_size(),
            mux_con: default_mux_con(),
            mux_version: default_mux_version(),
            mux_frame_size: default_mux_frame_size(),
            mux_receive_buffer: default_mux_receive_buffer(),
            mux_stream_buffer: default_mux_stream_buffer(),
            nodelay: false,
            keepalive_period: default_keepalive_period(),
            heartbeat: default_heartbeat(),
            sniffer: false,
            web_port: 0,
            sniffer_log: default_sniffer_log(),
            log_level: default_log_level(),
            ports: Vec::new(),
        }
    }
}

impl TunnelConfig {
    /// Load and parse a YAML config file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(content)?)
    }

    /// Sample config file printed by `muxhaul init`
    pub fn template() -> String {
        r#"# Muxhaul tunnel server configuration

# Address the remote agent connects to
bind_addr: "0.0.0.0:3080"

# Shared secret presented by the agent on the control channel
token: "change-me"

# Port mappings: "<local port or address>=<remote target>" or a bare port
ports:
  - "8080=127.0.0.1:80"
  - "2222"

# Pool and per-mapping queue capacity
channel_size: 2048

# Client connections per mux session
mux_con: 8

# smux tuning (only version 1 is supported). Buffers are divided by the
# frame size to get queue depths in frames.
mux_version: 1
mux_frame_size: 32768
mux_receive_buffer: 4194304
mux_stream_buffer: 65536

nodelay: false
keepalive_period: 75
heartbeat: 40

# Usage telemetry
sniffer: false
web_port: 0
sniffer_log: "muxhaul.json"

log_level: "info"
"#
        .to_string()
    }

    pub fn smux_config(&self) -> SmuxConfig {
        SmuxConfig {
            version: self.mux_version,
            max_frame_size: self.mux_frame_size,
            max_receive_buffer: self.mux_receive_buffer,
            max_stream_buffer: self.mux_stream_buffer,
            ..SmuxConfig::default()
        }
    }

    pub fn socket_options(&self) -> SocketOptions {
        SocketOptions {
            nodelay: self.nodelay,
            keepalive: Duration::from_secs(self.keepalive_period),
        }
    }

    pub fn port_mappings(&self) -> Result<Vec<PortMapping>, ConfigError> {
        self.ports.iter().map(|p| PortMapping::parse(p)).collect()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.token.trim().is_empty() {
            return Err(ConfigError::Invalid("token must not be empty".to_string()));
        }
        if self.bind_addr.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "bind_addr must not be empty".to_string(),
            ));
        }
        if self.channel_size == 0 {
            return Err(ConfigError::Invalid(
                "channel_size must be greater than zero".to_string(),
            ));
        }
        if self.mux_con == 0 {
            return Err(ConfigError::Invalid(
                "mux_con must be greater than zero".to_string(),
            ));
        }
        if self.heartbeat == 0 {
            return Err(ConfigError::Invalid(
                "heartbeat must be greater than zero".to_string(),
            ));
        }
        if self.keepalive_period == 0 {
            return Err(ConfigError::Invalid(
                "keepalive_period must be greater than zero".to_string(),
            ));
        }
        self.smux_config()
            .validate()
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        self.port_mappings()?;
        Ok(())
    }

    /// Validate and resolve into the runtime configuration
    pub fn resolve(&self) -> Result<ServerConfig, ConfigError> {
        self.validate()?;
        Ok(ServerConfig {
            bind_addr: normalize_bind_addr(self.bind_addr.trim()),
            token: self.token.clone(),
            channel_size: self.channel_size,
            mux_con: self.mux_con,
            smux: self.smux_config(),
            socket: self.socket_options(),
            heartbeat: Duration::from_secs(self.heartbeat),
            sniffer: self.sniffer,
            web_port: self.web_port,
            sniffer_log: self.sniffer_log.clone(),
            mappings: self.port_mappings()?,
            restart_grace: DEFAULT_RESTART_GRACE,
        })
    }
}

/// Immutable runtime configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: String,
    pub token: String,
    pub channel_size: usize,
    pub mux_con: usize,
    pub smux: SmuxConfig,
    pub socket: SocketOptions,
    pub heartbeat: Duration,
    pub sniffer: bool,
    pub web_port: u16,
    pub sniffer_log: PathBuf,
    pub mappings: Vec<PortMapping>,
    pub restart_grace: Duration,
}
