// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Gateway configuration (spec §6.3).
//!
//! Loaded from a YAML file by the deployment tooling; this crate only owns
//! parsing, defaulting, and validation of the options the core consumes.

use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;

/// `tcp.*` listener and framing options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TcpConfig {
    #[serde(default = "default_bind_address")]
    pub host: IpAddr,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Hard cap on concurrent connections.
    #[serde(default = "default_max_conn")]
    pub max_conn: usize,
    /// Cap on a single DNY frame body.
    #[serde(default = "default_max_packet_size")]
    pub max_packet_size: usize,
    /// Handshake timeout (before ICCID/registration completes).
    #[serde(default = "default_initial_read_deadline")]
    pub initial_read_deadline_seconds: u64,
    /// Steady-state read deadline, refreshed on every received byte.
    #[serde(default = "default_default_read_deadline")]
    pub default_read_deadline_seconds: u64,
    /// Maximum time the Reader may block enqueueing onto the dispatch queue
    /// before the connection is closed with reason `overflow`.
    #[serde(default = "default_dispatch_enqueue_timeout")]
    pub dispatch_enqueue_timeout_seconds: u64,
    /// Size of the `tokio` blocking-worker pool (`spawn_blocking`) available
    /// to handlers that must do blocking work.
    #[serde(default = "default_worker_pool_size")]
    pub worker_pool_size: usize,
}

fn default_bind_address() -> IpAddr {
    "0.0.0.0".parse().unwrap()
}
fn default_port() -> u16 {
    7700
}
fn default_max_conn() -> usize {
    10_000
}
fn default_max_packet_size() -> usize {
    4096
}
fn default_initial_read_deadline() -> u64 {
    60
}
fn default_default_read_deadline() -> u64 {
    300
}
fn default_dispatch_enqueue_timeout() -> u64 {
    30
}
fn default_worker_pool_size() -> usize {
    16
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            host: default_bind_address(),
            port: default_port(),
            max_conn: default_max_conn(),
            max_packet_size: default_max_packet_size(),
            initial_read_deadline_seconds: default_initial_read_deadline(),
            default_read_deadline_seconds: default_default_read_deadline(),
            dispatch_enqueue_timeout_seconds: default_dispatch_enqueue_timeout(),
            worker_pool_size: default_worker_pool_size(),
        }
    }
}

/// Differentiated write deadlines (spec §4.3, §6.3 `deviceConnection.timeouts.*`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteTimeouts {
    #[serde(default = "default_register_timeout")]
    pub register_timeout_seconds: u64,
    #[serde(default = "default_heartbeat_response_timeout")]
    pub heartbeat_response_timeout_seconds: u64,
    #[serde(default = "default_data_transfer_timeout")]
    pub data_transfer_timeout_seconds: u64,
    #[serde(default = "default_default_write_timeout")]
    pub default_write_timeout_seconds: u64,
}

fn default_register_timeout() -> u64 {
    5
}
fn default_heartbeat_response_timeout() -> u64 {
    5
}
fn default_data_transfer_timeout() -> u64 {
    30
}
fn default_default_write_timeout() -> u64 {
    10
}

impl Default for WriteTimeouts {
    fn default() -> Self {
        Self {
            register_timeout_seconds: default_register_timeout(),
            heartbeat_response_timeout_seconds: default_heartbeat_response_timeout(),
            data_transfer_timeout_seconds: default_data_transfer_timeout(),
            default_write_timeout_seconds: default_default_write_timeout(),
        }
    }
}

/// `deviceConnection.*` liveness and session options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConnectionConfig {
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_seconds: u64,
    #[serde(default = "default_heartbeat_timeout")]
    pub heartbeat_timeout_seconds: u64,
    #[serde(default = "default_heartbeat_warning_threshold")]
    pub heartbeat_warning_threshold_seconds: u64,
    #[serde(default = "default_session_timeout_minutes")]
    pub session_timeout_minutes: u64,
    #[serde(default)]
    pub timeouts: WriteTimeouts,
    /// Startup grace window during which stale devices are not disconnected
    /// (spec §4.4, grace period).
    #[serde(default = "default_startup_grace_seconds")]
    pub startup_grace_seconds: u64,
}

fn default_heartbeat_interval() -> u64 {
    30
}
fn default_heartbeat_timeout() -> u64 {
    300
}
fn default_heartbeat_warning_threshold() -> u64 {
    30
}
fn default_session_timeout_minutes() -> u64 {
    30
}
fn default_startup_grace_seconds() -> u64 {
    60
}

impl Default for DeviceConnectionConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_seconds: default_heartbeat_interval(),
            heartbeat_timeout_seconds: default_heartbeat_timeout(),
            heartbeat_warning_threshold_seconds: default_heartbeat_warning_threshold(),
            session_timeout_minutes: default_session_timeout_minutes(),
            timeouts: WriteTimeouts::default(),
            startup_grace_seconds: default_startup_grace_seconds(),
        }
    }
}

/// Top-level gateway configuration (spec §6.3).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub tcp: TcpConfig,
    #[serde(default)]
    pub device_connection: DeviceConnectionConfig,
    /// Batching interval for the Status Update Optimizer (spec §4.7).
    #[serde(default = "default_optimizer_batch_ms")]
    pub optimizer_batch_interval_ms: u64,
    /// Dedup window for the Status Update Optimizer (spec §4.7).
    #[serde(default = "default_optimizer_dedup_ms")]
    pub optimizer_dedup_window_ms: u64,
}

fn default_optimizer_batch_ms() -> u64 {
    500
}
fn default_optimizer_dedup_ms() -> u64 {
    1000
}

impl GatewayConfig {
    /// Load configuration from a YAML file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content =
            std::fs::read_to_string(path).map_err(|e| ConfigError::Io(e.to_string()))?;
        let config: Self =
            serde_yaml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a YAML file.
    pub fn to_file(&self, path: &Path) -> Result<(), ConfigError> {
        let content =
            serde_yaml::to_string(self).map_err(|e| ConfigError::Serialize(e.to_string()))?;
        std::fs::write(path, content).map_err(|e| ConfigError::Io(e.to_string()))
    }

    pub fn initial_read_deadline(&self) -> Duration {
        Duration::from_secs(self.tcp.initial_read_deadline_seconds)
    }

    pub fn default_read_deadline(&self) -> Duration {
        Duration::from_secs(self.tcp.default_read_deadline_seconds)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.device_connection.heartbeat_interval_seconds)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.device_connection.heartbeat_timeout_seconds)
    }

    pub fn heartbeat_warning_threshold(&self) -> Duration {
        Duration::from_secs(self.device_connection.heartbeat_warning_threshold_seconds)
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.device_connection.session_timeout_minutes * 60)
    }

    pub fn startup_grace(&self) -> Duration {
        Duration::from_secs(self.device_connection.startup_grace_seconds)
    }

    pub fn optimizer_batch_interval(&self) -> Duration {
        Duration::from_millis(self.optimizer_batch_interval_ms)
    }

    pub fn optimizer_dedup_window(&self) -> Duration {
        Duration::from_millis(self.optimizer_dedup_window_ms)
    }

    /// Validate configuration. Invalid configuration at startup is fatal
    /// (spec §7).
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tcp.max_conn == 0 {
            return Err(ConfigError::InvalidValue("tcp.maxConn cannot be 0".into()));
        }
        if self.device_connection.heartbeat_timeout_seconds == 0 {
            return Err(ConfigError::InvalidValue(
                "deviceConnection.heartbeatTimeoutSeconds cannot be 0".into(),
            ));
        }
        if self.device_connection.heartbeat_interval_seconds == 0 {
            return Err(ConfigError::InvalidValue(
                "deviceConnection.heartbeatIntervalSeconds cannot be 0".into(),
            ));
        }
        Ok(())
    }
}

/// Configuration error types.
#[derive(Debug, Clone)]
pub enum ConfigError {
    Io(String),
    Parse(String),
    Serialize(String),
    InvalidValue(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(s) => write!(f, "I/O error: {}", s),
            Self::Parse(s) => write!(f, "parse error: {}", s),
            Self::Serialize(s) => write!(f, "serialize error: {}", s),
            Self::InvalidValue(s) => write!(f, "invalid value: {}", s),
        }
    }
}

impl std::error::Error for ConfigError {}
