//! Timers, capacities and listen addresses.

use std::{net::SocketAddr, time::Duration};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Per-session outbound queue capacity.
pub const DEFAULT_OUTBOUND_CAPACITY: usize = 256;
/// No inbound frame of any kind for this long closes the session.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);
/// Deadline for the first (auth) frame.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(60);
/// Interval between liveness probes.
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(30);
/// Bound on a single transport write.
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(10);
/// Bound on waiting for room in a full outbound queue.
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(5);
/// Bound on waiting for a correlated reply.
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(30);

/// Session timers and queue sizing.
///
/// Durations (de)serialize as whole seconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub outbound_capacity: usize,
    #[serde(with = "secs")]
    pub handshake_timeout: Duration,
    #[serde(with = "secs")]
    pub idle_timeout: Duration,
    #[serde(with = "secs")]
    pub ping_interval: Duration,
    #[serde(with = "secs")]
    pub write_timeout: Duration,
    #[serde(with = "secs")]
    pub send_timeout: Duration,
    #[serde(with = "secs")]
    pub response_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            outbound_capacity: DEFAULT_OUTBOUND_CAPACITY,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            ping_interval: DEFAULT_PING_INTERVAL,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            send_timeout: DEFAULT_SEND_TIMEOUT,
            response_timeout: DEFAULT_RESPONSE_TIMEOUT,
        }
    }
}

/// Configuration error.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid listen address {value:?}: {source}")]
    InvalidAddr {
        value: String,
        #[source]
        source: std::net::AddrParseError,
    },
    #[error("Invalid path {0:?}: must start with '/'")]
    InvalidPath(String),
}

/// Controller listener configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    pub listen_addr: SocketAddr,
    /// Path agents upgrade on.
    pub ws_path: String,
    /// Liveness endpoint for orchestration health checks.
    pub health_path: String,
    pub session: SessionConfig,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            ws_path: "/ws".to_string(),
            health_path: "/health".to_string(),
            session: SessionConfig::default(),
        }
    }
}

impl ControllerConfig {
    /// Defaults overridden by `AGENT_RELAY_ADDR` and `AGENT_RELAY_WS_PATH`.
    ///
    /// # Errors
    /// Returns error if a variable is set but invalid.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(addr) = lookup("AGENT_RELAY_ADDR") {
            config.listen_addr = addr
                .parse()
                .map_err(|source| ConfigError::InvalidAddr { value: addr, source })?;
        }
        if let Some(path) = lookup("AGENT_RELAY_WS_PATH") {
            if !path.starts_with('/') {
                return Err(ConfigError::InvalidPath(path));
            }
            config.ws_path = path;
        }
        Ok(config)
    }
}

mod secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_secs)
    }
}
