//! Pool and manager configuration.
//!
//! Both structs deserialize from JSON with human readable durations
//! (`"15m"`, `"5s"`). Zero-valued fields are replaced with fixed defaults
//! when a pool or manager is constructed, so neither ever runs with zero
//! capacity or a zero timeout.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{PoolError, PoolResult};

/// Default per-pool capacity
pub const DEFAULT_POOL_MAX_CONN: usize = 50;
/// Default per-pool idle target
pub const DEFAULT_POOL_MIN_IDLE: usize = 2;
/// Default per-pool idle timeout
pub const DEFAULT_POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(15 * 60);
/// Default per-pool dial timeout
pub const DEFAULT_POOL_DIAL_TIMEOUT: Duration = Duration::from_secs(5);
/// Default idle-sweep period
pub const DEFAULT_MAINTENANCE_INTERVAL: Duration = Duration::from_secs(30);

/// Default manager-wide capacity per pool
pub const DEFAULT_MAX_CONNECTIONS: usize = 100;
/// Default manager-wide idle target
pub const DEFAULT_MIN_IDLE_CONNECTIONS: usize = 5;
/// Default manager-wide idle timeout
pub const DEFAULT_MAX_IDLE_TIME: Duration = Duration::from_secs(30 * 60);
/// Default manager-wide dial timeout
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Default health sweep period
pub const DEFAULT_HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Transport protocols a pool can dial
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// TCP socket
    Tcp,
    /// Unix domain socket
    Unix,
}

impl Protocol {
    /// Wire name of the protocol
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Unix => "unix",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = PoolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tcp" => Ok(Self::Tcp),
            "unix" => Ok(Self::Unix),
            other => Err(PoolError::config(format!("unsupported protocol: {other}"))),
        }
    }
}

/// Configuration for a single named pool
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Capacity bound on live connections
    #[serde(rename = "max_connections")]
    pub max_conn: usize,

    /// Idle target; advisory only, never enforced as a cap
    pub min_idle: usize,

    /// How long a connection may sit unused before it is considered stale
    #[serde(with = "humantime_serde")]
    pub idle_timeout: Duration,

    /// Upper bound on establishing a new transport
    #[serde(with = "humantime_serde")]
    pub dial_timeout: Duration,

    /// Period of the background idle sweep
    #[serde(with = "humantime_serde")]
    pub maintenance_interval: Duration,

    /// Protocol name, checked when dialing (`tcp` or `unix`)
    pub protocol: String,

    /// Host:port for tcp, socket path for unix
    pub address: String,

    /// Whether the pool counts as active in manager statistics
    pub enabled: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_conn: DEFAULT_POOL_MAX_CONN,
            min_idle: DEFAULT_POOL_MIN_IDLE,
            idle_timeout: DEFAULT_POOL_IDLE_TIMEOUT,
            dial_timeout: DEFAULT_POOL_DIAL_TIMEOUT,
            maintenance_interval: DEFAULT_MAINTENANCE_INTERVAL,
            protocol: Protocol::Tcp.to_string(),
            address: String::new(),
            enabled: true,
        }
    }
}

impl PoolConfig {
    /// Pool dialing a TCP endpoint
    pub fn tcp(address: impl Into<String>) -> Self {
        Self {
            protocol: Protocol::Tcp.to_string(),
            address: address.into(),
            ..Self::default()
        }
    }

    /// Pool dialing a Unix domain socket
    pub fn unix(path: impl AsRef<Path>) -> Self {
        Self {
            protocol: Protocol::Unix.to_string(),
            address: path.as_ref().to_string_lossy().into_owned(),
            ..Self::default()
        }
    }

    /// Set the capacity bound
    #[must_use]
    pub const fn with_max_conn(mut self, max_conn: usize) -> Self {
        self.max_conn = max_conn;
        self
    }

    /// Set the advisory idle target
    #[must_use]
    pub const fn with_min_idle(mut self, min_idle: usize) -> Self {
        self.min_idle = min_idle;
        self
    }

    /// Set the idle timeout
    #[must_use]
    pub const fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Set the dial timeout
    #[must_use]
    pub const fn with_dial_timeout(mut self, timeout: Duration) -> Self {
        self.dial_timeout = timeout;
        self
    }

    /// Set the idle-sweep period
    #[must_use]
    pub const fn with_maintenance_interval(mut self, interval: Duration) -> Self {
        self.maintenance_interval = interval;
        self
    }

    /// Mark the pool enabled or disabled
    #[must_use]
    pub const fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Replace zero-valued fields with the fixed pool defaults
    #[must_use]
    pub fn with_defaults(mut self) -> Self {
        if self.max_conn == 0 {
            self.max_conn = DEFAULT_POOL_MAX_CONN;
        }
        if self.min_idle == 0 {
            self.min_idle = DEFAULT_POOL_MIN_IDLE;
        }
        if self.idle_timeout.is_zero() {
            self.idle_timeout = DEFAULT_POOL_IDLE_TIMEOUT;
        }
        if self.dial_timeout.is_zero() {
            self.dial_timeout = DEFAULT_POOL_DIAL_TIMEOUT;
        }
        if self.maintenance_interval.is_zero() {
            self.maintenance_interval = DEFAULT_MAINTENANCE_INTERVAL;
        }
        self
    }
}

/// Manager-wide configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionPoolConfig {
    /// Capacity for pools created from the global defaults
    pub max_connections: usize,

    /// Idle target for pools created from the global defaults
    pub min_idle_connections: usize,

    /// Idle timeout for pools created from the global defaults
    #[serde(with = "humantime_serde")]
    pub max_idle_time: Duration,

    /// Dial timeout for pools created from the global defaults
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,

    /// Period of the manager health sweep
    #[serde(with = "humantime_serde")]
    pub health_check_interval: Duration,

    /// Connection reuse flag; accepted for compatibility, pools always reuse
    pub enable_reuse: bool,

    /// Run the periodic health sweep
    pub enable_monitoring: bool,

    /// Per-pool overrides keyed by pool name
    pub pool_configs: HashMap<String, PoolConfig>,
}

impl Default for ConnectionPoolConfig {
    fn default() -> Self {
        Self {
            max_connections: DEFAULT_MAX_CONNECTIONS,
            min_idle_connections: DEFAULT_MIN_IDLE_CONNECTIONS,
            max_idle_time: DEFAULT_MAX_IDLE_TIME,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            health_check_interval: DEFAULT_HEALTH_CHECK_INTERVAL,
            enable_reuse: true,
            enable_monitoring: false,
            pool_configs: HashMap::new(),
        }
    }
}

impl ConnectionPoolConfig {
    /// Parse a configuration from JSON
    pub fn from_json_str(json: &str) -> PoolResult<Self> {
        serde_json::from_str(json)
            .map_err(|e| PoolError::config(format!("invalid pool configuration: {e}")))
    }

    /// Read and parse a JSON configuration file
    pub fn from_json_file(path: impl AsRef<Path>) -> PoolResult<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            PoolError::config(format!("failed to read {}: {e}", path.display()))
        })?;
        Self::from_json_str(&contents)
    }

    /// Register a per-pool override
    #[must_use]
    pub fn with_pool(mut self, name: impl Into<String>, config: PoolConfig) -> Self {
        self.pool_configs.insert(name.into(), config);
        self
    }

    /// Replace zero-valued fields with the fixed manager defaults
    #[must_use]
    pub fn with_defaults(mut self) -> Self {
        if self.max_connections == 0 {
            self.max_connections = DEFAULT_MAX_CONNECTIONS;
        }
        if self.min_idle_connections == 0 {
            self.min_idle_connections = DEFAULT_MIN_IDLE_CONNECTIONS;
        }
        if self.max_idle_time.is_zero() {
            self.max_idle_time = DEFAULT_MAX_IDLE_TIME;
        }
        if self.connect_timeout.is_zero() {
            self.connect_timeout = DEFAULT_CONNECT_TIMEOUT;
        }
        if self.health_check_interval.is_zero() {
            self.health_check_interval = DEFAULT_HEALTH_CHECK_INTERVAL;
        }
        self
    }

    /// Configuration for a pool that has no explicit override
    #[must_use]
    pub fn default_pool_config(&self) -> PoolConfig {
        PoolConfig {
            max_conn: self.max_connections,
            min_idle: self.min_idle_connections,
            idle_timeout: self.max_idle_time,
            dial_timeout: self.connect_timeout,
            maintenance_interval: DEFAULT_MAINTENANCE_INTERVAL,
            protocol: Protocol::Tcp.to_string(),
            address: String::new(),
            enabled: true,
        }
    }

    /// Override for `name` if configured, else the global defaults
    #[must_use]
    pub fn resolve_pool_config(&self, name: &str) -> PoolConfig {
        self.pool_configs
            .get(name)
            .cloned()
            .unwrap_or_else(|| self.default_pool_config())
    }
}
