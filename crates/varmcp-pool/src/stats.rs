//! Pool and manager statistics.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Point-in-time statistics for one pool
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PoolStats {
    /// Connections currently checked out
    pub active_connections: u64,

    /// Connections in the idle list
    pub idle_connections: u64,

    /// Live connections (active + idle)
    pub total_connections: u64,

    /// Connections dialed since the pool was created
    pub connections_created: u64,

    /// Connections discarded by return, idle sweep or health sweep
    pub connections_closed: u64,

    /// Checkouts served from the idle list
    pub connections_reused: u64,

    /// Dials that failed
    pub failed_connections: u64,

    /// Mean time spent establishing new connections
    #[serde(with = "humantime_serde")]
    pub average_latency: Duration,

    /// High-water mark of live connections
    pub peak_connections: u64,

    /// Connections evicted by the health sweep
    pub health_checks_failed: u64,

    /// Live connections divided by capacity
    pub pool_utilization: f64,
}

/// Point-in-time statistics across all pools of a manager
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ManagerStats {
    /// Registered pools
    pub total_pools: usize,

    /// Registered pools whose configuration is enabled
    pub active_pools: usize,

    /// Live connections summed over every pool
    pub total_connections: u64,

    /// Per-pool statistics keyed by pool name
    pub pool_stats: HashMap<String, PoolStats>,

    /// Live connections over (pool count × global capacity); ignores per-pool
    /// capacity overrides
    pub global_utilization: f64,

    /// Health sweep period
    #[serde(with = "humantime_serde")]
    pub health_check_interval: Duration,
}

/// Event counters kept behind a pool's stats lock
#[derive(Debug, Default)]
pub(crate) struct PoolCounters {
    pub(crate) created: u64,
    pub(crate) closed: u64,
    pub(crate) reused: u64,
    pub(crate) failed: u64,
    pub(crate) peak: u64,
    pub(crate) health_checks_failed: u64,
    dial_time: Duration,
}

impl PoolCounters {
    /// Record a successful dial; `live` is the live count after insertion
    pub(crate) fn record_created(&mut self, live: usize, dial_time: Duration) {
        self.created += 1;
        self.dial_time += dial_time;
        self.peak = self.peak.max(live as u64);
    }

    /// Combine the counters with the current set sizes
    pub(crate) fn snapshot(&self, total: usize, idle: usize, max_conn: usize) -> PoolStats {
        let total = total as u64;
        let idle = idle as u64;
        let average_latency = if self.created > 0 {
            self.dial_time / u32::try_from(self.created).unwrap_or(u32::MAX)
        } else {
            Duration::ZERO
        };
        let pool_utilization = if max_conn > 0 {
            total as f64 / max_conn as f64
        } else {
            0.0
        };

        PoolStats {
            active_connections: total.saturating_sub(idle),
            idle_connections: idle,
            total_connections: total,
            connections_created: self.created,
            connections_closed: self.closed,
            connections_reused: self.reused,
            failed_connections: self.failed,
            average_latency,
            peak_connections: self.peak,
            health_checks_failed: self.health_checks_failed,
            pool_utilization,
        }
    }
}

/// Forward a pool event to the `metrics` recorder when the feature is on
#[cfg(feature = "metrics")]
pub(crate) fn emit(pool: &str, event: &'static str, count: u64) {
    if count > 0 {
        metrics::counter!(event, "pool" => pool.to_string()).increment(count);
    }
}

#[cfg(not(feature = "metrics"))]
pub(crate) fn emit(_pool: &str, _event: &'static str, _count: u64) {}
