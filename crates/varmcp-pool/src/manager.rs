//! Registry of named connection pools.
//!
//! The manager owns every pool, creates pools on first use from the global
//! defaults (or a per-pool override), and optionally runs a health sweep
//! across all of them.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::future::join_all;
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{ConnectionPoolConfig, PoolConfig};
use crate::connection::Connection;
use crate::error::{PoolError, PoolResult};
use crate::pool::ConnectionPool;
use crate::stats::{ManagerStats, PoolStats};
use crate::task::BackgroundTask;
use crate::transport::{Dialer, NetDialer};

type PoolMap = HashMap<String, Arc<ConnectionPool>>;

/// Owner of all named pools
#[derive(Debug)]
pub struct PoolManager {
    config: ConnectionPoolConfig,
    dialer: Arc<dyn Dialer>,
    pools: Arc<RwLock<PoolMap>>,
    /// Flipped under the registry write lock; no pool is registered afterwards
    closed: AtomicBool,
    monitor: Option<BackgroundTask>,
}

impl PoolManager {
    /// Create a manager whose pools dial with [`NetDialer`]
    ///
    /// Must be called inside a tokio runtime when monitoring is enabled.
    pub fn new(config: ConnectionPoolConfig) -> Self {
        Self::with_dialer(config, Arc::new(NetDialer))
    }

    /// Create a manager whose pools share a custom dialer
    pub fn with_dialer(config: ConnectionPoolConfig, dialer: Arc<dyn Dialer>) -> Self {
        let config = config.with_defaults();
        let pools: Arc<RwLock<PoolMap>> = Arc::new(RwLock::new(HashMap::new()));

        let monitor = config.enable_monitoring.then(|| {
            let pools = Arc::clone(&pools);
            BackgroundTask::spawn_periodic(
                "health-monitor",
                config.health_check_interval,
                move || {
                    let pools = Arc::clone(&pools);
                    async move { sweep_pools(&pools).await }
                },
            )
        });

        info!(
            "Connection pool manager started (max {} per pool, monitoring {})",
            config.max_connections, config.enable_monitoring
        );

        Self {
            config,
            dialer,
            pools,
            closed: AtomicBool::new(false),
            monitor,
        }
    }

    /// Effective configuration after defaulting
    #[must_use]
    pub fn config(&self) -> &ConnectionPoolConfig {
        &self.config
    }

    /// Register a new pool under `name`
    ///
    /// Fails with a configuration error if the name is taken.
    pub fn create_pool(&self, name: &str, config: PoolConfig) -> PoolResult<()> {
        let mut pools = self.pools.write();
        if self.closed.load(Ordering::Acquire) {
            return Err(PoolError::ManagerClosed);
        }
        if pools.contains_key(name) {
            return Err(PoolError::config(format!("pool already exists: {name}")));
        }
        let pool = ConnectionPool::with_dialer(name, config, Arc::clone(&self.dialer));
        info!(
            "Created connection pool {} for {} {}",
            name,
            pool.config().protocol,
            pool.config().address
        );
        pools.insert(name.to_string(), Arc::new(pool));
        Ok(())
    }

    /// Unregister a pool and close its connections
    ///
    /// Close failures are logged, not returned.
    pub async fn remove_pool(&self, name: &str) -> PoolResult<()> {
        let pool = self
            .pools
            .write()
            .remove(name)
            .ok_or_else(|| PoolError::PoolNotFound(name.to_string()))?;

        if let Err(e) = pool.close().await {
            warn!("Error closing pool {}: {}", name, e);
        }
        info!("Removed connection pool {}", name);
        Ok(())
    }

    /// Check out a connection from `pool_name`, creating the pool on first use
    ///
    /// Fails with [`PoolError::ManagerClosed`] once the manager is closed.
    pub async fn checkout(
        &self,
        cancel: &CancellationToken,
        pool_name: &str,
        client_id: &str,
    ) -> PoolResult<Arc<Connection>> {
        let pool = self.get_or_create(pool_name)?;
        pool.checkout(cancel, client_id).await
    }

    /// Give a connection back to the pool it came from
    pub async fn return_connection(
        &self,
        pool_name: &str,
        conn: impl Into<Option<Arc<Connection>>>,
    ) -> PoolResult<()> {
        let pool = self
            .pool(pool_name)
            .ok_or_else(|| PoolError::PoolNotFound(pool_name.to_string()))?;
        pool.return_connection(conn).await
    }

    /// Look up a registered pool
    #[must_use]
    pub fn pool(&self, name: &str) -> Option<Arc<ConnectionPool>> {
        self.pools.read().get(name).cloned()
    }

    /// Registered pool names, sorted
    #[must_use]
    pub fn pool_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.pools.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Statistics for one pool
    pub fn pool_stats(&self, name: &str) -> PoolResult<PoolStats> {
        self.pool(name)
            .map(|pool| pool.stats())
            .ok_or_else(|| PoolError::PoolNotFound(name.to_string()))
    }

    /// Statistics across every pool
    #[must_use]
    pub fn stats(&self) -> ManagerStats {
        let pools = self.pools.read();

        let mut pool_stats = HashMap::with_capacity(pools.len());
        let mut total_connections = 0;
        let mut active_pools = 0;
        for (name, pool) in pools.iter() {
            let stats = pool.stats();
            total_connections += stats.total_connections;
            if pool.config().enabled {
                active_pools += 1;
            }
            pool_stats.insert(name.clone(), stats);
        }

        let capacity = pools.len() * self.config.max_connections;
        let global_utilization = if capacity > 0 {
            total_connections as f64 / capacity as f64
        } else {
            0.0
        };

        ManagerStats {
            total_pools: pools.len(),
            active_pools,
            total_connections,
            pool_stats,
            global_utilization,
            health_check_interval: self.config.health_check_interval,
        }
    }

    /// Stop the health monitor and close every pool
    ///
    /// All pools are closed even if some fail; failures are reported together.
    pub async fn close(&self) -> PoolResult<()> {
        if let Some(monitor) = &self.monitor {
            monitor.stop().await;
        }

        let drained: Vec<(String, Arc<ConnectionPool>)> = {
            let mut pools = self.pools.write();
            self.closed.store(true, Ordering::Release);
            pools.drain().collect()
        };
        let count = drained.len();

        let errors: Vec<String> = join_all(drained.iter().map(|(name, pool)| async move {
            pool.close()
                .await
                .map_err(|e| format!("pool {name}: {e}"))
        }))
        .await
        .into_iter()
        .filter_map(Result::err)
        .collect();

        info!("Connection pool manager closed {} pools", count);
        PoolError::from_close_failures("pools", errors)
    }

    /// Whether [`close`](Self::close) has been called
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn get_or_create(&self, name: &str) -> PoolResult<Arc<ConnectionPool>> {
        if let Some(pool) = self.pool(name) {
            return Ok(pool);
        }

        let mut pools = self.pools.write();
        if self.closed.load(Ordering::Acquire) {
            return Err(PoolError::ManagerClosed);
        }
        // another caller may have created it between the two locks
        if let Some(pool) = pools.get(name) {
            return Ok(Arc::clone(pool));
        }

        let config = self.config.resolve_pool_config(name);
        debug!("Auto-creating connection pool {}", name);
        let pool = Arc::new(ConnectionPool::with_dialer(
            name,
            config,
            Arc::clone(&self.dialer),
        ));
        pools.insert(name.to_string(), Arc::clone(&pool));
        Ok(pool)
    }
}

async fn sweep_pools(pools: &RwLock<PoolMap>) {
    let snapshot: Vec<Arc<ConnectionPool>> = pools.read().values().cloned().collect();
    let mut evicted = 0;
    for pool in &snapshot {
        evicted += pool.health_check().await;
    }
    if evicted > 0 {
        debug!(
            "Health check evicted {} connections across {} pools",
            evicted,
            snapshot.len()
        );
    }
}
