//! Bounded connection pool for a single named endpoint.
//!
//! A pool hands out connections last-in-first-out from its idle list and
//! dials new ones while it is under capacity. When the pool is full and
//! nothing is idle, checkout fails immediately with
//! [`PoolError::Exhausted`]; callers are never queued.
//!
//! The live set and the idle list sit behind one lock so they are never
//! observed out of step. Counters sit behind a second lock, always taken
//! after the first. Dialing and transport shutdown happen outside both.

use std::collections::{HashMap, HashSet};
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::future::join_all;
use parking_lot::RwLock;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::config::{PoolConfig, Protocol};
use crate::connection::Connection;
use crate::error::{PoolError, PoolResult};
use crate::stats::{self, PoolCounters, PoolStats};
use crate::task::BackgroundTask;
use crate::transport::{BoxedTransport, Dialer, NetDialer};

/// Connection pool for one protocol/address pair
#[derive(Debug)]
pub struct ConnectionPool {
    shared: Arc<PoolShared>,
    maintenance: BackgroundTask,
}

#[derive(Debug)]
struct PoolShared {
    name: String,
    config: PoolConfig,
    dialer: Arc<dyn Dialer>,
    next_id: AtomicU64,
    state: RwLock<PoolState>,
    counters: RwLock<PoolCounters>,
}

#[derive(Debug, Default)]
struct PoolState {
    /// Every live connection, idle or checked out
    connections: HashMap<String, Arc<Connection>>,
    /// Idle subset, most recently returned last
    idle: Vec<Arc<Connection>>,
    /// Dials in flight; they hold capacity until they finish
    dialing: usize,
    /// Set by close; no connection is registered afterwards
    closed: bool,
}

impl ConnectionPool {
    /// Create a pool that dials with [`NetDialer`]
    ///
    /// Zero-valued configuration fields are replaced with defaults. Starts the
    /// idle sweep, so this must run inside a tokio runtime.
    pub fn new(name: impl Into<String>, config: PoolConfig) -> Self {
        Self::with_dialer(name, config, Arc::new(NetDialer))
    }

    /// Create a pool with a custom dialer
    pub fn with_dialer(name: impl Into<String>, config: PoolConfig, dialer: Arc<dyn Dialer>) -> Self {
        let name = name.into();
        let config = config.with_defaults();
        let shared = Arc::new(PoolShared {
            name: name.clone(),
            config,
            dialer,
            next_id: AtomicU64::new(0),
            state: RwLock::new(PoolState::default()),
            counters: RwLock::new(PoolCounters::default()),
        });

        let sweeper = Arc::clone(&shared);
        let maintenance = BackgroundTask::spawn_periodic(
            format!("idle-sweep:{name}"),
            shared.config.maintenance_interval,
            move || {
                let shared = Arc::clone(&sweeper);
                async move {
                    shared.sweep_idle().await;
                }
            },
        );

        debug!(
            "Created connection pool {} ({} {}, max {})",
            name, shared.config.protocol, shared.config.address, shared.config.max_conn
        );

        Self {
            shared,
            maintenance,
        }
    }

    /// Pool name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Effective configuration after defaulting
    #[must_use]
    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    /// Check out a connection for `client_id`
    ///
    /// Reuses the most recently returned idle connection when there is one;
    /// that path never suspends and ignores `cancel`. Otherwise dials a new
    /// connection if the pool is under capacity, bounded by the dial timeout
    /// and by `cancel`.
    pub async fn checkout(
        &self,
        cancel: &CancellationToken,
        client_id: &str,
    ) -> PoolResult<Arc<Connection>> {
        let mut reservation = {
            let mut state = self.shared.state.write();

            if state.closed {
                return Err(PoolError::PoolClosed(self.shared.name.clone()));
            }

            if let Some(conn) = state.idle.pop() {
                conn.mark_checked_out(client_id);
                self.shared.counters.write().reused += 1;
                drop(state);
                stats::emit(&self.shared.name, "varmcp_pool_connections_reused", 1);
                trace!("Reusing connection {} for {}", conn.id(), client_id);
                return Ok(conn);
            }

            if state.connections.len() + state.dialing >= self.shared.config.max_conn {
                drop(state);
                debug!("Connection pool {} exhausted", self.shared.name);
                return Err(PoolError::Exhausted {
                    pool: self.shared.name.clone(),
                });
            }

            state.dialing += 1;
            DialReservation {
                shared: &*self.shared,
                armed: true,
            }
        };

        let started = Instant::now();
        let transport = match self.shared.dial(cancel).await {
            Ok(transport) => transport,
            Err(e) => {
                drop(reservation);
                self.shared.counters.write().failed += 1;
                stats::emit(&self.shared.name, "varmcp_pool_connections_failed", 1);
                warn!("Pool {} failed to dial: {}", self.shared.name, e);
                return Err(e);
            }
        };
        let dial_time = started.elapsed();

        let conn = Arc::new(Connection::new(
            self.shared.next_connection_id(),
            self.shared.name.clone(),
            self.shared.config.protocol.clone(),
            self.shared.config.address.clone(),
            Some(transport),
            client_id,
            dial_time,
        ));

        let registered = {
            let mut state = self.shared.state.write();
            reservation.release(&mut state);
            if state.closed {
                false
            } else {
                state
                    .connections
                    .insert(conn.id().to_string(), Arc::clone(&conn));
                let live = state.connections.len();
                self.shared.counters.write().record_created(live, dial_time);
                true
            }
        };

        if !registered {
            debug!("Pool {} closed during dial, dropping {}", self.shared.name, conn.id());
            if let Err(e) = conn.close().await {
                warn!("Error closing connection {}: {}", conn.id(), e);
            }
            return Err(PoolError::PoolClosed(self.shared.name.clone()));
        }
        stats::emit(&self.shared.name, "varmcp_pool_connections_created", 1);
        trace!("Created connection {} for {}", conn.id(), client_id);

        Ok(conn)
    }

    /// Give a checked-out connection back to the pool
    ///
    /// `None` is rejected with [`PoolError::NilConnection`] and a connection
    /// created by another pool with [`PoolError::ForeignConnection`]; neither
    /// changes anything. A stale connection, or one arriving while the idle
    /// list is full, is closed instead of being recycled.
    pub async fn return_connection(
        &self,
        conn: impl Into<Option<Arc<Connection>>>,
    ) -> PoolResult<()> {
        let Some(conn) = conn.into() else {
            return Err(PoolError::NilConnection);
        };
        if conn.pool() != self.shared.name {
            return Err(PoolError::ForeignConnection {
                pool: self.shared.name.clone(),
                connection: conn.id().to_string(),
            });
        }

        let discard = {
            let mut state = self.shared.state.write();

            if !state.connections.contains_key(conn.id()) {
                // evicted by a sweep or dropped by close while checked out
                trace!(
                    "Connection {} is not tracked by pool {}, discarding",
                    conn.id(),
                    self.shared.name
                );
                Some(conn)
            } else if conn.is_idle() {
                None
            } else if !self.shared.is_connection_healthy(&conn) {
                debug!("Connection {} failed liveness on return, closing", conn.id());
                state.connections.remove(conn.id());
                self.shared.counters.write().closed += 1;
                stats::emit(&self.shared.name, "varmcp_pool_connections_closed", 1);
                Some(conn)
            } else if state.idle.len() < self.shared.config.max_conn {
                conn.mark_idle();
                state.idle.push(conn);
                None
            } else {
                debug!("Idle list of pool {} is full, closing {}", self.shared.name, conn.id());
                state.connections.remove(conn.id());
                self.shared.counters.write().closed += 1;
                stats::emit(&self.shared.name, "varmcp_pool_connections_closed", 1);
                Some(conn)
            }
        };

        if let Some(conn) = discard
            && let Err(e) = conn.close().await
        {
            warn!("Error closing connection {}: {}", conn.id(), e);
        }

        Ok(())
    }

    /// Recompute pool statistics
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        let state = self.shared.state.read();
        let counters = self.shared.counters.read();
        counters.snapshot(
            state.connections.len(),
            state.idle.len(),
            self.shared.config.max_conn,
        )
    }

    /// Live connections, idle or checked out
    #[must_use]
    pub fn size(&self) -> usize {
        self.shared.state.read().connections.len()
    }

    /// Connections waiting in the idle list
    #[must_use]
    pub fn idle_count(&self) -> usize {
        self.shared.state.read().idle.len()
    }

    /// Whether the pool holds no live connections
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.shared.state.read().connections.is_empty()
    }

    /// Stop the idle sweep and close every connection
    ///
    /// Every connection is attempted; failures are reported together. Checked
    /// out connections are closed too, without waiting for their holders.
    /// Later checkouts fail with [`PoolError::PoolClosed`], and a dial still
    /// in flight is discarded when it completes. Safe to call more than once.
    pub async fn close(&self) -> PoolResult<()> {
        self.maintenance.stop().await;

        let drained: Vec<Arc<Connection>> = {
            let mut state = self.shared.state.write();
            state.closed = true;
            state.idle.clear();
            state.connections.drain().map(|(_, conn)| conn).collect()
        };

        let count = drained.len();
        let errors = close_all(&drained).await;
        info!("Closed {} connections from pool {}", count, self.shared.name);

        PoolError::from_close_failures("connections", errors)
    }

    /// Whether [`close`](Self::close) has been called
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.state.read().closed
    }

    /// Evict every connection that fails the liveness check
    ///
    /// Driven by the manager's health monitor. Returns the eviction count.
    pub(crate) async fn health_check(&self) -> usize {
        self.shared.sweep_unhealthy().await
    }
}

impl PoolShared {
    fn next_connection_id(&self) -> String {
        let seq = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        format!("{}-{}", self.name, seq)
    }

    /// Transport present and used within the idle timeout
    fn is_connection_healthy(&self, conn: &Connection) -> bool {
        conn.is_open() && conn.idle_for() <= self.config.idle_timeout
    }

    async fn dial(&self, cancel: &CancellationToken) -> PoolResult<BoxedTransport> {
        let protocol: Protocol = self.config.protocol.parse()?;
        let timeout = self.config.dial_timeout;
        let dial = tokio::time::timeout(timeout, self.dialer.dial(protocol, &self.config.address));

        let result = tokio::select! {
            biased;
            () = cancel.cancelled() => Err(io::Error::new(
                io::ErrorKind::Interrupted,
                "dial cancelled by caller",
            )),
            res = dial => res.unwrap_or_else(|_| Err(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("dial timed out after {timeout:?}"),
            ))),
        };

        result.map_err(|source| PoolError::Dial {
            pool: self.name.clone(),
            address: self.config.address.clone(),
            source,
        })
    }

    /// Close idle connections unused for longer than the idle timeout
    async fn sweep_idle(&self) -> usize {
        let expired: Vec<Arc<Connection>> = {
            let mut state = self.state.write();
            let idle_timeout = self.config.idle_timeout;
            let (expired, kept): (Vec<_>, Vec<_>) = state
                .idle
                .drain(..)
                .partition(|conn| conn.idle_for() > idle_timeout);
            state.idle = kept;
            for conn in &expired {
                state.connections.remove(conn.id());
            }
            if !expired.is_empty() {
                self.counters.write().closed += expired.len() as u64;
            }
            expired
        };

        let removed = expired.len();
        if removed > 0 {
            stats::emit(&self.name, "varmcp_pool_connections_closed", removed as u64);
            for e in close_all(&expired).await {
                warn!("Error disconnecting idle connection: {}", e);
            }
            debug!("Removed {} idle connections from pool {}", removed, self.name);
        }
        removed
    }

    /// Close every live connection that fails the liveness check
    async fn sweep_unhealthy(&self) -> usize {
        let unhealthy: Vec<Arc<Connection>> = {
            let mut state = self.state.write();
            let mut evicted = HashSet::new();

            for conn in state.connections.values() {
                if self.is_connection_healthy(conn) {
                    conn.record_health_check(true, None);
                } else {
                    let reason = if conn.is_open() {
                        format!("unused for {:?}, idle timeout {:?}", conn.idle_for(), self.config.idle_timeout)
                    } else {
                        "transport closed".to_string()
                    };
                    conn.record_health_check(false, Some(reason));
                    evicted.insert(conn.id().to_string());
                }
            }

            if evicted.is_empty() {
                return 0;
            }

            state.idle.retain(|conn| !evicted.contains(conn.id()));
            let removed: Vec<_> = evicted
                .iter()
                .filter_map(|id| state.connections.remove(id))
                .collect();

            let mut counters = self.counters.write();
            counters.closed += removed.len() as u64;
            counters.health_checks_failed += removed.len() as u64;
            removed
        };

        let removed = unhealthy.len();
        stats::emit(&self.name, "varmcp_pool_connections_closed", removed as u64);
        stats::emit(&self.name, "varmcp_pool_health_checks_failed", removed as u64);
        for e in close_all(&unhealthy).await {
            warn!("Error closing unhealthy connection: {}", e);
        }
        debug!("Health check evicted {} connections from pool {}", removed, self.name);
        removed
    }
}

/// Capacity held by an in-flight dial
///
/// Dropping it unreleased (dial failed, or the caller's future was dropped)
/// hands the slot back.
struct DialReservation<'a> {
    shared: &'a PoolShared,
    armed: bool,
}

impl DialReservation<'_> {
    fn release(&mut self, state: &mut PoolState) {
        if self.armed {
            state.dialing -= 1;
            self.armed = false;
        }
    }
}

impl Drop for DialReservation<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.shared.state.write().dialing -= 1;
        }
    }
}

/// Close connections concurrently, collecting "id: error" for each failure
async fn close_all(conns: &[Arc<Connection>]) -> Vec<String> {
    join_all(conns.iter().map(|conn| async move {
        conn.close()
            .await
            .map_err(|e| format!("{}: {}", conn.id(), e))
    }))
    .await
    .into_iter()
    .filter_map(Result::err)
    .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::pin::Pin;
    use std::sync::atomic::AtomicUsize;
    use std::task::{Context, Poll};
    use std::time::Duration;

    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

    /// Transport that counts shutdowns and can be told to fail them
    #[derive(Debug)]
    struct MockTransport {
        shutdowns: Arc<AtomicUsize>,
        fail_shutdown: bool,
    }

    impl AsyncRead for MockTransport {
        fn poll_read(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    impl AsyncWrite for MockTransport {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            Poll::Ready(Ok(buf.len()))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            self.shutdowns.fetch_add(1, Ordering::SeqCst);
            if self.fail_shutdown {
                Poll::Ready(Err(io::Error::other("shutdown failed")))
            } else {
                Poll::Ready(Ok(()))
            }
        }
    }

    /// Dialer producing mock transports, or failing every dial
    #[derive(Debug, Default)]
    struct MockDialer {
        dials: AtomicUsize,
        shutdowns: Arc<AtomicUsize>,
        refuse: bool,
        delay: Option<Duration>,
    }

    #[async_trait]
    impl Dialer for MockDialer {
        async fn dial(&self, _protocol: Protocol, _address: &str) -> io::Result<BoxedTransport> {
            self.dials.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if self.refuse {
                return Err(io::Error::new(io::ErrorKind::ConnectionRefused, "refused"));
            }
            Ok(Box::new(MockTransport {
                shutdowns: self.shutdowns.clone(),
                fail_shutdown: false,
            }))
        }
    }

    fn test_config() -> PoolConfig {
        PoolConfig::tcp("127.0.0.1:9000")
            .with_max_conn(5)
            .with_min_idle(1)
            .with_idle_timeout(Duration::from_secs(300))
    }

    fn mock_connection(id: &str, shutdowns: &Arc<AtomicUsize>, fail_shutdown: bool) -> Arc<Connection> {
        Arc::new(Connection::new(
            id.to_string(),
            "test-pool",
            "tcp",
            "127.0.0.1:9000",
            Some(Box::new(MockTransport {
                shutdowns: shutdowns.clone(),
                fail_shutdown,
            })),
            "",
            Duration::ZERO,
        ))
    }

    fn insert_checked_out(pool: &ConnectionPool, conn: &Arc<Connection>) {
        let mut state = pool.shared.state.write();
        state
            .connections
            .insert(conn.id().to_string(), Arc::clone(conn));
    }

    fn insert_idle(pool: &ConnectionPool, conn: &Arc<Connection>) {
        conn.mark_idle();
        let mut state = pool.shared.state.write();
        state
            .connections
            .insert(conn.id().to_string(), Arc::clone(conn));
        state.idle.push(Arc::clone(conn));
    }

    #[tokio::test]
    async fn test_new_pool_applies_defaults() {
        let pool = ConnectionPool::new("test-pool", PoolConfig::default().with_max_conn(0));
        assert_eq!(pool.name(), "test-pool");
        assert_eq!(pool.config().max_conn, 50);
        assert_eq!(pool.config().min_idle, 2);
        assert!(pool.is_empty());
        pool.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_exhausted_pool_fails_fast() {
        let dialer = Arc::new(MockDialer::default());
        let pool = ConnectionPool::with_dialer("test-pool", test_config().with_max_conn(1), dialer.clone());
        let shutdowns = Arc::new(AtomicUsize::new(0));
        insert_checked_out(&pool, &mock_connection("test-conn", &shutdowns, false));

        let err = pool
            .checkout(&CancellationToken::new(), "client1")
            .await
            .unwrap_err();
        assert!(err.is_exhausted());
        let msg = err.to_string();
        assert!(msg.contains("test-pool"));
        assert!(msg.contains("exhausted"));

        assert_eq!(pool.size(), 1);
        assert_eq!(pool.idle_count(), 0);
        assert_eq!(dialer.dials.load(Ordering::SeqCst), 0);
        let stats = pool.stats();
        assert_eq!(stats.connections_created, 0);
        assert_eq!(stats.failed_connections, 0);
        pool.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_return_makes_connection_idle() {
        let pool = ConnectionPool::with_dialer("test-pool", test_config(), Arc::new(MockDialer::default()));
        let shutdowns = Arc::new(AtomicUsize::new(0));
        let conn = mock_connection("test-conn", &shutdowns, false);
        conn.mark_checked_out("client1");
        insert_checked_out(&pool, &conn);

        pool.return_connection(Arc::clone(&conn)).await.unwrap();

        assert!(conn.is_idle());
        assert!(conn.client_id().is_empty());
        assert_eq!(pool.idle_count(), 1);
        assert_eq!(shutdowns.load(Ordering::SeqCst), 0);
        pool.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_checkout_reuses_idle_connection() {
        let dialer = Arc::new(MockDialer::default());
        let pool = ConnectionPool::with_dialer("test-pool", test_config(), dialer.clone());
        let shutdowns = Arc::new(AtomicUsize::new(0));
        let idle = mock_connection("idle-conn", &shutdowns, false);
        idle.set_use_count(5);
        insert_idle(&pool, &idle);

        let conn = pool
            .checkout(&CancellationToken::new(), "client1")
            .await
            .unwrap();

        assert_eq!(conn.id(), "idle-conn");
        assert_eq!(conn.client_id(), "client1");
        assert!(!conn.is_idle());
        assert_eq!(conn.use_count(), 6);
        assert_eq!(pool.idle_count(), 0);
        assert_eq!(dialer.dials.load(Ordering::SeqCst), 0);

        let stats = pool.stats();
        assert_eq!(stats.connections_reused, 1);
        assert_eq!(stats.connections_created, 0);
        assert_eq!(stats.failed_connections, 0);
        pool.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_reuse_is_lifo() {
        let pool = ConnectionPool::with_dialer("test-pool", test_config(), Arc::new(MockDialer::default()));
        let shutdowns = Arc::new(AtomicUsize::new(0));
        insert_idle(&pool, &mock_connection("first", &shutdowns, false));
        insert_idle(&pool, &mock_connection("second", &shutdowns, false));

        let conn = pool
            .checkout(&CancellationToken::new(), "client1")
            .await
            .unwrap();
        assert_eq!(conn.id(), "second");
        pool.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_reuse_ignores_cancellation() {
        let pool = ConnectionPool::with_dialer("test-pool", test_config(), Arc::new(MockDialer::default()));
        let shutdowns = Arc::new(AtomicUsize::new(0));
        insert_idle(&pool, &mock_connection("idle-conn", &shutdowns, false));

        let cancel = CancellationToken::new();
        cancel.cancel();
        let conn = pool.checkout(&cancel, "client1").await.unwrap();
        assert_eq!(conn.id(), "idle-conn");
        pool.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_checkout_dials_new_connection() {
        let dialer = Arc::new(MockDialer::default());
        let pool = ConnectionPool::with_dialer("test-pool", test_config(), dialer.clone());

        let first = pool
            .checkout(&CancellationToken::new(), "client1")
            .await
            .unwrap();
        let second = pool
            .checkout(&CancellationToken::new(), "client2")
            .await
            .unwrap();

        assert_ne!(first.id(), second.id());
        assert!(first.id().starts_with("test-pool-"));
        assert_eq!(first.client_id(), "client1");
        assert_eq!(first.use_count(), 1);
        assert!(!first.is_idle());
        assert_eq!(dialer.dials.load(Ordering::SeqCst), 2);

        let stats = pool.stats();
        assert_eq!(stats.connections_created, 2);
        assert_eq!(stats.peak_connections, 2);
        assert_eq!(stats.active_connections, 2);
        assert_eq!(stats.total_connections, 2);
        pool.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_dial_failure_counts_failed() {
        let dialer = Arc::new(MockDialer {
            refuse: true,
            ..Default::default()
        });
        let pool = ConnectionPool::with_dialer("test-pool", test_config(), dialer);

        let err = pool
            .checkout(&CancellationToken::new(), "client1")
            .await
            .unwrap_err();
        assert!(err.is_dial());
        assert!(pool.is_empty());

        let stats = pool.stats();
        assert_eq!(stats.failed_connections, 1);
        assert_eq!(stats.connections_created, 0);

        // the failed dial released its capacity
        assert_eq!(pool.shared.state.read().dialing, 0);
        pool.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_unsupported_protocol_is_config_error() {
        let mut config = test_config();
        config.protocol = "websocket".to_string();
        let pool = ConnectionPool::with_dialer("test-pool", config, Arc::new(MockDialer::default()));

        let err = pool
            .checkout(&CancellationToken::new(), "client1")
            .await
            .unwrap_err();
        assert!(matches!(err, PoolError::Config(_)));
        assert!(err.to_string().contains("unsupported protocol"));
        assert_eq!(pool.stats().failed_connections, 1);
        pool.close().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_dial_timeout() {
        let dialer = Arc::new(MockDialer {
            delay: Some(Duration::from_secs(60)),
            ..Default::default()
        });
        let pool = ConnectionPool::with_dialer(
            "test-pool",
            test_config().with_dial_timeout(Duration::from_secs(1)),
            dialer,
        );

        let err = pool
            .checkout(&CancellationToken::new(), "client1")
            .await
            .unwrap_err();
        match err {
            PoolError::Dial { source, .. } => assert_eq!(source.kind(), io::ErrorKind::TimedOut),
            other => panic!("unexpected error: {other}"),
        }
        pool.close().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_dial_releases_capacity() {
        let dialer = Arc::new(MockDialer {
            delay: Some(Duration::from_secs(2)),
            ..Default::default()
        });
        let pool = ConnectionPool::with_dialer("test-pool", test_config().with_max_conn(1), dialer);

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            trigger.cancel();
        });

        let err = pool.checkout(&cancel, "client1").await.unwrap_err();
        match err {
            PoolError::Dial { source, .. } => assert_eq!(source.kind(), io::ErrorKind::Interrupted),
            other => panic!("unexpected error: {other}"),
        }

        // capacity came back, so a fresh checkout may dial again
        let conn = pool
            .checkout(&CancellationToken::new(), "client2")
            .await
            .unwrap();
        assert_eq!(conn.client_id(), "client2");
        pool.close().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_in_flight_dial_holds_capacity() {
        let dialer = Arc::new(MockDialer {
            delay: Some(Duration::from_secs(1)),
            ..Default::default()
        });
        let pool = Arc::new(ConnectionPool::with_dialer(
            "test-pool",
            test_config().with_max_conn(1),
            dialer,
        ));

        let background = Arc::clone(&pool);
        let first = tokio::spawn(async move {
            background
                .checkout(&CancellationToken::new(), "client1")
                .await
        });
        while pool.shared.state.read().dialing == 0 {
            tokio::task::yield_now().await;
        }

        let err = pool
            .checkout(&CancellationToken::new(), "client2")
            .await
            .unwrap_err();
        assert!(err.is_exhausted());

        assert!(first.await.unwrap().is_ok());
        assert_eq!(pool.size(), 1);
        pool.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_return_nil_connection() {
        let pool = ConnectionPool::with_dialer("test-pool", test_config(), Arc::new(MockDialer::default()));
        let before = pool.stats();

        let err = pool.return_connection(None::<Arc<Connection>>).await.unwrap_err();
        assert!(matches!(err, PoolError::NilConnection));
        assert!(err.to_string().contains("cannot return nil connection"));
        assert_eq!(pool.stats(), before);
        pool.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_return_stale_connection_closes_it() {
        let pool = ConnectionPool::with_dialer(
            "test-pool",
            test_config().with_idle_timeout(Duration::from_millis(100)),
            Arc::new(MockDialer::default()),
        );
        let shutdowns = Arc::new(AtomicUsize::new(0));
        let conn = mock_connection("stale-conn", &shutdowns, false);
        conn.set_last_used(Instant::now() - Duration::from_millis(200));
        insert_checked_out(&pool, &conn);

        pool.return_connection(Arc::clone(&conn)).await.unwrap();

        assert!(pool.is_empty());
        assert_eq!(pool.idle_count(), 0);
        assert_eq!(shutdowns.load(Ordering::SeqCst), 1);
        assert_eq!(pool.stats().connections_closed, 1);
        pool.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_return_evicted_connection_is_discarded() {
        let pool = ConnectionPool::with_dialer("test-pool", test_config(), Arc::new(MockDialer::default()));
        let shutdowns = Arc::new(AtomicUsize::new(0));
        let conn = mock_connection("test-pool-evicted", &shutdowns, false);

        pool.return_connection(Arc::clone(&conn)).await.unwrap();

        assert!(pool.is_empty());
        assert!(!conn.is_open());
        assert_eq!(shutdowns.load(Ordering::SeqCst), 1);
        pool.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_foreign_connection_is_rejected() {
        let pool = ConnectionPool::with_dialer("test-pool", test_config(), Arc::new(MockDialer::default()));
        let shutdowns = Arc::new(AtomicUsize::new(0));
        let conn = Arc::new(Connection::new(
            "gnomad-1".to_string(),
            "gnomad",
            "tcp",
            "127.0.0.1:9001",
            Some(Box::new(MockTransport {
                shutdowns: shutdowns.clone(),
                fail_shutdown: false,
            })),
            "client1",
            Duration::ZERO,
        ));

        let err = pool.return_connection(Arc::clone(&conn)).await.unwrap_err();
        assert!(matches!(err, PoolError::ForeignConnection { .. }));
        assert!(err.to_string().contains("gnomad-1"));

        // the owning pool still has a usable connection
        assert!(conn.is_open());
        assert_eq!(shutdowns.load(Ordering::SeqCst), 0);
        assert!(pool.is_empty());
        pool.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_double_return_is_ignored() {
        let pool = ConnectionPool::with_dialer("test-pool", test_config(), Arc::new(MockDialer::default()));
        let conn = pool
            .checkout(&CancellationToken::new(), "client1")
            .await
            .unwrap();

        pool.return_connection(Arc::clone(&conn)).await.unwrap();
        pool.return_connection(Arc::clone(&conn)).await.unwrap();

        assert_eq!(pool.idle_count(), 1);
        assert_eq!(pool.size(), 1);
        pool.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_liveness_check() {
        let pool = ConnectionPool::with_dialer(
            "test-pool",
            test_config().with_idle_timeout(Duration::from_millis(100)),
            Arc::new(MockDialer::default()),
        );
        let shutdowns = Arc::new(AtomicUsize::new(0));

        let fresh = mock_connection("fresh", &shutdowns, false);
        assert!(pool.shared.is_connection_healthy(&fresh));

        let stale = mock_connection("stale", &shutdowns, false);
        stale.set_last_used(Instant::now() - Duration::from_millis(200));
        assert!(!pool.shared.is_connection_healthy(&stale));

        let detached = Arc::new(Connection::new(
            "detached".to_string(),
            "test-pool",
            "tcp",
            "",
            None,
            "",
            Duration::ZERO,
        ));
        assert!(!pool.shared.is_connection_healthy(&detached));
        pool.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_idle_sweep_removes_only_expired() {
        let pool = ConnectionPool::with_dialer(
            "test-pool",
            test_config().with_idle_timeout(Duration::from_millis(100)),
            Arc::new(MockDialer::default()),
        );
        let stale_shutdowns = Arc::new(AtomicUsize::new(0));
        let fresh_shutdowns = Arc::new(AtomicUsize::new(0));

        let stale = mock_connection("stale-conn", &stale_shutdowns, false);
        insert_idle(&pool, &stale);
        stale.set_last_used(Instant::now() - Duration::from_millis(200));
        insert_idle(&pool, &mock_connection("fresh-conn", &fresh_shutdowns, false));

        // checked out and stale: not the idle sweep's business
        let busy = mock_connection("busy-conn", &fresh_shutdowns, false);
        busy.set_last_used(Instant::now() - Duration::from_millis(200));
        insert_checked_out(&pool, &busy);

        assert_eq!(pool.shared.sweep_idle().await, 1);

        assert_eq!(pool.size(), 2);
        assert_eq!(pool.idle_count(), 1);
        assert_eq!(stale_shutdowns.load(Ordering::SeqCst), 1);
        assert_eq!(fresh_shutdowns.load(Ordering::SeqCst), 0);
        assert_eq!(pool.stats().connections_closed, 1);
        pool.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_health_sweep_evicts_idle_and_checked_out() {
        let pool = ConnectionPool::with_dialer(
            "test-pool",
            test_config().with_idle_timeout(Duration::from_millis(100)),
            Arc::new(MockDialer::default()),
        );
        let shutdowns = Arc::new(AtomicUsize::new(0));

        let stale_idle = mock_connection("stale-idle", &shutdowns, false);
        insert_idle(&pool, &stale_idle);
        stale_idle.set_last_used(Instant::now() - Duration::from_millis(200));

        let stale_busy = mock_connection("stale-busy", &shutdowns, false);
        stale_busy.set_last_used(Instant::now() - Duration::from_millis(200));
        insert_checked_out(&pool, &stale_busy);

        let fresh = mock_connection("fresh", &shutdowns, false);
        insert_checked_out(&pool, &fresh);

        assert_eq!(pool.health_check().await, 2);

        assert_eq!(pool.size(), 1);
        assert_eq!(pool.idle_count(), 0);
        assert_eq!(shutdowns.load(Ordering::SeqCst), 2);
        assert!(!stale_busy.health().is_healthy);
        assert_eq!(stale_busy.health().failure_count, 1);
        assert!(fresh.health().is_healthy);

        let stats = pool.stats();
        assert_eq!(stats.connections_closed, 2);
        assert_eq!(stats.health_checks_failed, 2);
        pool.close().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_sweep_runs_on_interval() {
        let pool = ConnectionPool::with_dialer(
            "test-pool",
            test_config()
                .with_idle_timeout(Duration::from_secs(45))
                .with_maintenance_interval(Duration::from_secs(30)),
            Arc::new(MockDialer::default()),
        );
        let conn = pool
            .checkout(&CancellationToken::new(), "client1")
            .await
            .unwrap();
        pool.return_connection(conn).await.unwrap();
        assert_eq!(pool.idle_count(), 1);

        // the 30s sweep finds it within the timeout
        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(pool.idle_count(), 1);

        // the 60s sweep sees it idle past 45s
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(pool.idle_count(), 0);
        assert!(pool.is_empty());
        pool.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_close_closes_every_connection_once() {
        let pool = ConnectionPool::with_dialer("test-pool", test_config(), Arc::new(MockDialer::default()));
        let counts: Vec<_> = (0..3).map(|_| Arc::new(AtomicUsize::new(0))).collect();
        for (i, count) in counts.iter().enumerate() {
            let conn = mock_connection(&format!("conn-{i}"), count, false);
            if i == 0 {
                insert_idle(&pool, &conn);
            } else {
                insert_checked_out(&pool, &conn);
            }
        }

        pool.close().await.unwrap();
        assert!(pool.is_empty());
        assert_eq!(pool.idle_count(), 0);
        assert!(pool.is_closed());
        for count in &counts {
            assert_eq!(count.load(Ordering::SeqCst), 1);
        }

        // closing again is safe and touches nothing
        pool.close().await.unwrap();
        for count in &counts {
            assert_eq!(count.load(Ordering::SeqCst), 1);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_during_dial_discards_connection() {
        let dialer = Arc::new(MockDialer {
            delay: Some(Duration::from_millis(200)),
            ..Default::default()
        });
        let pool = Arc::new(ConnectionPool::with_dialer("test-pool", test_config(), dialer.clone()));

        let background = Arc::clone(&pool);
        let pending = tokio::spawn(async move {
            background
                .checkout(&CancellationToken::new(), "client1")
                .await
        });
        while pool.shared.state.read().dialing == 0 {
            tokio::task::yield_now().await;
        }

        pool.close().await.unwrap();
        assert!(pool.is_closed());

        let err = pending.await.unwrap().unwrap_err();
        assert!(err.is_closed());
        assert!(pool.is_empty());
        assert_eq!(pool.shared.state.read().dialing, 0);
        assert_eq!(pool.stats().connections_created, 0);
        // the late transport was shut down rather than leaked
        assert_eq!(dialer.shutdowns.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_checkout_after_close_fails() {
        let dialer = Arc::new(MockDialer::default());
        let pool = ConnectionPool::with_dialer("test-pool", test_config(), dialer.clone());
        pool.close().await.unwrap();

        let err = pool
            .checkout(&CancellationToken::new(), "client1")
            .await
            .unwrap_err();
        assert!(matches!(err, PoolError::PoolClosed(ref name) if name == "test-pool"));
        assert_eq!(dialer.dials.load(Ordering::SeqCst), 0);
        assert!(pool.is_empty());
    }

    #[tokio::test]
    async fn test_close_does_not_wait_for_transport_holder() {
        let dialer = Arc::new(MockDialer::default());
        let pool = ConnectionPool::with_dialer("test-pool", test_config(), dialer.clone());
        let conn = pool
            .checkout(&CancellationToken::new(), "client1")
            .await
            .unwrap();

        let guard = conn.transport().await;
        let closed = tokio::time::timeout(Duration::from_secs(2), pool.close()).await;
        assert!(closed.is_ok_and(|res| res.is_ok()));
        assert!(!conn.is_open());
        assert!(pool.is_empty());

        // the holder's stream is released with its guard
        assert!(guard.is_some());
        drop(guard);
        assert!(conn.transport().await.is_none());
        assert_eq!(dialer.shutdowns.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_health_sweep_does_not_wait_for_transport_holder() {
        let pool = ConnectionPool::with_dialer(
            "test-pool",
            test_config().with_idle_timeout(Duration::from_millis(100)),
            Arc::new(MockDialer::default()),
        );
        let shutdowns = Arc::new(AtomicUsize::new(0));
        let busy = mock_connection("busy-conn", &shutdowns, false);
        busy.set_last_used(Instant::now() - Duration::from_millis(200));
        insert_checked_out(&pool, &busy);

        let guard = busy.transport().await;
        let evicted = tokio::time::timeout(Duration::from_secs(2), pool.health_check()).await;
        assert_eq!(evicted.ok(), Some(1));
        assert!(!busy.is_open());
        drop(guard);
        assert!(busy.transport().await.is_none());
        pool.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_close_aggregates_failures() {
        let pool = ConnectionPool::with_dialer("test-pool", test_config(), Arc::new(MockDialer::default()));
        let shutdowns = Arc::new(AtomicUsize::new(0));
        insert_checked_out(&pool, &mock_connection("bad-1", &shutdowns, true));
        insert_checked_out(&pool, &mock_connection("good", &shutdowns, false));
        insert_checked_out(&pool, &mock_connection("bad-2", &shutdowns, true));

        let err = pool.close().await.unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("bad-1"));
        assert!(msg.contains("bad-2"));
        assert!(!msg.contains("good"));
        assert_eq!(shutdowns.load(Ordering::SeqCst), 3);
        assert!(pool.is_empty());
    }

    #[tokio::test]
    async fn test_utilization() {
        let pool = ConnectionPool::with_dialer(
            "test-pool",
            test_config().with_max_conn(10),
            Arc::new(MockDialer::default()),
        );
        let shutdowns = Arc::new(AtomicUsize::new(0));
        for i in 0..5 {
            let conn = mock_connection(&format!("conn-{i}"), &shutdowns, false);
            if i < 2 {
                insert_idle(&pool, &conn);
            } else {
                insert_checked_out(&pool, &conn);
            }
        }

        let stats = pool.stats();
        assert_eq!(stats.active_connections, 3);
        assert_eq!(stats.idle_connections, 2);
        assert_eq!(stats.total_connections, 5);
        assert_eq!(stats.pool_utilization, 0.5);
        pool.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_connection_ids_are_unique() {
        let pool = ConnectionPool::with_dialer("test-pool", test_config(), Arc::new(MockDialer::default()));
        let id1 = pool.shared.next_connection_id();
        let id2 = pool.shared.next_connection_id();
        assert_ne!(id1, id2);
        assert!(id1.contains("test-pool"));
        assert!(id2.contains("test-pool"));
        pool.close().await.unwrap();
    }
}
