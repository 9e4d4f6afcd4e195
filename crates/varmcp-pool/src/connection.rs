//! Pooled connection handle and its usage/health metadata.

use std::collections::HashMap;
use std::io;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::trace;

use crate::transport::{self, BoxedTransport};

/// Upper bound on a graceful transport shutdown
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Health snapshot kept for each connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionHealth {
    /// Result of the most recent liveness check
    pub is_healthy: bool,

    /// When the connection was last checked
    pub last_check: DateTime<Utc>,

    /// Consecutive failed checks
    pub failure_count: u32,

    /// Observed latency in milliseconds (dial time for new connections)
    pub latency_ms: u64,

    /// Reason for the last failed check
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl ConnectionHealth {
    fn healthy(latency: Duration) -> Self {
        Self {
            is_healthy: true,
            last_check: Utc::now(),
            failure_count: 0,
            latency_ms: u64::try_from(latency.as_millis()).unwrap_or(u64::MAX),
            error_message: None,
        }
    }
}

/// Serializable point-in-time view of a connection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    /// Connection identifier
    pub id: String,
    /// Protocol the connection was dialed with
    pub protocol: String,
    /// Dialed address
    pub address: String,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last checkout time
    pub last_used: DateTime<Utc>,
    /// Number of checkouts served
    pub use_count: u64,
    /// Whether the connection sits in the idle list
    pub is_idle: bool,
    /// Client holding the connection, empty while idle
    pub client_id: String,
    /// Free-form annotations
    pub metadata: HashMap<String, String>,
    /// Health snapshot
    pub health_status: ConnectionHealth,
}

#[derive(Debug)]
struct Usage {
    last_used: Instant,
    use_count: u64,
    is_idle: bool,
    client_id: String,
    metadata: HashMap<String, String>,
    health: ConnectionHealth,
}

/// A managed connection owned by exactly one pool
///
/// Handed out as `Arc<Connection>` by checkout. Callers use the wrapped
/// transport through [`Connection::transport`] and give the handle back to
/// the pool when done; every state transition is made by the owning pool.
///
/// The pool may close a connection while a caller still holds its
/// transport. Long reads should race [`Connection::closed`] so they end
/// promptly; the stream itself is dropped when the caller's guard goes away.
#[derive(Debug)]
pub struct Connection {
    id: String,
    pool: String,
    protocol: String,
    address: String,
    created_at: Instant,
    created_wall: DateTime<Utc>,
    open: AtomicBool,
    closing: CancellationToken,
    usage: Mutex<Usage>,
    transport: tokio::sync::Mutex<Option<BoxedTransport>>,
}

/// Exclusive access to a connection's transport
///
/// Dereferences to `Option<BoxedTransport>`, which is `None` once the
/// connection is closed. If the pool closes the connection while the guard
/// is held, the transport is dropped when the guard is.
#[derive(Debug)]
pub struct TransportGuard<'a> {
    conn: &'a Connection,
    inner: tokio::sync::MutexGuard<'a, Option<BoxedTransport>>,
}

impl Deref for TransportGuard<'_> {
    type Target = Option<BoxedTransport>;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl DerefMut for TransportGuard<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.inner
    }
}

impl Drop for TransportGuard<'_> {
    fn drop(&mut self) {
        if !self.conn.is_open() && self.inner.take().is_some() {
            trace!("Dropped transport of closed connection {}", self.conn.id);
        }
    }
}

impl Connection {
    /// New checked-out connection as produced by a successful dial
    pub(crate) fn new(
        id: String,
        pool: impl Into<String>,
        protocol: impl Into<String>,
        address: impl Into<String>,
        transport: Option<BoxedTransport>,
        client_id: impl Into<String>,
        dial_latency: Duration,
    ) -> Self {
        let now = Instant::now();
        let open = transport.is_some();
        let closing = CancellationToken::new();
        if !open {
            closing.cancel();
        }
        Self {
            id,
            pool: pool.into(),
            protocol: protocol.into(),
            address: address.into(),
            created_at: now,
            created_wall: Utc::now(),
            open: AtomicBool::new(open),
            closing,
            usage: Mutex::new(Usage {
                last_used: now,
                use_count: 1,
                is_idle: false,
                client_id: client_id.into(),
                metadata: HashMap::new(),
                health: ConnectionHealth::healthy(dial_latency),
            }),
            transport: tokio::sync::Mutex::new(transport),
        }
    }

    /// Connection identifier, unique within its pool
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Name of the pool that created the connection
    #[must_use]
    pub fn pool(&self) -> &str {
        &self.pool
    }

    /// Protocol the connection was dialed with
    #[must_use]
    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    /// Dialed address
    #[must_use]
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Creation instant
    #[must_use]
    pub const fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Instant of the last checkout
    #[must_use]
    pub fn last_used(&self) -> Instant {
        self.usage.lock().last_used
    }

    /// Time elapsed since the last checkout
    #[must_use]
    pub fn idle_for(&self) -> Duration {
        Instant::now().saturating_duration_since(self.last_used())
    }

    /// Number of checkouts served
    #[must_use]
    pub fn use_count(&self) -> u64 {
        self.usage.lock().use_count
    }

    /// Whether the connection is in its pool's idle list
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.usage.lock().is_idle
    }

    /// Client currently holding the connection, empty while idle
    #[must_use]
    pub fn client_id(&self) -> String {
        self.usage.lock().client_id.clone()
    }

    /// Whether the transport handle is still present
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// Latest health snapshot
    #[must_use]
    pub fn health(&self) -> ConnectionHealth {
        self.usage.lock().health.clone()
    }

    /// Read a metadata annotation
    #[must_use]
    pub fn metadata(&self, key: &str) -> Option<String> {
        self.usage.lock().metadata.get(key).cloned()
    }

    /// Attach a metadata annotation
    pub fn set_metadata(&self, key: impl Into<String>, value: impl Into<String>) {
        self.usage.lock().metadata.insert(key.into(), value.into());
    }

    /// Exclusive access to the wrapped transport
    ///
    /// Yields `None` once the pool has closed the connection.
    pub async fn transport(&self) -> TransportGuard<'_> {
        let mut inner = self.transport.lock().await;
        if !self.is_open() {
            inner.take();
        }
        TransportGuard { conn: self, inner }
    }

    /// Resolves once the pool has closed the connection
    pub fn closed(&self) -> WaitForCancellationFuture<'_> {
        self.closing.cancelled()
    }

    /// Serializable snapshot
    #[must_use]
    pub fn info(&self) -> ConnectionInfo {
        let usage = self.usage.lock();
        let wall_now = Utc::now();
        let since_use = chrono::Duration::from_std(usage.last_used.elapsed())
            .unwrap_or_else(|_| chrono::Duration::zero());
        ConnectionInfo {
            id: self.id.clone(),
            protocol: self.protocol.clone(),
            address: self.address.clone(),
            created_at: self.created_wall,
            last_used: wall_now - since_use,
            use_count: usage.use_count,
            is_idle: usage.is_idle,
            client_id: usage.client_id.clone(),
            metadata: usage.metadata.clone(),
            health_status: usage.health.clone(),
        }
    }

    pub(crate) fn mark_checked_out(&self, client_id: &str) {
        let mut usage = self.usage.lock();
        usage.is_idle = false;
        usage.last_used = Instant::now();
        usage.use_count += 1;
        usage.client_id = client_id.to_string();
    }

    pub(crate) fn mark_idle(&self) {
        let mut usage = self.usage.lock();
        usage.is_idle = true;
        usage.client_id.clear();
    }

    pub(crate) fn record_health_check(&self, healthy: bool, error_message: Option<String>) {
        let mut usage = self.usage.lock();
        usage.health.is_healthy = healthy;
        usage.health.last_check = Utc::now();
        if healthy {
            usage.health.failure_count = 0;
            usage.health.error_message = None;
        } else {
            usage.health.failure_count += 1;
            usage.health.error_message = error_message;
        }
    }

    #[cfg(test)]
    pub(crate) fn set_last_used(&self, at: Instant) {
        self.usage.lock().last_used = at;
    }

    #[cfg(test)]
    pub(crate) fn set_use_count(&self, count: u64) {
        self.usage.lock().use_count = count;
    }

    /// Close the transport; only the first call reaches it
    ///
    /// Never waits on a caller holding the transport: in that case the
    /// stream is dropped when the caller's guard is released.
    pub(crate) async fn close(&self) -> io::Result<()> {
        if !self.open.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        self.closing.cancel();

        let transport = match self.transport.try_lock() {
            Ok(mut slot) => slot.take(),
            Err(_) => {
                trace!("Connection {} is in use, deferring transport drop", self.id);
                return Ok(());
            }
        };
        let Some(transport) = transport else {
            return Ok(());
        };

        match tokio::time::timeout(SHUTDOWN_TIMEOUT, transport::shutdown(transport)).await {
            Ok(result) => result,
            Err(_) => Err(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("shutdown timed out after {SHUTDOWN_TIMEOUT:?}"),
            )),
        }
    }
}
