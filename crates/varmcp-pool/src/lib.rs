//! # varmcp-pool
//!
//! Named, bounded pools of outbound TCP and Unix-socket connections for the
//! varmcp variant-classification MCP server. Each upstream evidence source
//! (ClinVar, gnomAD, COSMIC, ...) gets its own pool; a [`PoolManager`] owns
//! them all and creates them on first use.
//!
//! ## Behaviour
//!
//! - **Fail fast**: a full pool with nothing idle rejects checkout with
//!   [`PoolError::Exhausted`] instead of queueing the caller
//! - **LIFO reuse**: the most recently returned connection is handed out first
//! - **Idle sweep**: every pool closes idle connections past their idle timeout
//! - **Health sweep**: optional manager-wide eviction of stale connections,
//!   including checked-out ones
//! - **Statistics**: per-pool and manager-wide counters, optionally mirrored
//!   to the `metrics` facade with the `metrics` feature
//!
//! ## Example
//!
//! ```rust,no_run
//! use varmcp_pool::{ConnectionPoolConfig, PoolConfig, PoolManager};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run() -> varmcp_pool::PoolResult<()> {
//! let config = ConnectionPoolConfig::default()
//!     .with_pool("clinvar", PoolConfig::tcp("127.0.0.1:7400").with_max_conn(8));
//! let manager = PoolManager::new(config);
//!
//! let cancel = CancellationToken::new();
//! let conn = manager.checkout(&cancel, "clinvar", "client-1").await?;
//! // ... use conn.transport().await ...
//! manager.return_connection("clinvar", conn).await?;
//!
//! manager.close().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Module Organization
//!
//! ```text
//! varmcp-pool/
//! ├── config/       # Pool and manager configuration, JSON loading
//! ├── connection/   # Pooled connection handle and health snapshot
//! ├── transport/    # Transport trait and the dialer seam
//! ├── pool/         # Single bounded pool
//! ├── manager/      # Registry of named pools and health monitor
//! ├── stats/        # Statistics snapshots
//! └── error/        # Error types
//! ```

#![warn(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub,
    clippy::all
)]
#![deny(unsafe_code)]
#![allow(
    clippy::module_name_repetitions,
    clippy::missing_errors_doc,
    clippy::cast_precision_loss,
    clippy::must_use_candidate
)]

pub mod config;
pub mod connection;
pub mod error;
pub mod manager;
pub mod pool;
pub mod stats;
pub mod transport;

mod task;

pub use config::{ConnectionPoolConfig, PoolConfig, Protocol};
pub use connection::{Connection, ConnectionHealth, ConnectionInfo, TransportGuard};
pub use error::{PoolError, PoolResult};
pub use manager::PoolManager;
pub use pool::ConnectionPool;
pub use stats::{ManagerStats, PoolStats};
pub use transport::{BoxedTransport, Dialer, NetDialer, Transport};
