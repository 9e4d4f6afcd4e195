//! Pool error types.

use std::io;

use thiserror::Error;

/// Result type for pool operations
pub type PoolResult<T> = std::result::Result<T, PoolError>;

/// Errors that can occur in pool and manager operations
#[derive(Error, Debug)]
pub enum PoolError {
    /// Configuration error (duplicate pool, unsupported protocol, unreadable config)
    #[error("Configuration error: {0}")]
    Config(String),

    /// No idle connection and the pool is at capacity
    #[error("connection pool exhausted for {pool}")]
    Exhausted {
        /// Name of the exhausted pool
        pool: String,
    },

    /// Establishing a new transport failed
    #[error("failed to create connection for pool {pool} to {address}: {source}")]
    Dial {
        /// Pool that attempted the dial
        pool: String,
        /// Address that was dialed
        address: String,
        /// Underlying transport error
        #[source]
        source: io::Error,
    },

    /// A `None` connection was handed back
    #[error("cannot return nil connection")]
    NilConnection,

    /// Operation against an unregistered pool name
    #[error("pool not found: {0}")]
    PoolNotFound(String),

    /// Connection handed back to a pool that did not create it
    #[error("connection {connection} does not belong to pool {pool}")]
    ForeignConnection {
        /// Pool the connection was returned to
        pool: String,
        /// Identifier of the returned connection
        connection: String,
    },

    /// Checkout against a pool that has been closed
    #[error("pool closed: {0}")]
    PoolClosed(String),

    /// Checkout or registration after the manager was closed
    #[error("pool manager closed")]
    ManagerClosed,

    /// One or more resources failed to close during shutdown
    #[error("errors closing {scope}: [{}]", .errors.join("; "))]
    Close {
        /// What was being closed ("connections" or "pools")
        scope: &'static str,
        /// Individual failures
        errors: Vec<String>,
    },
}

impl PoolError {
    /// Build a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Whether this error reports pool exhaustion
    #[must_use]
    pub const fn is_exhausted(&self) -> bool {
        matches!(self, Self::Exhausted { .. })
    }

    /// Whether this error reports a dial failure
    #[must_use]
    pub const fn is_dial(&self) -> bool {
        matches!(self, Self::Dial { .. })
    }

    /// Whether this error reports an unknown pool name
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::PoolNotFound(_))
    }

    /// Whether this error reports a closed pool or manager
    #[must_use]
    pub const fn is_closed(&self) -> bool {
        matches!(self, Self::PoolClosed(_) | Self::ManagerClosed)
    }

    /// Fold a list of close failures into a single result
    pub(crate) fn from_close_failures(scope: &'static str, errors: Vec<String>) -> PoolResult<()> {
        if errors.is_empty() {
            Ok(())
        } else {
            Err(Self::Close { scope, errors })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exhausted_names_pool() {
        let err = PoolError::Exhausted {
            pool: "clinvar".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("clinvar"));
        assert!(msg.contains("exhausted"));
        assert!(err.is_exhausted());
    }

    #[test]
    fn test_dial_error_keeps_source() {
        let err = PoolError::Dial {
            pool: "gnomad".to_string(),
            address: "127.0.0.1:1".to_string(),
            source: io::Error::new(io::ErrorKind::ConnectionRefused, "refused"),
        };
        assert!(err.is_dial());
        assert!(std::error::Error::source(&err).is_some());
        assert!(err.to_string().contains("127.0.0.1:1"));
    }

    #[test]
    fn test_closed_errors() {
        let err = PoolError::PoolClosed("clinvar".to_string());
        assert!(err.is_closed());
        assert_eq!(err.to_string(), "pool closed: clinvar");
        assert!(PoolError::ManagerClosed.is_closed());
        assert!(!PoolError::NilConnection.is_closed());
    }

    #[test]
    fn test_close_failures_aggregate() {
        assert!(PoolError::from_close_failures("connections", Vec::new()).is_ok());

        let err = PoolError::from_close_failures(
            "pools",
            vec!["pool a: boom".to_string(), "pool b: bang".to_string()],
        )
        .unwrap_err();
        let msg = err.to_string();
        assert!(msg.starts_with("errors closing pools"));
        assert!(msg.contains("pool a: boom"));
        assert!(msg.contains("pool b: bang"));
    }
}
