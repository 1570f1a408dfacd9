//! Lease Store Port (Driven Port)
//!
//! Distributed lock primitive: atomic create-if-absent-with-TTL plus
//! owner-guarded renewal and release. An expired record counts as absent.

use std::time::Duration;

use async_trait::async_trait;

use crate::domain::leadership::LeaseRecord;

/// Lease store error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LeaseError {
    /// Store unreachable.
    #[error("lease store connection error: {message}")]
    ConnectionError {
        /// Error detail.
        message: String,
    },

    /// Store rejected the operation.
    #[error("lease operation failed: {message}")]
    OperationFailed {
        /// Error detail.
        message: String,
    },
}

/// Port for the leadership lease.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LeaseStorePort: Send + Sync {
    /// Create the lease for `owner` if absent or expired.
    ///
    /// Returns `true` when `owner` now holds the lease.
    async fn try_acquire(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool, LeaseError>;

    /// Extend the lease if `owner` still holds it.
    ///
    /// Returns `false` when the lease expired or belongs to someone else.
    async fn renew(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool, LeaseError>;

    /// Drop the lease if `owner` holds it.
    async fn release(&self, key: &str, owner: &str) -> Result<(), LeaseError>;

    /// Read the current valid record, if any.
    async fn current(&self, key: &str) -> Result<Option<LeaseRecord>, LeaseError>;
}
