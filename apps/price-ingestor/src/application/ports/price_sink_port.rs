//! Price Sink Port (Driven Port)
//!
//! Accepts one batched "apply latest values" upsert per flush. Applying the
//! same batch twice must leave the store unchanged.

use async_trait::async_trait;

use crate::domain::pricing::PendingUpdate;

/// Persistence error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SinkError {
    /// Store unreachable.
    #[error("price sink connection error: {message}")]
    ConnectionError {
        /// Error detail.
        message: String,
    },

    /// Upsert rejected.
    #[error("price sink write failed: {message}")]
    WriteFailed {
        /// Error detail.
        message: String,
    },
}

/// Port for persisting flushed batches.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PriceSinkPort: Send + Sync {
    /// Upsert the latest values for each entity in `updates`.
    ///
    /// Returns the number of rows written.
    async fn upsert_latest(&self, updates: &[PendingUpdate]) -> Result<u64, SinkError>;
}
