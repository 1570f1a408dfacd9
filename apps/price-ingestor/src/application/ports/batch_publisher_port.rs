//! Batch Publisher Port (Driven Port)
//!
//! Hand-off of persisted batches to local consumers and follower workers.

use async_trait::async_trait;

use super::BroadcastError;
use crate::domain::pricing::PriceBatch;

/// Port for fanning out persisted batches.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BatchPublisherPort: Send + Sync {
    /// Publish a persisted batch; returns the number of frames emitted.
    async fn publish(&self, batch: &PriceBatch) -> Result<usize, BroadcastError>;
}

/// Publisher that drops every batch, for persistence-only runs and tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpBatchPublisher;

#[async_trait]
impl BatchPublisherPort for NoOpBatchPublisher {
    async fn publish(&self, _batch: &PriceBatch) -> Result<usize, BroadcastError> {
        Ok(0)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;

    #[tokio::test]
    async fn no_op_publisher_succeeds() {
        let batch = PriceBatch {
            sequence: 1,
            flushed_at: Utc::now(),
            updates: Vec::new(),
        };
        assert_eq!(NoOpBatchPublisher.publish(&batch).await.unwrap(), 0);
    }
}
