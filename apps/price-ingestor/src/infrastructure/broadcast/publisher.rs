//! Leader-side batch publisher.

use std::sync::Arc;

use async_trait::async_trait;

use super::frame::split_batch;
use super::hub::BroadcastHub;
use crate::application::ports::{BatchPublisherPort, BroadcastChannelPort, BroadcastError};
use crate::domain::leadership::WorkerId;
use crate::domain::pricing::PriceBatch;
use crate::infrastructure::metrics;

/// Splits persisted batches into frames, delivers them to the local hub and
/// publishes them on the shared channel.
pub struct BroadcastPublisher {
    origin: WorkerId,
    hub: Arc<BroadcastHub>,
    channel: Arc<dyn BroadcastChannelPort>,
}

impl BroadcastPublisher {
    /// Create a publisher tagging frames with `origin`.
    #[must_use]
    pub fn new(
        origin: WorkerId,
        hub: Arc<BroadcastHub>,
        channel: Arc<dyn BroadcastChannelPort>,
    ) -> Self {
        Self {
            origin,
            hub,
            channel,
        }
    }
}

impl std::fmt::Debug for BroadcastPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BroadcastPublisher")
            .field("origin", &self.origin)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl BatchPublisherPort for BroadcastPublisher {
    async fn publish(&self, batch: &PriceBatch) -> Result<usize, BroadcastError> {
        let frames = split_batch(
            self.origin.as_str(),
            batch,
            self.channel.max_payload_bytes(),
        )?;
        let count = frames.len();

        let mut payloads = Vec::with_capacity(count);
        for encoded in frames {
            let _ = self.hub.send_frame(encoded.frame);
            payloads.push(encoded.payload);
        }

        let mut published = 0_u64;
        for payload in payloads {
            if let Err(e) = self.channel.publish(payload).await {
                metrics::record_frames_published(published);
                return Err(e);
            }
            published += 1;
        }
        metrics::record_frames_published(published);

        tracing::debug!(
            sequence = batch.sequence,
            entities = batch.len(),
            frames = count,
            "Published batch"
        );
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use mockall::predicate::always;
    use rust_decimal::Decimal;

    use super::*;
    use crate::application::ports::MockBroadcastChannelPort;
    use crate::domain::instrument::{EntityId, TickerId};
    use crate::domain::pricing::PendingUpdate;

    fn batch(n: usize) -> PriceBatch {
        let now = Utc::now();
        PriceBatch {
            sequence: 3,
            flushed_at: now,
            updates: (0..n)
                .map(|i| PendingUpdate {
                    entity_id: EntityId::new(format!("e{i}")),
                    ticker_id: TickerId::new(format!("t{i}")),
                    side: None,
                    best_bid: Some(Decimal::new(40, 2)),
                    best_ask: Some(Decimal::new(42, 2)),
                    mid: Some(Decimal::new(41, 2)),
                    spread: Some(Decimal::new(2, 2)),
                    last_trade: None,
                    exchange_ts: now,
                    received_at: now,
                })
                .collect(),
        }
    }

    #[tokio::test]
    async fn publishes_locally_and_on_channel() {
        let hub = Arc::new(BroadcastHub::new(16));
        let mut rx = hub.subscribe();

        let mut channel = MockBroadcastChannelPort::new();
        channel.expect_max_payload_bytes().return_const(7_500_usize);
        channel
            .expect_publish()
            .with(always())
            .times(1)
            .returning(|_| Ok(()));

        let publisher = BroadcastPublisher::new(WorkerId::new("w1"), hub, Arc::new(channel));
        assert_eq!(publisher.publish(&batch(2)).await.unwrap(), 1);

        let frame = rx.recv().await.unwrap();
        assert_eq!(frame.origin, "w1");
        assert_eq!(frame.sequence, 3);
        assert_eq!(frame.updates.len(), 2);
    }

    #[tokio::test]
    async fn channel_failure_still_delivers_locally() {
        let hub = Arc::new(BroadcastHub::new(16));
        let mut rx = hub.subscribe();

        let mut channel = MockBroadcastChannelPort::new();
        channel.expect_max_payload_bytes().return_const(7_500_usize);
        channel.expect_publish().returning(|_| {
            Err(BroadcastError::PublishFailed {
                message: "down".to_string(),
            })
        });

        let publisher = BroadcastPublisher::new(WorkerId::new("w1"), hub, Arc::new(channel));
        assert!(matches!(
            publisher.publish(&batch(1)).await,
            Err(BroadcastError::PublishFailed { .. })
        ));
        assert_eq!(rx.recv().await.unwrap().updates.len(), 1);
    }

    #[tokio::test]
    async fn empty_batch_emits_nothing() {
        let hub = Arc::new(BroadcastHub::new(16));
        let mut channel = MockBroadcastChannelPort::new();
        channel.expect_max_payload_bytes().return_const(7_500_usize);
        channel.expect_publish().never();

        let publisher = BroadcastPublisher::new(WorkerId::new("w1"), hub, Arc::new(channel));
        assert_eq!(publisher.publish(&batch(0)).await.unwrap(), 0);
    }
}
