use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;

use crate::application::ports::{BroadcastChannelPort, BroadcastError, FrameStream};

/// Process-local broadcast channel with a payload size limit.
#[derive(Debug)]
pub struct InMemoryBroadcastChannel {
    tx: broadcast::Sender<String>,
    max_payload_bytes: usize,
}

impl InMemoryBroadcastChannel {
    /// Create a channel rejecting payloads larger than `max_payload_bytes`.
    #[must_use]
    pub fn new(max_payload_bytes: usize) -> Self {
        Self {
            tx: broadcast::channel(4_096).0,
            max_payload_bytes,
        }
    }

    /// Active subscriptions.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

#[async_trait]
impl BroadcastChannelPort for InMemoryBroadcastChannel {
    async fn publish(&self, payload: String) -> Result<(), BroadcastError> {
        if payload.len() > self.max_payload_bytes {
            return Err(BroadcastError::PayloadTooLarge {
                size: payload.len(),
                limit: self.max_payload_bytes,
            });
        }
        // No subscribers is not an error.
        let _ = self.tx.send(payload);
        Ok(())
    }

    async fn subscribe(&self) -> Result<FrameStream, BroadcastError> {
        let stream = BroadcastStream::new(self.tx.subscribe()).map(|item| {
            item.map_err(|BroadcastStreamRecvError::Lagged(skipped)| {
                BroadcastError::ConnectionError {
                    message: format!("subscriber lagged by {skipped} payloads"),
                }
            })
        });
        Ok(stream.boxed())
    }

    fn max_payload_bytes(&self) -> usize {
        self.max_payload_bytes
    }
}
