//! Local fan-out of batch frames to in-process consumers.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::broadcast;

use super::frame::BatchFrame;

/// In-process broadcast of batch frames.
///
/// Leader and follower hubs carry identical frames; consumers cannot tell
/// which role their worker holds.
///
/// # Example
///
/// ```rust
/// use price_ingestor::infrastructure::broadcast::BroadcastHub;
///
/// let hub = BroadcastHub::new(1_024);
/// let _rx = hub.subscribe();
/// assert_eq!(hub.receiver_count(), 1);
/// ```
#[derive(Debug)]
pub struct BroadcastHub {
    frames_tx: broadcast::Sender<Arc<BatchFrame>>,
}

impl BroadcastHub {
    /// Create a hub buffering up to `capacity` frames per slow receiver.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            frames_tx: broadcast::channel(capacity.max(1)).0,
        }
    }

    /// Send a frame to every local receiver.
    ///
    /// Returns the number of receivers, or `None` when there are none.
    #[must_use]
    pub fn send_frame(&self, frame: BatchFrame) -> Option<usize> {
        self.frames_tx.send(Arc::new(frame)).ok()
    }

    /// New receiver for frames sent from now on.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<BatchFrame>> {
        self.frames_tx.subscribe()
    }

    /// Active receivers.
    #[must_use]
    pub fn receiver_count(&self) -> usize {
        self.frames_tx.receiver_count()
    }

    /// Statistics for health output.
    #[must_use]
    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            receivers: self.receiver_count(),
        }
    }
}

/// Shared broadcast hub reference.
pub type SharedBroadcastHub = Arc<BroadcastHub>;

/// Statistics about the local hub.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BroadcastStats {
    /// Active local receivers.
    pub receivers: usize,
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;

    fn frame(sequence: u64) -> BatchFrame {
        BatchFrame {
            origin: "w1".to_string(),
            sequence,
            part: 1,
            parts: 1,
            flushed_at: Utc::now(),
            updates: Vec::new(),
        }
    }

    #[test]
    fn receiver_count_tracks_drops() {
        let hub = BroadcastHub::new(16);
        {
            let _rx = hub.subscribe();
            assert_eq!(hub.stats().receivers, 1);
        }
        assert_eq!(hub.receiver_count(), 0);
    }

    #[test]
    fn send_with_no_receivers_returns_none() {
        let hub = BroadcastHub::new(16);
        assert!(hub.send_frame(frame(1)).is_none());
    }

    #[tokio::test]
    async fn every_receiver_gets_the_same_frame() {
        let hub = BroadcastHub::new(16);
        let mut rx1 = hub.subscribe();
        let mut rx2 = hub.subscribe();

        assert_eq!(hub.send_frame(frame(7)), Some(2));

        assert_eq!(rx1.recv().await.unwrap().sequence, 7);
        assert_eq!(rx2.recv().await.unwrap().sequence, 7);
    }
}
