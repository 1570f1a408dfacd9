//! Follower Relay
//!
//! Followers never talk to the exchange. They subscribe to the shared
//! channel and replay the leader's frames into their own local hub, so
//! local consumers see the same frames on every worker.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio_util::sync::CancellationToken;

use super::frame::decode_frame;
use super::hub::BroadcastHub;
use crate::application::ports::BroadcastChannelPort;
use crate::domain::leadership::WorkerId;
use crate::infrastructure::metrics;

/// Delay before resubscribing after the channel stream ends or fails.
const RESUBSCRIBE_DELAY: Duration = Duration::from_secs(1);

/// Relays frames from the shared channel to the local hub.
pub struct FollowerRelay {
    worker_id: WorkerId,
    hub: Arc<BroadcastHub>,
    channel: Arc<dyn BroadcastChannelPort>,
}

impl FollowerRelay {
    /// Create a relay that skips frames originating from `worker_id`.
    #[must_use]
    pub fn new(
        worker_id: WorkerId,
        hub: Arc<BroadcastHub>,
        channel: Arc<dyn BroadcastChannelPort>,
    ) -> Self {
        Self {
            worker_id,
            hub,
            channel,
        }
    }

    /// Relay frames until `cancel` fires.
    pub async fn run(self, cancel: CancellationToken) {
        tracing::info!(worker_id = %self.worker_id, "Follower relay started");

        while !cancel.is_cancelled() {
            match self.channel.subscribe().await {
                Ok(mut stream) => loop {
                    tokio::select! {
                        () = cancel.cancelled() => break,
                        next = stream.next() => match next {
                            Some(Ok(payload)) => self.relay(&payload),
                            Some(Err(e)) => {
                                tracing::warn!(error = %e, "Broadcast channel error");
                            }
                            None => {
                                tracing::warn!("Broadcast subscription ended");
                                break;
                            }
                        },
                    }
                },
                Err(e) => tracing::warn!(error = %e, "Broadcast subscribe failed"),
            }

            tokio::select! {
                () = cancel.cancelled() => {}
                () = tokio::time::sleep(RESUBSCRIBE_DELAY) => {}
            }
        }

        tracing::info!(worker_id = %self.worker_id, "Follower relay stopped");
    }

    fn relay(&self, payload: &str) {
        let frame = match decode_frame(payload) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(error = %e, "Dropping malformed frame");
                return;
            }
        };

        if frame.origin == self.worker_id.as_str() {
            return;
        }

        tracing::trace!(
            origin = %frame.origin,
            sequence = frame.sequence,
            part = frame.part,
            parts = frame.parts,
            "Relaying frame"
        );
        let _ = self.hub.send_frame(frame);
        metrics::record_frame_relayed();
    }
}
