//! Broadcast Channel Port (Driven Port)
//!
//! Cross-worker pub/sub topic carrying serialized batch frames. Every
//! subscriber receives every payload published after it subscribed.

use async_trait::async_trait;
use futures::stream::BoxStream;

/// Stream of raw payloads received from the channel.
pub type FrameStream = BoxStream<'static, Result<String, BroadcastError>>;

/// Broadcast channel error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BroadcastError {
    /// Channel backend unreachable.
    #[error("broadcast connection error: {message}")]
    ConnectionError {
        /// Error detail.
        message: String,
    },

    /// Payload could not be encoded or decoded.
    #[error("broadcast serialization error: {message}")]
    SerializationError {
        /// Error detail.
        message: String,
    },

    /// Publishing failed.
    #[error("broadcast publish failed: {message}")]
    PublishFailed {
        /// Error detail.
        message: String,
    },

    /// A single update does not fit the channel's payload limit.
    #[error("payload of {size} bytes exceeds channel limit of {limit} bytes")]
    PayloadTooLarge {
        /// Encoded size.
        size: usize,
        /// Channel limit.
        limit: usize,
    },
}

/// Port for the shared broadcast topic.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BroadcastChannelPort: Send + Sync {
    /// Publish one payload to every subscriber.
    async fn publish(&self, payload: String) -> Result<(), BroadcastError>;

    /// Subscribe to payloads published from now on.
    async fn subscribe(&self) -> Result<FrameStream, BroadcastError>;

    /// Largest payload the channel accepts, in bytes.
    fn max_payload_bytes(&self) -> usize;
}
