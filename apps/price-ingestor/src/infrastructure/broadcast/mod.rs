//! Batch Broadcast
//!
//! Persisted batches fan out to in-process consumers through a
//! [`BroadcastHub`] and to other workers through the shared broadcast
//! channel. The leader publishes; followers relay.

mod frame;
mod hub;
mod publisher;
mod relay;

pub use frame::{BatchFrame, EncodedFrame, decode_frame, split_batch};
pub use hub::{BroadcastHub, BroadcastStats, SharedBroadcastHub};
pub use publisher::BroadcastPublisher;
pub use relay::FollowerRelay;
