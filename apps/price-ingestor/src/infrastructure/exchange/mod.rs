//! Exchange WebSocket Adapters
//!
//! Sharded upstream connections to the exchange price feed:
//!
//! - **Manager**: partitions tickers into shards and rebuilds them on change
//! - **Shard**: one socket, its keepalive timer and reconnect loop
//! - **Codec**: JSON frames into ticks

pub mod codec;
pub mod keepalive;
pub mod manager;
pub mod messages;
pub mod reconnect;
pub mod shard;
pub mod state;
pub mod status;

pub use codec::{CodecError, TickCodec};
pub use keepalive::{KeepaliveConfig, KeepaliveEvent, KeepaliveFrame, KeepaliveManager};
pub use manager::{ConnectionManager, ManagerConfig, ManagerError};
pub use messages::SubscriptionFormat;
pub use reconnect::{CloseClass, ReconnectDecision, ReconnectPolicy, ResilienceConfig};
pub use shard::{ConnectionShard, ShardConfig, ShardError, ShardEvent};
pub use state::{ShardState, ShardStateMachine, TransitionError};
pub use status::{ShardStatus, ShardStatusBoard};
