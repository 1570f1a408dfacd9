//! Shard status board for health reporting.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;

use super::state::ShardState;
use crate::domain::sharding::ShardId;

/// Snapshot of one shard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ShardStatus {
    /// Shard index within the current generation.
    pub shard_id: usize,
    /// Tickers subscribed on this shard.
    pub ticker_count: usize,
    /// Lifecycle state.
    pub state: ShardState,
    /// When the current connection completed its handshake.
    pub connected_since: Option<DateTime<Utc>>,
    /// Reconnects since the shard was created.
    pub reconnects: u32,
    /// Consecutive rapid closes.
    pub rapid_failures: u32,
}

/// Live status of every shard of the current generation.
#[derive(Debug, Default)]
pub struct ShardStatusBoard {
    shards: RwLock<BTreeMap<ShardId, ShardStatus>>,
}

impl ShardStatusBoard {
    /// Create an empty board.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a freshly created shard.
    pub fn register(&self, shard_id: ShardId, ticker_count: usize) {
        self.shards.write().insert(
            shard_id,
            ShardStatus {
                shard_id: shard_id.0,
                ticker_count,
                state: ShardState::Connecting,
                connected_since: None,
                reconnects: 0,
                rapid_failures: 0,
            },
        );
    }

    /// Apply `f` to a shard's status, if registered.
    pub fn update(&self, shard_id: ShardId, f: impl FnOnce(&mut ShardStatus)) {
        if let Some(status) = self.shards.write().get_mut(&shard_id) {
            f(status);
        }
    }

    /// Forget every shard.
    pub fn clear(&self) {
        self.shards.write().clear();
    }

    /// All shards, ordered by id.
    #[must_use]
    pub fn snapshot(&self) -> Vec<ShardStatus> {
        self.shards.read().values().cloned().collect()
    }

    /// Number of shards in `Connected`.
    #[must_use]
    pub fn connected_count(&self) -> usize {
        self.shards
            .read()
            .values()
            .filter(|s| s.state == ShardState::Connected)
            .count()
    }

    /// Number of registered shards.
    #[must_use]
    pub fn len(&self) -> usize {
        self.shards.read().len()
    }

    /// Whether no shard is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.shards.read().is_empty()
    }
}
