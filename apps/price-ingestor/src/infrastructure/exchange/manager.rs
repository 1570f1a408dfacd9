//! Connection Manager
//!
//! Partitions the full ticker list into capacity-bounded shards and owns
//! their lifecycle. Any change to the ticker set rebuilds every shard with
//! an explicit two-phase protocol:
//!
//! 1. **Teardown**: cancel every shard (which also stops its keepalive and
//!    reconnect timers) and wait for each task to exit.
//! 2. **Settle**: wait the settle delay so the exchange never sees old and
//!    new connections overlap under one credential.
//! 3. **Standup**: spawn one shard per partition slice.
//!
//! Requests are debounced: calls inside the debounce window coalesce into
//! one rebuild against the latest target. Rebuilds never overlap.
//!
//! One manager serves one leadership term; after [`ConnectionManager::shutdown`]
//! it accepts no more work.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::reconnect::CloseClass;
use super::shard::{ConnectionShard, ShardConfig, ShardEvent};
use super::status::{ShardStatus, ShardStatusBoard};
use crate::application::ports::Clock;
use crate::domain::instrument::TickerId;
use crate::domain::sharding::{PartitionError, ShardId, TickerSet, partition};
use crate::infrastructure::metrics;

/// Rebuild scheduling settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagerConfig {
    /// Maximum tickers per shard.
    pub capacity: usize,
    /// Window in which requests coalesce.
    pub debounce: Duration,
    /// Pause between teardown and standup.
    pub settle: Duration,
    /// How long newly added tickers are remembered for close diagnostics.
    pub recent_window: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            capacity: 500,
            debounce: Duration::from_millis(500),
            settle: Duration::from_secs(1),
            recent_window: Duration::from_secs(30),
        }
    }
}

/// Manager errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ManagerError {
    /// Capacity is zero.
    #[error(transparent)]
    Partition(#[from] PartitionError),

    /// The manager was shut down.
    #[error("connection manager is shut down")]
    ShutDown,
}

struct RunningShard {
    shard_id: ShardId,
    tickers: Vec<TickerId>,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Shards of the current generation.
#[derive(Default)]
struct Generation {
    shards: Vec<RunningShard>,
}

/// Owns every upstream shard for one leadership term.
pub struct ConnectionManager {
    config: ManagerConfig,
    shard_config: Arc<ShardConfig>,
    clock: Arc<dyn Clock>,
    event_tx: mpsc::Sender<ShardEvent>,
    cancel: CancellationToken,
    status: Arc<ShardStatusBoard>,
    generation: AsyncMutex<Generation>,
    /// Ticker set the running shards subscribe to.
    applied: Mutex<TickerSet>,
    /// Latest requested target, applied by the next debounced rebuild.
    requested: Mutex<Option<TickerSet>>,
    /// Additions waiting for the next distribution cycle.
    pending: Mutex<TickerSet>,
    /// Ticker → shard map of the running generation.
    assignments: Mutex<Vec<(ShardId, Vec<TickerId>)>>,
    recent: Mutex<VecDeque<(Instant, TickerId)>>,
    debounce_seq: AtomicU64,
    rebuilds: AtomicU64,
}

impl ConnectionManager {
    /// Create a manager.
    ///
    /// # Errors
    ///
    /// Returns [`ManagerError::Partition`] when the capacity is zero.
    pub fn new(
        config: ManagerConfig,
        shard_config: Arc<ShardConfig>,
        clock: Arc<dyn Clock>,
        event_tx: mpsc::Sender<ShardEvent>,
        cancel: CancellationToken,
    ) -> Result<Arc<Self>, ManagerError> {
        if config.capacity == 0 {
            return Err(PartitionError::ZeroCapacity.into());
        }
        Ok(Arc::new(Self {
            config,
            shard_config,
            clock,
            event_tx,
            cancel,
            status: Arc::new(ShardStatusBoard::new()),
            generation: AsyncMutex::new(Generation::default()),
            applied: Mutex::new(TickerSet::new()),
            requested: Mutex::new(None),
            pending: Mutex::new(TickerSet::new()),
            assignments: Mutex::new(Vec::new()),
            recent: Mutex::new(VecDeque::new()),
            debounce_seq: AtomicU64::new(0),
            rebuilds: AtomicU64::new(0),
        }))
    }

    // =========================================================================
    // Operations
    // =========================================================================

    /// Distribute the full ticker list across shards (debounced rebuild).
    ///
    /// Returns `false` without touching the shards when the list matches
    /// the current target, ignoring order, and no additions are pending.
    ///
    /// # Errors
    ///
    /// Returns [`ManagerError::ShutDown`] after shutdown.
    pub fn distribute(self: &Arc<Self>, tickers: Vec<TickerId>) -> Result<bool, ManagerError> {
        self.ensure_running()?;
        let target: TickerSet = tickers.into_iter().collect();
        if self.is_current_target(&target) {
            tracing::debug!(tickers = target.len(), "Distribution unchanged, keeping shards");
            return Ok(false);
        }
        self.schedule(target);
        Ok(true)
    }

    /// Merge tickers into the pending set without reconnecting.
    ///
    /// They are subscribed by the next `distribute` or `replace_tickers`
    /// cycle.
    pub fn add_tickers(&self, tickers: impl IntoIterator<Item = TickerId>) {
        let mut pending = self.pending.lock();
        let before = pending.len();
        pending.extend(tickers);
        tracing::debug!(added = pending.len() - before, pending = pending.len(), "Queued tickers");
    }

    /// Replace the authoritative ticker set.
    ///
    /// Returns `false` (and does nothing) when the set equals the current
    /// target, ignoring order, and no additions are pending.
    ///
    /// # Errors
    ///
    /// Returns [`ManagerError::ShutDown`] after shutdown.
    pub fn replace_tickers(self: &Arc<Self>, tickers: Vec<TickerId>) -> Result<bool, ManagerError> {
        self.ensure_running()?;
        let target: TickerSet = tickers.into_iter().collect();
        if self.is_current_target(&target) {
            tracing::debug!(tickers = target.len(), "Ticker set unchanged, keeping shards");
            return Ok(false);
        }

        self.schedule(target);
        Ok(true)
    }

    /// Cancel any pending rebuild and tear every shard down.
    ///
    /// Returns once every shard task has exited.
    pub async fn shutdown(&self) {
        self.debounce_seq.fetch_add(1, Ordering::SeqCst);
        self.cancel.cancel();

        let mut generation = self.generation.lock().await;
        let stopped = Self::teardown(&mut generation).await;
        self.status.clear();
        self.assignments.lock().clear();
        tracing::info!(shards = stopped, "Connection manager shut down");
    }

    /// Correlate a shard close with recently added tickers.
    pub fn on_shard_closed(&self, shard_id: ShardId, uptime: Duration, class: CloseClass) {
        let recent = self.recent_on_shard(shard_id);
        if recent.is_empty() {
            tracing::debug!(shard = %shard_id, class = class.as_str(), "Shard close recorded");
        } else {
            tracing::warn!(
                shard = %shard_id,
                class = class.as_str(),
                uptime_ms = u64::try_from(uptime.as_millis()).unwrap_or(u64::MAX),
                recent_tickers = ?recent,
                "Shard closed shortly after new tickers were subscribed"
            );
        }
    }

    // =========================================================================
    // Introspection
    // =========================================================================

    /// Per-shard status.
    #[must_use]
    pub fn status(&self) -> Vec<ShardStatus> {
        self.status.snapshot()
    }

    /// Shared status board.
    #[must_use]
    pub fn status_board(&self) -> Arc<ShardStatusBoard> {
        Arc::clone(&self.status)
    }

    /// Tickers the running shards subscribe to.
    #[must_use]
    pub fn applied_tickers(&self) -> TickerSet {
        self.applied.lock().clone()
    }

    /// Tickers waiting for the next cycle.
    #[must_use]
    pub fn pending_tickers(&self) -> TickerSet {
        self.pending.lock().clone()
    }

    /// Completed rebuilds.
    #[must_use]
    pub fn rebuild_count(&self) -> u64 {
        self.rebuilds.load(Ordering::SeqCst)
    }

    // =========================================================================
    // Rebuild
    // =========================================================================

    fn ensure_running(&self) -> Result<(), ManagerError> {
        if self.cancel.is_cancelled() {
            Err(ManagerError::ShutDown)
        } else {
            Ok(())
        }
    }

    /// Whether `target` equals the requested (or else applied) set with
    /// nothing pending.
    fn is_current_target(&self, target: &TickerSet) -> bool {
        let current = self
            .requested
            .lock()
            .clone()
            .unwrap_or_else(|| self.applied.lock().clone());
        current == *target && self.pending.lock().is_empty()
    }

    fn schedule(self: &Arc<Self>, target: TickerSet) {
        *self.requested.lock() = Some(target);
        let seq = self.debounce_seq.fetch_add(1, Ordering::SeqCst) + 1;

        let manager = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                () = manager.cancel.cancelled() => return,
                () = tokio::time::sleep(manager.config.debounce) => {}
            }
            if manager.debounce_seq.load(Ordering::SeqCst) != seq {
                return;
            }
            manager.rebuild().await;
        });
    }

    async fn rebuild(&self) {
        let mut generation = self.generation.lock().await;
        if self.cancel.is_cancelled() {
            return;
        }

        let Some(mut target) = self.requested.lock().take() else {
            return;
        };
        target.extend(std::mem::take(&mut *self.pending.lock()).iter().cloned());

        let previous = self.applied.lock().clone();
        let torn_down = Self::teardown(&mut generation).await;
        self.status.clear();

        if torn_down > 0 && !target.is_empty() {
            tokio::select! {
                () = self.cancel.cancelled() => return,
                () = tokio::time::sleep(self.config.settle) => {}
            }
        }

        let tickers = target.to_vec();
        let assignments = match partition(&tickers, self.config.capacity) {
            Ok(assignments) => assignments,
            Err(e) => {
                tracing::error!(error = %e, "Cannot partition tickers");
                return;
            }
        };

        for assignment in &assignments {
            let cancel = self.cancel.child_token();
            let shard = ConnectionShard::new(
                assignment.shard_id,
                assignment.tickers.clone(),
                Arc::clone(&self.shard_config),
                Arc::clone(&self.clock),
                self.event_tx.clone(),
                Arc::clone(&self.status),
                cancel.clone(),
            );
            generation.shards.push(RunningShard {
                shard_id: assignment.shard_id,
                tickers: assignment.tickers.clone(),
                cancel,
                handle: tokio::spawn(shard.run()),
            });
        }

        self.remember_added(target.difference(&previous));
        *self.assignments.lock() = generation
            .shards
            .iter()
            .map(|s| (s.shard_id, s.tickers.clone()))
            .collect();
        *self.applied.lock() = target;
        self.rebuilds.fetch_add(1, Ordering::SeqCst);
        metrics::record_rebuild();

        tracing::info!(
            shards = generation.shards.len(),
            tickers = tickers.len(),
            torn_down,
            "Shards rebuilt"
        );
    }

    /// Cancel and await every shard; returns how many were stopped.
    async fn teardown(generation: &mut Generation) -> usize {
        let shards = std::mem::take(&mut generation.shards);
        let count = shards.len();
        for shard in &shards {
            shard.cancel.cancel();
        }
        for shard in shards {
            if let Err(e) = shard.handle.await {
                tracing::error!(shard = %shard.shard_id, error = %e, "Shard task failed");
            }
        }
        count
    }

    fn remember_added(&self, added: Vec<TickerId>) {
        let now = Instant::now();
        let mut recent = self.recent.lock();
        Self::prune(&mut recent, now, self.config.recent_window);
        recent.extend(added.into_iter().map(|t| (now, t)));
    }

    fn recent_on_shard(&self, shard_id: ShardId) -> Vec<TickerId> {
        let mut recent = self.recent.lock();
        Self::prune(&mut recent, Instant::now(), self.config.recent_window);
        if recent.is_empty() {
            return Vec::new();
        }

        let assignments = self.assignments.lock();
        let Some((_, tickers)) = assignments.iter().find(|(id, _)| *id == shard_id) else {
            return Vec::new();
        };
        recent
            .iter()
            .filter(|(_, t)| tickers.contains(t))
            .map(|(_, t)| t.clone())
            .collect()
    }

    fn prune(recent: &mut VecDeque<(Instant, TickerId)>, now: Instant, window: Duration) {
        while recent
            .front()
            .is_some_and(|(at, _)| now.duration_since(*at) > window)
        {
            recent.pop_front();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::ports::SystemClock;

    fn tickers(names: &[&str]) -> Vec<TickerId> {
        names.iter().map(|n| TickerId::from(*n)).collect()
    }

    fn manager(capacity: usize) -> (Arc<ConnectionManager>, mpsc::Receiver<ShardEvent>) {
        let (tx, rx) = mpsc::channel(64);
        let mut shard_config = ShardConfig::new("ws://127.0.0.1:9");
        shard_config.resilience.jitter_factor = 0.0;
        shard_config.resilience.base_delay = Duration::from_secs(60);
        let manager = ConnectionManager::new(
            ManagerConfig {
                capacity,
                ..ManagerConfig::default()
            },
            Arc::new(shard_config),
            Arc::new(SystemClock),
            tx,
            CancellationToken::new(),
        )
        .unwrap();
        (manager, rx)
    }

    #[test]
    fn zero_capacity_is_rejected() {
        let (tx, _rx) = mpsc::channel(1);
        let result = ConnectionManager::new(
            ManagerConfig {
                capacity: 0,
                ..ManagerConfig::default()
            },
            Arc::new(ShardConfig::new("ws://localhost")),
            Arc::new(SystemClock),
            tx,
            CancellationToken::new(),
        );
        assert!(matches!(
            result,
            Err(ManagerError::Partition(PartitionError::ZeroCapacity))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn calls_inside_debounce_window_coalesce() {
        let (manager, _rx) = manager(2);
        manager.distribute(tickers(&["a"])).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        manager.distribute(tickers(&["a", "b", "c"])).unwrap();

        tokio::time::sleep(Duration::from_secs(2)).await;

        assert_eq!(manager.rebuild_count(), 1);
        assert_eq!(manager.applied_tickers().len(), 3);
        assert_eq!(manager.status().len(), 2);
        manager.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn replace_with_same_set_in_any_order_is_noop() {
        let (manager, _rx) = manager(10);
        manager.distribute(tickers(&["a", "b", "c"])).unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(manager.rebuild_count(), 1);

        assert!(!manager.replace_tickers(tickers(&["c", "a", "b"])).unwrap());
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(manager.rebuild_count(), 1);

        assert!(manager.replace_tickers(tickers(&["a", "b"])).unwrap());
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(manager.rebuild_count(), 2);
        assert_eq!(manager.applied_tickers().len(), 2);
        manager.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn distribute_with_same_list_keeps_shards() {
        let (manager, _rx) = manager(10);
        assert!(manager.distribute(tickers(&["a", "b"])).unwrap());
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(manager.rebuild_count(), 1);

        assert!(!manager.distribute(tickers(&["b", "a"])).unwrap());
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(manager.rebuild_count(), 1);

        manager.add_tickers(tickers(&["c"]));
        assert!(manager.distribute(tickers(&["a", "b"])).unwrap());
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(manager.rebuild_count(), 2);
        assert_eq!(manager.applied_tickers().len(), 3);
        manager.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn pending_additions_join_next_cycle() {
        let (manager, _rx) = manager(10);
        manager.distribute(tickers(&["a"])).unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;

        manager.add_tickers(tickers(&["z"]));
        assert!(!manager.applied_tickers().contains(&TickerId::from("z")));
        assert_eq!(manager.rebuild_count(), 1);

        assert!(manager.replace_tickers(tickers(&["a"])).unwrap());
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert!(manager.applied_tickers().contains(&TickerId::from("z")));
        assert!(manager.pending_tickers().is_empty());
        manager.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_cancels_pending_rebuild_and_rejects_work() {
        let (manager, _rx) = manager(10);
        manager.distribute(tickers(&["a"])).unwrap();
        manager.shutdown().await;
        tokio::time::sleep(Duration::from_secs(2)).await;

        assert_eq!(manager.rebuild_count(), 0);
        assert!(manager.status().is_empty());
        assert_eq!(
            manager.distribute(tickers(&["a"])),
            Err(ManagerError::ShutDown)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn every_shard_respects_capacity() {
        let (manager, _rx) = manager(500);
        let list: Vec<TickerId> = (0..1_200).map(|i| TickerId::new(format!("t{i:04}"))).collect();
        manager.distribute(list).unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;

        let sizes: Vec<_> = manager.status().iter().map(|s| s.ticker_count).collect();
        assert_eq!(sizes, vec![500, 500, 200]);
        manager.shutdown().await;
    }
}
