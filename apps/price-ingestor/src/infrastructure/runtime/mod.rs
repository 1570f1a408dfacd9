//! Ingestion Runtime
//!
//! The [`LeadershipHandler`] that turns a role into running tasks.
//!
//! - **Leader**: a fresh [`ConnectionManager`] subscribed to every
//!   registered ticker, a dispatch loop feeding ticks to the aggregator,
//!   the flush timer, and a watcher that reshards when the registry
//!   changes. Everything hangs off the leadership term token.
//! - **Follower**: the [`FollowerRelay`] only. Followers never connect
//!   upstream and never persist.
//!
//! `step_down` tears down whichever role is running and returns only once
//! every upstream connection is closed.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::application::ports::{BroadcastChannelPort, Clock};
use crate::application::services::{LeadershipHandler, RefreshReport, UpdateAggregator};
use crate::domain::instrument::InstrumentRegistry;
use crate::domain::leadership::WorkerId;
use crate::infrastructure::broadcast::{BroadcastHub, FollowerRelay};
use crate::infrastructure::exchange::{
    ConnectionManager, ManagerConfig, ShardConfig, ShardEvent, ShardStatus,
};

/// Settings for the leader's upstream side.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Resharding and debounce.
    pub manager: ManagerConfig,
    /// Per-shard connection settings.
    pub shard: Arc<ShardConfig>,
    /// Bound on shard events waiting for dispatch.
    pub event_buffer: usize,
}

/// Collaborators shared by both roles.
pub struct RuntimeDeps {
    /// This worker.
    pub worker_id: WorkerId,
    /// Ticker → entity map.
    pub registry: Arc<InstrumentRegistry>,
    /// Dedup buffer and flusher.
    pub aggregator: Arc<UpdateAggregator>,
    /// Local fan-out.
    pub hub: Arc<BroadcastHub>,
    /// Shared broadcast topic.
    pub channel: Arc<dyn BroadcastChannelPort>,
    /// Wall clock for shards.
    pub clock: Arc<dyn Clock>,
    /// Registry refresh notifications.
    pub refreshes: watch::Receiver<RefreshReport>,
}

struct LeaderTerm {
    manager: Arc<ConnectionManager>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

struct FollowerTerm {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Runs the leader or follower side of one worker.
pub struct IngestionRuntime {
    config: RuntimeConfig,
    deps: RuntimeDeps,
    shutdown: CancellationToken,
    leader: Mutex<Option<LeaderTerm>>,
    follower: Mutex<Option<FollowerTerm>>,
}

impl IngestionRuntime {
    /// Create a runtime; follower tasks are children of `shutdown`.
    #[must_use]
    pub fn new(config: RuntimeConfig, deps: RuntimeDeps, shutdown: CancellationToken) -> Self {
        Self {
            config,
            deps,
            shutdown,
            leader: Mutex::new(None),
            follower: Mutex::new(None),
        }
    }

    /// Status of the leader's shards; empty unless leading.
    #[must_use]
    pub fn shard_status(&self) -> Vec<ShardStatus> {
        self.leader
            .lock()
            .as_ref()
            .map(|term| term.manager.status())
            .unwrap_or_default()
    }

    /// Whether the leader's connection manager is running.
    #[must_use]
    pub fn is_leading(&self) -> bool {
        self.leader.lock().is_some()
    }

    /// Whether the follower relay is running.
    #[must_use]
    pub fn is_following(&self) -> bool {
        self.follower.lock().is_some()
    }

    async fn dispatch(
        manager: Arc<ConnectionManager>,
        aggregator: Arc<UpdateAggregator>,
        mut events: mpsc::Receiver<ShardEvent>,
        cancel: CancellationToken,
    ) {
        loop {
            let event = tokio::select! {
                () = cancel.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };

            match event {
                ShardEvent::Tick { tick, .. } => {
                    aggregator.enqueue(tick).await;
                }
                ShardEvent::Closed {
                    shard_id,
                    uptime,
                    class,
                    ..
                } => manager.on_shard_closed(shard_id, uptime, class),
                ShardEvent::Connected { shard_id } => {
                    tracing::debug!(shard_id = shard_id.0, "Shard subscribed");
                }
            }
        }
    }

    async fn watch_registry(
        manager: Arc<ConnectionManager>,
        registry: Arc<InstrumentRegistry>,
        mut refreshes: watch::Receiver<RefreshReport>,
        cancel: CancellationToken,
    ) {
        // A refresh may land between the initial distribution and this
        // point, so reconcile against the registry before waiting.
        let mut report = refreshes.borrow_and_update().clone();
        loop {
            match manager.replace_tickers(registry.all_tickers()) {
                Ok(true) => tracing::info!(
                    version = report.version,
                    added = report.added,
                    removed = report.removed,
                    "Registry changed, resharding"
                ),
                Ok(false) => {}
                Err(e) => {
                    tracing::debug!(error = %e, "Manager stopped, registry watcher exiting");
                    break;
                }
            }

            tokio::select! {
                () = cancel.cancelled() => break,
                changed = refreshes.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
            report = refreshes.borrow_and_update().clone();
        }
    }

    async fn stop_leader(&self) {
        let Some(term) = self.leader.lock().take() else {
            return;
        };
        term.cancel.cancel();
        term.manager.shutdown().await;
        for task in term.tasks {
            let _ = task.await;
        }
        let dropped = self.deps.aggregator.clear();
        tracing::info!(dropped, "Leader tasks stopped");
    }

    async fn stop_follower(&self) {
        let Some(term) = self.follower.lock().take() else {
            return;
        };
        term.cancel.cancel();
        let _ = term.handle.await;
    }
}

#[async_trait]
impl LeadershipHandler for IngestionRuntime {
    async fn become_leader(&self, term: CancellationToken) {
        self.stop_follower().await;

        let (event_tx, event_rx) = mpsc::channel(self.config.event_buffer.max(1));
        let manager = match ConnectionManager::new(
            self.config.manager.clone(),
            Arc::clone(&self.config.shard),
            Arc::clone(&self.deps.clock),
            event_tx,
            term.child_token(),
        ) {
            Ok(manager) => manager,
            Err(e) => {
                tracing::error!(error = %e, "Cannot start connection manager");
                return;
            }
        };

        let tickers = self.deps.registry.all_tickers();
        let ticker_count = tickers.len();
        if let Err(e) = manager.distribute(tickers) {
            tracing::error!(error = %e, "Initial distribution failed");
        }

        let cancel = term.child_token();
        let tasks = vec![
            tokio::spawn(Self::dispatch(
                Arc::clone(&manager),
                Arc::clone(&self.deps.aggregator),
                event_rx,
                cancel.clone(),
            )),
            tokio::spawn(Arc::clone(&self.deps.aggregator).run(cancel.clone())),
            tokio::spawn(Self::watch_registry(
                Arc::clone(&manager),
                Arc::clone(&self.deps.registry),
                self.deps.refreshes.clone(),
                cancel.clone(),
            )),
        ];

        tracing::info!(
            worker_id = %self.deps.worker_id,
            tickers = ticker_count,
            "Leading: connecting upstream"
        );

        *self.leader.lock() = Some(LeaderTerm {
            manager,
            cancel,
            tasks,
        });
    }

    async fn become_follower(&self, leader: Option<String>) {
        if self.is_following() {
            return;
        }
        tracing::info!(worker_id = %self.deps.worker_id, leader = ?leader, "Following: relaying frames");

        let cancel = self.shutdown.child_token();
        let relay = FollowerRelay::new(
            self.deps.worker_id.clone(),
            Arc::clone(&self.deps.hub),
            Arc::clone(&self.deps.channel),
        );
        let handle = tokio::spawn(relay.run(cancel.clone()));
        *self.follower.lock() = Some(FollowerTerm { cancel, handle });
    }

    async fn step_down(&self) {
        self.stop_leader().await;
        self.stop_follower().await;
    }
}
