//! Update Aggregator
//!
//! Collapses the tick stream into one pending update per entity and
//! flushes the map on a fixed timer as a single batched upsert.
//!
//! # Invariants
//!
//! - The pending map holds at most `max_pending` entries. A tick for a new
//!   entity at capacity forces an out-of-band flush first (waiting for an
//!   in-flight flush if necessary), so nothing is dropped and nothing grows
//!   unbounded.
//! - Flushes never overlap. A timer flush that finds one in flight is
//!   skipped; the entries it would have taken stay pending.
//! - A batch whose persistence fails is dropped; the next flush supersedes
//!   it.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;

use crate::application::ports::{BatchPublisherPort, Clock, PriceSinkPort, SinkError};
use crate::domain::instrument::{EntityId, InstrumentRegistry};
use crate::domain::pricing::{PendingUpdate, PriceBatch, Tick};
use crate::infrastructure::metrics::{self, FlushLabel};

/// Flush timing and capacity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregatorConfig {
    /// Flush cadence.
    pub flush_interval: Duration,
    /// Delay before the first flush, to stagger co-located aggregators.
    pub start_offset: Duration,
    /// Hard cap on pending entities.
    pub max_pending: usize,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            flush_interval: Duration::from_secs(1),
            start_offset: Duration::from_millis(250),
            max_pending: 10_000,
        }
    }
}

/// What `enqueue` did with a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// New pending entry.
    Inserted,
    /// Existing entry overwritten.
    Merged,
    /// Ticker not in the registry; dropped.
    Unmapped,
}

/// What a flush did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Nothing pending.
    Empty,
    /// Another flush was in flight.
    Skipped,
    /// Batch persisted and handed to the publisher.
    Persisted {
        /// Batch sequence.
        sequence: u64,
        /// Entities in the batch.
        entities: usize,
        /// Frames emitted by the publisher.
        frames: usize,
    },
    /// Persistence failed; the batch was dropped.
    Failed {
        /// Batch sequence.
        sequence: u64,
        /// Entities dropped.
        entities: usize,
        /// Sink error.
        error: SinkError,
    },
}

/// Aggregator counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AggregatorStats {
    /// Entities currently pending.
    pub pending: usize,
    /// Batches persisted.
    pub flushed_batches: u64,
    /// Batches dropped after a persistence failure.
    pub failed_flushes: u64,
    /// Flushes forced by the capacity cap.
    pub forced_flushes: u64,
    /// Ticks dropped for unknown tickers.
    pub dropped_unknown: u64,
    /// When the last batch was persisted.
    pub last_flush_at: Option<DateTime<Utc>>,
}

/// Per-entity dedup buffer with timed batch flushes.
pub struct UpdateAggregator {
    config: AggregatorConfig,
    registry: Arc<InstrumentRegistry>,
    sink: Arc<dyn PriceSinkPort>,
    publisher: Arc<dyn BatchPublisherPort>,
    clock: Arc<dyn Clock>,
    pending: Mutex<HashMap<EntityId, PendingUpdate>>,
    flush_gate: AsyncMutex<()>,
    sequence: AtomicU64,
    flushed_batches: AtomicU64,
    failed_flushes: AtomicU64,
    forced_flushes: AtomicU64,
    dropped_unknown: AtomicU64,
    last_flush_at: Mutex<Option<DateTime<Utc>>>,
}

impl UpdateAggregator {
    /// Create an aggregator.
    #[must_use]
    pub fn new(
        config: AggregatorConfig,
        registry: Arc<InstrumentRegistry>,
        sink: Arc<dyn PriceSinkPort>,
        publisher: Arc<dyn BatchPublisherPort>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            registry,
            sink,
            publisher,
            clock,
            pending: Mutex::new(HashMap::new()),
            flush_gate: AsyncMutex::new(()),
            sequence: AtomicU64::new(0),
            flushed_batches: AtomicU64::new(0),
            failed_flushes: AtomicU64::new(0),
            forced_flushes: AtomicU64::new(0),
            dropped_unknown: AtomicU64::new(0),
            last_flush_at: Mutex::new(None),
        }
    }

    /// Resolve a tick's entity and overwrite its pending entry.
    pub async fn enqueue(&self, tick: Tick) -> EnqueueOutcome {
        let Some(instrument) = self.registry.instrument(&tick.ticker_id) else {
            self.dropped_unknown.fetch_add(1, Ordering::Relaxed);
            metrics::record_tick_unmapped();
            tracing::trace!(ticker = %tick.ticker_id, "Dropping tick for unmapped ticker");
            return EnqueueOutcome::Unmapped;
        };

        loop {
            {
                let mut pending = self.pending.lock();
                if let Some(entry) = pending.get_mut(&instrument.entity_id) {
                    entry.apply(&instrument, &tick);
                    return EnqueueOutcome::Merged;
                }
                if pending.len() < self.config.max_pending {
                    pending.insert(
                        instrument.entity_id.clone(),
                        PendingUpdate::derive(&instrument, &tick),
                    );
                    return EnqueueOutcome::Inserted;
                }
            }

            self.forced_flushes.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                max_pending = self.config.max_pending,
                "Pending map at capacity, forcing flush"
            );
            let _gate = self.flush_gate.lock().await;
            self.flush_locked().await;
        }
    }

    /// Flush unless another flush is in flight.
    pub async fn flush(&self) -> FlushOutcome {
        let Ok(_gate) = self.flush_gate.try_lock() else {
            metrics::record_flush(FlushLabel::Skipped);
            tracing::debug!("Flush already in flight, skipping");
            return FlushOutcome::Skipped;
        };
        self.flush_locked().await
    }

    /// Drop every pending entry; returns how many were discarded.
    pub fn clear(&self) -> usize {
        let mut pending = self.pending.lock();
        let count = pending.len();
        pending.clear();
        count
    }

    /// Current counters.
    #[must_use]
    pub fn stats(&self) -> AggregatorStats {
        AggregatorStats {
            pending: self.pending.lock().len(),
            flushed_batches: self.flushed_batches.load(Ordering::Relaxed),
            failed_flushes: self.failed_flushes.load(Ordering::Relaxed),
            forced_flushes: self.forced_flushes.load(Ordering::Relaxed),
            dropped_unknown: self.dropped_unknown.load(Ordering::Relaxed),
            last_flush_at: *self.last_flush_at.lock(),
        }
    }

    /// Flush on the configured timer until cancelled.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let start = tokio::time::Instant::now() + self.config.start_offset;
        let mut interval = tokio::time::interval_at(start, self.config.flush_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        tracing::info!(
            interval_ms = u64::try_from(self.config.flush_interval.as_millis()).unwrap_or(u64::MAX),
            offset_ms = u64::try_from(self.config.start_offset.as_millis()).unwrap_or(u64::MAX),
            "Flush timer started"
        );

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = interval.tick() => {
                    self.flush().await;
                }
            }
        }
        tracing::debug!("Flush timer stopped");
    }

    /// Snapshot-and-clear, persist, publish. Caller holds the flush gate.
    async fn flush_locked(&self) -> FlushOutcome {
        let snapshot = std::mem::take(&mut *self.pending.lock());
        if snapshot.is_empty() {
            return FlushOutcome::Empty;
        }

        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        let batch = PriceBatch {
            sequence,
            flushed_at: self.clock.now(),
            updates: snapshot.into_values().collect(),
        };
        let entities = batch.len();

        let started = tokio::time::Instant::now();
        if let Err(error) = self.sink.upsert_latest(&batch.updates).await {
            self.failed_flushes.fetch_add(1, Ordering::Relaxed);
            metrics::record_flush(FlushLabel::Failed);
            tracing::error!(sequence, entities, error = %error, "Persisting batch failed, dropping it");
            return FlushOutcome::Failed {
                sequence,
                entities,
                error,
            };
        }
        metrics::record_batch(entities, started.elapsed());
        metrics::record_flush(FlushLabel::Persisted);
        self.flushed_batches.fetch_add(1, Ordering::Relaxed);
        *self.last_flush_at.lock() = Some(batch.flushed_at);

        let frames = match self.publisher.publish(&batch).await {
            Ok(frames) => frames,
            Err(e) => {
                tracing::warn!(sequence, error = %e, "Publishing batch failed");
                0
            }
        };

        tracing::debug!(sequence, entities, frames, "Batch flushed");
        FlushOutcome::Persisted {
            sequence,
            entities,
            frames,
        }
    }
}
