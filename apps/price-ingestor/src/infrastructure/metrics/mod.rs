//! Prometheus Metrics Module
//!
//! Exposes ingestion metrics in Prometheus format.
//!
//! # Metrics Categories
//!
//! - **Feed**: ticks received, unmapped ticks, parse errors, keepalives
//! - **Shards**: connected shards, reconnects by class, cooldowns, rebuilds
//! - **Flushes**: outcomes, batch sizes, persistence latency
//! - **Leadership**: leader gauge, lease renewal failures
//! - **Broadcast**: frames published and relayed
//!
//! # Integration
//!
//! Metrics are exposed at `/metrics` on the health server port. Recording
//! before [`init_metrics`] is a no-op.

use std::sync::OnceLock;
use std::time::Duration;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

// =============================================================================
// Global Metrics Handle
// =============================================================================

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Initialize the Prometheus metrics recorder.
///
/// # Panics
///
/// Panics if the recorder cannot be installed.
#[allow(clippy::expect_used)]
pub fn init_metrics() -> PrometheusHandle {
    PROMETHEUS_HANDLE
        .get_or_init(|| {
            let handle = PrometheusBuilder::new()
                .install_recorder()
                .expect("failed to install Prometheus recorder");

            register_metrics();
            handle
        })
        .clone()
}

/// Get the Prometheus handle for rendering metrics.
///
/// Returns `None` if metrics have not been initialized.
#[must_use]
pub fn get_metrics_handle() -> Option<PrometheusHandle> {
    PROMETHEUS_HANDLE.get().cloned()
}

// =============================================================================
// Metric Registration
// =============================================================================

fn register_metrics() {
    describe_counter!(
        "price_ingestor_ticks_received_total",
        "Ticks decoded from the exchange feed"
    );
    describe_counter!(
        "price_ingestor_ticks_unmapped_total",
        "Ticks dropped because the ticker is not in the registry"
    );
    describe_counter!(
        "price_ingestor_parse_errors_total",
        "Inbound frames that could not be decoded"
    );
    describe_counter!(
        "price_ingestor_keepalives_sent_total",
        "Keepalive payloads sent upstream"
    );

    describe_gauge!(
        "price_ingestor_shards_connected",
        "Upstream shard connections currently subscribed"
    );
    describe_counter!(
        "price_ingestor_reconnects_total",
        "Shard reconnects by close class"
    );
    describe_counter!(
        "price_ingestor_cooldowns_total",
        "Times a shard hit the rapid failure limit"
    );
    describe_counter!(
        "price_ingestor_rebuilds_total",
        "Shard set teardown and standup cycles"
    );

    describe_counter!("price_ingestor_flushes_total", "Flushes by outcome");
    describe_histogram!(
        "price_ingestor_batch_entities",
        "Entities per persisted batch"
    );
    describe_histogram!(
        "price_ingestor_flush_seconds",
        "Time spent persisting one batch"
    );

    describe_gauge!(
        "price_ingestor_leader",
        "1 while this worker holds the leadership lease"
    );
    describe_counter!(
        "price_ingestor_lease_renewal_failures_total",
        "Failed or timed out lease renewals"
    );

    describe_counter!(
        "price_ingestor_frames_published_total",
        "Batch frames emitted on the broadcast channel"
    );
    describe_counter!(
        "price_ingestor_frames_relayed_total",
        "Batch frames relayed from the broadcast channel to local consumers"
    );
}

// =============================================================================
// Metric Recording Functions
// =============================================================================

/// Flush outcome label.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushLabel {
    /// Batch persisted.
    Persisted,
    /// Persistence failed; batch dropped.
    Failed,
    /// Another flush was in flight.
    Skipped,
}

impl FlushLabel {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Persisted => "persisted",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }
}

/// Record ticks decoded from one frame.
pub fn record_ticks_received(count: u64) {
    counter!("price_ingestor_ticks_received_total").increment(count);
}

/// Record a tick whose ticker is unknown.
pub fn record_tick_unmapped() {
    counter!("price_ingestor_ticks_unmapped_total").increment(1);
}

/// Record an undecodable inbound frame.
pub fn record_parse_error() {
    counter!("price_ingestor_parse_errors_total").increment(1);
}

/// Record a keepalive sent upstream.
pub fn record_keepalive_sent() {
    counter!("price_ingestor_keepalives_sent_total").increment(1);
}

/// A shard finished its subscription handshake.
pub fn shard_connected() {
    gauge!("price_ingestor_shards_connected").increment(1.0);
}

/// A previously connected shard lost its connection.
pub fn shard_disconnected() {
    gauge!("price_ingestor_shards_connected").decrement(1.0);
}

/// Record a shard reconnect by close class.
pub fn record_reconnect(class: &'static str) {
    counter!("price_ingestor_reconnects_total", "class" => class).increment(1);
}

/// Record a shard entering cooldown.
pub fn record_cooldown() {
    counter!("price_ingestor_cooldowns_total").increment(1);
}

/// Record a shard set rebuild.
pub fn record_rebuild() {
    counter!("price_ingestor_rebuilds_total").increment(1);
}

/// Record one flush.
pub fn record_flush(outcome: FlushLabel) {
    counter!("price_ingestor_flushes_total", "outcome" => outcome.as_str()).increment(1);
}

/// Record a persisted batch's size and persistence latency.
pub fn record_batch(entities: usize, elapsed: Duration) {
    #[allow(clippy::cast_precision_loss)]
    histogram!("price_ingestor_batch_entities").record(entities as f64);
    histogram!("price_ingestor_flush_seconds").record(elapsed.as_secs_f64());
}

/// Update the leader gauge.
pub fn set_leader(is_leader: bool) {
    gauge!("price_ingestor_leader").set(if is_leader { 1.0 } else { 0.0 });
}

/// Record a failed lease renewal.
pub fn record_lease_renewal_failure() {
    counter!("price_ingestor_lease_renewal_failures_total").increment(1);
}

/// Record frames emitted on the broadcast channel.
pub fn record_frames_published(count: u64) {
    counter!("price_ingestor_frames_published_total").increment(count);
}

/// Record a frame relayed to local consumers.
pub fn record_frame_relayed() {
    counter!("price_ingestor_frames_relayed_total").increment(1);
}

// =============================================================================
// Tests
// =============================================================================
