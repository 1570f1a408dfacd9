#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::float_cmp,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::needless_pass_by_value,
        clippy::items_after_statements,
        clippy::cast_possible_truncation
    )
)]

//! Price Ingestor - Sharded Exchange Feed Ingestion
//!
//! Keeps capacity-bounded WebSocket connections to an exchange price feed,
//! collapses ticks into the latest value per entity, persists them in
//! timed batches and fans each persisted batch out to local consumers and
//! follower workers. A Postgres lease makes exactly one worker the leader.
//!
//! # Layers (inside → outside)
//!
//! - **Domain**: Identifiers, ticks, partitioning and lease records
//!   - `instrument`: ticker → entity registry with atomic snapshot swaps
//!   - `pricing`: ticks, price fields and pending per-entity updates
//!   - `sharding`: capacity-bounded partitioning
//!   - `leadership`: worker ids, roles and lease timing
//!
//! - **Application**: Use cases and port definitions
//!   - `ports`: catalog, price sink, lease store, broadcast channel, clock
//!   - `services`: update aggregator, leader coordinator, registry refresher
//!
//! - **Infrastructure**: Adapters and external integrations
//!   - `exchange`: shards, keepalive, reconnect policy, connection manager
//!   - `broadcast`: batch frames, local hub, publisher, follower relay
//!   - `postgres` / `memory`: port adapters
//!   - `runtime`: what each role runs
//!   - `config`, `health`, `metrics`, `telemetry`
//!
//! # Data Flow
//!
//! ```text
//!  exchange WS ──► shard 0 ─┐
//!  exchange WS ──► shard 1 ─┼─► dispatch ─► aggregator ─► sink (Postgres)
//!  exchange WS ──► shard N ─┘                   │
//!                                               └─► publisher ─► local hub
//!                                                        │
//!                                                        └─► NOTIFY ─► follower relay ─► local hub
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

/// Domain layer - Core ingestion types with no I/O.
pub mod domain;

/// Application layer - Use cases and port definitions.
pub mod application;

/// Infrastructure layer - Adapters and external integrations.
pub mod infrastructure;

// =============================================================================
// Re-exports
// =============================================================================

// Domain types
pub use domain::instrument::{EntityId, Instrument, InstrumentRegistry, TickerId};
pub use domain::leadership::{LeaseTiming, Role, WorkerId};
pub use domain::pricing::{PendingUpdate, PriceBatch, PriceFields, Tick};

// Application services
pub use application::services::{
    AggregatorConfig, LeaderConfig, LeaderCoordinator, RegistryRefresher, UpdateAggregator,
};

// Infrastructure config
pub use infrastructure::config::{ConfigError, IngestorConfig};

// Health server
pub use infrastructure::health::{HealthServer, HealthServerError, HealthServerState};

// Broadcast (for integration tests)
pub use infrastructure::broadcast::{BatchFrame, BroadcastHub, BroadcastPublisher, FollowerRelay};

// Metrics
pub use infrastructure::metrics::init_metrics;

// Telemetry
pub use infrastructure::telemetry::{TelemetryConfig, TelemetryGuard, init as init_telemetry};
