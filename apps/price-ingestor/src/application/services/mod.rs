//! Application Services
//!
//! Services that orchestrate domain logic and coordinate between ports.
//!
//! - `UpdateAggregator`: per-entity dedup and timed batch flushes
//! - `LeaderCoordinator`: lease race, renewal and demotion
//! - `RegistryRefresher`: periodic catalog reload into the registry

pub mod aggregator;
pub mod leader;
pub mod registry_refresh;

pub use aggregator::{
    AggregatorConfig, AggregatorStats, EnqueueOutcome, FlushOutcome, UpdateAggregator,
};
pub use leader::{LeaderConfig, LeaderCoordinator, LeadershipHandler};
pub use registry_refresh::{RefreshReport, RegistryRefresher};
