//! Domain Layer - Core ingestion types and business rules.
//!
//! This layer contains the instrument mapping, price/tick types, shard
//! partitioning rules and leadership records. Nothing here performs I/O.

/// Instrument identifiers and the ticker → entity registry.
pub mod instrument;

/// Ticks, price fields and pending per-entity updates.
pub mod pricing;

/// Capacity-bounded shard partitioning and ticker set diffing.
pub mod sharding;

/// Worker roles and lease records.
pub mod leadership;
