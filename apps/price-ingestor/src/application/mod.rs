//! Application Layer - Use cases and port definitions.
//!
//! This layer contains the application services that drive ingestion and
//! the port interfaces that describe the external systems they depend on.

/// Port interfaces for external systems (catalog, sink, lease store, channel, clock).
pub mod ports;

/// Application services: aggregation, leadership and registry refresh.
pub mod services;
