//! Infrastructure Layer - Adapters and external integrations.
//!
//! This layer contains the concrete implementations of the port interfaces
//! defined in the application layer, plus the process-level plumbing.

/// Sharded WebSocket connections to the exchange feed.
pub mod exchange;

/// Batch frames, local fan-out, publisher and follower relay.
pub mod broadcast;

/// Postgres adapters (catalog, sink, lease store, LISTEN/NOTIFY).
pub mod postgres;

/// In-memory adapters for tests and single-process runs.
pub mod memory;

/// Role-driven task wiring (leader ingestion, follower relay).
pub mod runtime;

/// Configuration loading.
pub mod config;

/// Health check HTTP endpoint.
pub mod health;

/// Prometheus metrics instrumentation.
pub mod metrics;

/// Tracing subscriber and OpenTelemetry export.
pub mod telemetry;
