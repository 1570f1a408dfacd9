//! Health and Metrics Endpoint
//!
//! Reports the worker's role, upstream shard states and aggregator counters,
//! and serves the Prometheus scrape.
//!
//! # Endpoints
//!
//! - `GET /health` - JSON report; 503 while leading with no shard connected
//! - `GET /healthz` - liveness, always OK while the process runs
//! - `GET /readyz` - readiness: a leader needs one connected shard, a
//!   follower is always ready, a candidate never is
//! - `GET /metrics` - Prometheus text exposition

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::application::services::{AggregatorStats, LeaderCoordinator, UpdateAggregator};
use crate::domain::leadership::Role;
use crate::infrastructure::broadcast::SharedBroadcastHub;
use crate::infrastructure::exchange::{ShardState, ShardStatus};
use crate::infrastructure::metrics::get_metrics_handle;
use crate::infrastructure::runtime::IngestionRuntime;

// =============================================================================
// Health Response Types
// =============================================================================

/// Body of `GET /health`.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Derived from role and shard connectivity.
    pub status: HealthStatus,
    /// Ingestor version.
    pub version: String,
    /// Seconds since the server state was built.
    pub uptime_secs: u64,
    /// Wall clock at response time.
    pub current_time: DateTime<Utc>,
    /// This worker.
    pub worker_id: String,
    /// Leadership role.
    pub role: Role,
    /// Upstream shards (leader only).
    pub shards: ShardsStatus,
    /// Aggregator counters.
    pub aggregator: AggregatorStats,
    /// Local broadcast receivers.
    pub broadcast_receivers: usize,
}

/// Worker health.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Following, or leading with every shard connected.
    Healthy,
    /// Some shards disconnected.
    Degraded,
    /// Leading with no shard connected.
    Unhealthy,
}

/// Shard summary.
#[derive(Debug, Clone, Serialize)]
pub struct ShardsStatus {
    /// Shards running.
    pub total: usize,
    /// Shards subscribed.
    pub connected: usize,
    /// Per-shard detail.
    pub detail: Vec<ShardStatus>,
}

// =============================================================================
// Server State
// =============================================================================

/// Handles the endpoints read from.
pub struct HealthServerState {
    version: String,
    started_at: Instant,
    coordinator: Arc<LeaderCoordinator>,
    runtime: Arc<IngestionRuntime>,
    aggregator: Arc<UpdateAggregator>,
    broadcast_hub: SharedBroadcastHub,
}

impl HealthServerState {
    /// Capture the handles and start the uptime clock.
    #[must_use]
    pub fn new(
        version: String,
        coordinator: Arc<LeaderCoordinator>,
        runtime: Arc<IngestionRuntime>,
        aggregator: Arc<UpdateAggregator>,
        broadcast_hub: SharedBroadcastHub,
    ) -> Self {
        Self {
            version,
            started_at: Instant::now(),
            coordinator,
            runtime,
            aggregator,
            broadcast_hub,
        }
    }
}

// =============================================================================
// Health Server
// =============================================================================

/// Axum server for the health and metrics endpoints.
pub struct HealthServer {
    port: u16,
    state: Arc<HealthServerState>,
    cancel: CancellationToken,
}

impl HealthServer {
    /// Bind on all interfaces at `port` once run.
    #[must_use]
    pub const fn new(port: u16, state: Arc<HealthServerState>, cancel: CancellationToken) -> Self {
        Self {
            port,
            state,
            cancel,
        }
    }

    /// Serve until the token is cancelled.
    ///
    /// # Errors
    ///
    /// Returns `HealthServerError` when the port cannot be bound or serving
    /// fails.
    pub async fn run(self) -> Result<(), HealthServerError> {
        let port = self.port;
        let listener = TcpListener::bind(SocketAddr::from(([0, 0, 0, 0], port)))
            .await
            .map_err(|e| HealthServerError::Bind {
                port,
                message: e.to_string(),
            })?;
        tracing::info!(port, "Health endpoint listening");

        axum::serve(listener, router(self.state))
            .with_graceful_shutdown(self.cancel.cancelled_owned())
            .await
            .map_err(|e| HealthServerError::Serve {
                message: e.to_string(),
            })?;

        tracing::info!(port, "Health endpoint stopped");
        Ok(())
    }
}

fn router(state: Arc<HealthServerState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/healthz", get(liveness_handler))
        .route("/readyz", get(readiness_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

// =============================================================================
// HTTP Handlers
// =============================================================================

async fn health_handler(State(state): State<Arc<HealthServerState>>) -> impl IntoResponse {
    let report = build_health_response(&state);
    let code = if report.status == HealthStatus::Unhealthy {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    (code, Json(report))
}

async fn liveness_handler() -> &'static str {
    "OK"
}

async fn readiness_handler(State(state): State<Arc<HealthServerState>>) -> impl IntoResponse {
    let role = state.coordinator.role();
    let connected = count_connected(&state.runtime.shard_status());

    if is_ready(role, connected) {
        (StatusCode::OK, "READY")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "NOT READY")
    }
}

const PROMETHEUS_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

async fn metrics_handler() -> impl IntoResponse {
    match get_metrics_handle() {
        Some(handle) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, PROMETHEUS_CONTENT_TYPE)],
            handle.render(),
        ),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            [(header::CONTENT_TYPE, "text/plain")],
            "metrics recorder not installed".to_string(),
        ),
    }
}

fn build_health_response(state: &HealthServerState) -> HealthResponse {
    let role = state.coordinator.role();
    let detail = state.runtime.shard_status();
    let connected = count_connected(&detail);

    HealthResponse {
        status: determine_health_status(role, connected, detail.len()),
        version: state.version.clone(),
        uptime_secs: state.started_at.elapsed().as_secs(),
        current_time: Utc::now(),
        worker_id: state.coordinator.worker_id().to_string(),
        role,
        shards: ShardsStatus {
            total: detail.len(),
            connected,
            detail,
        },
        aggregator: state.aggregator.stats(),
        broadcast_receivers: state.broadcast_hub.stats().receivers,
    }
}

fn count_connected(shards: &[ShardStatus]) -> usize {
    shards
        .iter()
        .filter(|s| s.state == ShardState::Connected)
        .count()
}

const fn is_ready(role: Role, connected: usize) -> bool {
    match role {
        Role::Leader => connected > 0,
        Role::Follower => true,
        Role::Candidate => false,
    }
}

const fn determine_health_status(role: Role, connected: usize, total: usize) -> HealthStatus {
    match role {
        Role::Leader if connected == 0 => HealthStatus::Unhealthy,
        Role::Leader if connected < total => HealthStatus::Degraded,
        _ => HealthStatus::Healthy,
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Health endpoint failures.
#[derive(Debug, thiserror::Error)]
pub enum HealthServerError {
    /// The listener could not be bound.
    #[error("health endpoint cannot bind port {port}: {message}")]
    Bind {
        /// Requested port.
        port: u16,
        /// OS error text.
        message: String,
    },

    /// Serving stopped with an error.
    #[error("health endpoint failed: {message}")]
    Serve {
        /// Server error text.
        message: String,
    },
}

// =============================================================================
// Tests
// =============================================================================
