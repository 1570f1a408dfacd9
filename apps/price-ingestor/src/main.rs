//! Price Ingestor Binary
//!
//! Starts one ingestion worker. Every worker races for the leadership
//! lease; the winner connects upstream and persists, the others relay its
//! batches.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin price-ingestor
//! ```
//!
//! # Environment Variables
//!
//! ## Required
//! - `DATABASE_URL`: Postgres connection string
//! - `EXCHANGE_WS_URL`: exchange WebSocket feed URL
//!
//! ## Optional
//! - `INGESTOR_SHARD_CAPACITY`: tickers per connection (default: 500)
//! - `INGESTOR_FLUSH_INTERVAL_MS`: flush cadence (default: 1000)
//! - `INGESTOR_LEASE_TTL_MS`: leadership lease TTL (default: 15000)
//! - `INGESTOR_WORKER_ID`: worker id (default: `$HOSTNAME-<uuid>`)
//! - `INGESTOR_HEALTH_PORT`: health and metrics HTTP port (default: 8083)
//! - `OTEL_ENABLED`: enable OpenTelemetry (default: true)
//! - `RUST_LOG`: log filter (default: `price_ingestor=info`)
//!
//! See `IngestorConfig` for the full list.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use price_ingestor::application::ports::{
    BatchPublisherPort, BroadcastChannelPort, CatalogPort, Clock, LeaseStorePort, PriceSinkPort,
    SystemClock,
};
use price_ingestor::application::services::{
    LeaderConfig, LeaderCoordinator, RegistryRefresher, UpdateAggregator,
};
use price_ingestor::domain::instrument::InstrumentRegistry;
use price_ingestor::infrastructure::broadcast::{BroadcastHub, BroadcastPublisher};
use price_ingestor::infrastructure::config::IngestorConfig;
use price_ingestor::infrastructure::health::{HealthServer, HealthServerState};
use price_ingestor::infrastructure::postgres::{
    self, PgBroadcastChannel, PgCatalog, PgLeaseStore, PgPriceSink,
};
use price_ingestor::infrastructure::runtime::{IngestionRuntime, RuntimeConfig, RuntimeDeps};
use price_ingestor::infrastructure::telemetry;
use price_ingestor::init_metrics;
use tokio::signal;
use tokio_util::sync::CancellationToken;

/// Bound on the coordinator's stand-down after a shutdown signal.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
#[allow(clippy::expect_used)]
async fn main() -> anyhow::Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    load_dotenv();

    let _telemetry_guard = telemetry::init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Starting price ingestor");

    let _metrics_handle = init_metrics();

    let config = IngestorConfig::from_env().context("invalid configuration")?;
    log_config(&config);

    let shutdown_token = CancellationToken::new();

    // Postgres adapters
    let pool = postgres::connect(config.database.url(), config.database.max_connections)
        .await
        .context("connecting to Postgres")?;
    let lease_store = PgLeaseStore::new(pool.clone());
    lease_store
        .ensure_schema()
        .await
        .context("creating lease table")?;
    let lease_store: Arc<dyn LeaseStorePort> = Arc::new(lease_store);
    let catalog: Arc<dyn CatalogPort> =
        Arc::new(PgCatalog::new(pool.clone(), &config.registry.catalog_query));
    let sink: Arc<dyn PriceSinkPort> = Arc::new(PgPriceSink::new(pool.clone(), &config.sink.table));
    let channel: Arc<dyn BroadcastChannelPort> = Arc::new(PgBroadcastChannel::new(
        pool,
        &config.broadcast.channel,
        config.broadcast.max_payload_bytes,
    ));

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let registry = Arc::new(InstrumentRegistry::new());
    let hub = Arc::new(BroadcastHub::new(config.broadcast.local_capacity));

    // Registry: load once before racing so a new leader subscribes immediately.
    let refresher = Arc::new(RegistryRefresher::new(
        catalog,
        Arc::clone(&registry),
        Arc::clone(&clock),
        config.registry.refresh_interval,
    ));
    if let Err(e) = refresher.refresh().await {
        tracing::warn!(error = %e, "Initial catalog load failed, starting with an empty registry");
    }
    let refreshes = refresher.subscribe();
    tokio::spawn(Arc::clone(&refresher).run(shutdown_token.child_token()));

    // Aggregation and fan-out
    let publisher: Arc<dyn BatchPublisherPort> = Arc::new(BroadcastPublisher::new(
        config.lease.worker_id.clone(),
        Arc::clone(&hub),
        Arc::clone(&channel),
    ));
    let aggregator = Arc::new(UpdateAggregator::new(
        config.aggregator.clone(),
        Arc::clone(&registry),
        sink,
        publisher,
        Arc::clone(&clock),
    ));

    // Leadership
    let runtime = Arc::new(IngestionRuntime::new(
        RuntimeConfig {
            manager: config.manager.clone(),
            shard: config.exchange.shard_config(),
            event_buffer: config.exchange.event_buffer,
        },
        RuntimeDeps {
            worker_id: config.lease.worker_id.clone(),
            registry,
            aggregator: Arc::clone(&aggregator),
            hub: Arc::clone(&hub),
            channel,
            clock,
            refreshes,
        },
        shutdown_token.clone(),
    ));
    let coordinator = Arc::new(LeaderCoordinator::new(
        LeaderConfig {
            lease_key: config.lease.key.clone(),
            worker_id: config.lease.worker_id.clone(),
            timing: config.lease.timing,
        },
        lease_store,
        Arc::clone(&runtime) as _,
    ));
    let coordinator_handle =
        tokio::spawn(Arc::clone(&coordinator).run(shutdown_token.clone()));

    // Health server
    let health_state = Arc::new(HealthServerState::new(
        env!("CARGO_PKG_VERSION").to_string(),
        coordinator,
        runtime,
        aggregator,
        hub,
    ));
    let health_server = HealthServer::new(
        config.server.health_port,
        health_state,
        shutdown_token.clone(),
    );
    tokio::spawn(async move {
        if let Err(e) = health_server.run().await {
            tracing::error!(error = %e, "Health server error");
        }
    });

    tracing::info!(worker_id = %config.lease.worker_id, "Price ingestor ready");

    await_shutdown(shutdown_token).await;

    match tokio::time::timeout(SHUTDOWN_TIMEOUT, coordinator_handle).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::error!(error = %e, "Leader coordinator panicked"),
        Err(_) => tracing::warn!("Leader coordinator did not stop in time"),
    }

    tracing::info!("Price ingestor stopped");
    Ok(())
}

/// Load .env file from current or ancestor directories.
fn load_dotenv() {
    if dotenvy::dotenv().is_ok() {
        return;
    }

    if let Ok(cwd) = std::env::current_dir() {
        for dir in cwd.ancestors().skip(1) {
            let env_path = dir.join(".env");
            if env_path.exists() {
                let _ = dotenvy::from_path(&env_path);
                return;
            }
        }
    }
}

/// Log the parsed configuration.
fn log_config(config: &IngestorConfig) {
    tracing::info!(
        worker_id = %config.lease.worker_id,
        lease_key = %config.lease.key,
        shard_capacity = config.manager.capacity,
        flush_interval_ms = u64::try_from(config.aggregator.flush_interval.as_millis()).unwrap_or(u64::MAX),
        lease_ttl_ms = u64::try_from(config.lease.timing.ttl.as_millis()).unwrap_or(u64::MAX),
        health_port = config.server.health_port,
        "Configuration loaded"
    );
    tracing::debug!(
        exchange_url = %config.exchange.url,
        sink_table = %config.sink.table,
        broadcast_channel = %config.broadcast.channel,
        "Endpoints"
    );
}

/// Wait for shutdown signal (SIGTERM or SIGINT).
#[allow(clippy::expect_used)]
async fn await_shutdown(shutdown_token: CancellationToken) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("signal handler installation is critical for graceful shutdown");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("SIGTERM handler installation is critical for graceful shutdown")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
    }

    shutdown_token.cancel();

    tracing::info!(
        timeout_secs = SHUTDOWN_TIMEOUT.as_secs(),
        "Graceful shutdown started"
    );
}
