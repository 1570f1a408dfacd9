//! Ingestor Configuration Settings
//!
//! Configuration types for the ingestor, loaded from environment variables.
//! Unparseable optional values fall back to their defaults; structural
//! problems (zero capacity, renew interval not below the TTL, unsafe SQL
//! identifiers) are rejected.

use std::sync::Arc;
use std::time::Duration;

use crate::application::services::AggregatorConfig;
use crate::domain::leadership::{LeaseTiming, WorkerId};
use crate::infrastructure::exchange::{
    KeepaliveConfig, ManagerConfig, ResilienceConfig, ShardConfig, SubscriptionFormat,
};
use crate::infrastructure::postgres::is_valid_identifier;

/// Largest payload Postgres `NOTIFY` accepts with default settings, minus headroom.
const NOTIFY_PAYLOAD_CEILING: usize = 7_999;

/// Database settings.
#[derive(Clone)]
pub struct DatabaseSettings {
    url: String,
    /// Pool size.
    pub max_connections: u32,
}

impl DatabaseSettings {
    /// Connection URL.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }
}

impl std::fmt::Debug for DatabaseSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabaseSettings")
            .field("url", &"[REDACTED]")
            .field("max_connections", &self.max_connections)
            .finish()
    }
}

/// Upstream exchange settings.
#[derive(Debug, Clone)]
pub struct ExchangeSettings {
    /// WebSocket URL.
    pub url: String,
    /// Per-connect bound.
    pub connect_timeout: Duration,
    /// Subscription message layout.
    pub subscription: SubscriptionFormat,
    /// Keepalive protocol.
    pub keepalive: KeepaliveConfig,
    /// Reconnect classification and backoff.
    pub resilience: ResilienceConfig,
    /// Shard events buffered ahead of dispatch.
    pub event_buffer: usize,
}

impl ExchangeSettings {
    /// Shard settings derived from these.
    #[must_use]
    pub fn shard_config(&self) -> Arc<ShardConfig> {
        Arc::new(ShardConfig {
            subscription: self.subscription.clone(),
            keepalive: self.keepalive.clone(),
            resilience: self.resilience.clone(),
            connect_timeout: self.connect_timeout,
            ..ShardConfig::new(self.url.clone())
        })
    }
}

/// Leadership lease settings.
#[derive(Debug, Clone)]
pub struct LeaseSettings {
    /// Lease key shared by the fleet.
    pub key: String,
    /// This worker's id.
    pub worker_id: WorkerId,
    /// TTL and intervals.
    pub timing: LeaseTiming,
}

/// Instrument registry settings.
#[derive(Debug, Clone)]
pub struct RegistrySettings {
    /// Catalog reload cadence.
    pub refresh_interval: Duration,
    /// Query returning `(ticker_id, entity_id, side)` rows.
    pub catalog_query: String,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            refresh_interval: Duration::from_secs(60),
            catalog_query: "SELECT ticker_id, entity_id, side FROM instrument_tickers WHERE active"
                .to_string(),
        }
    }
}

/// Batch broadcast settings.
#[derive(Debug, Clone)]
pub struct BroadcastSettings {
    /// `LISTEN`/`NOTIFY` channel name.
    pub channel: String,
    /// Local hub buffer per receiver.
    pub local_capacity: usize,
    /// Largest frame payload in bytes.
    pub max_payload_bytes: usize,
}

impl Default for BroadcastSettings {
    fn default() -> Self {
        Self {
            channel: "price_batches".to_string(),
            local_capacity: 1_024,
            max_payload_bytes: 7_500,
        }
    }
}

/// Persistence settings.
#[derive(Debug, Clone)]
pub struct SinkSettings {
    /// Table holding the latest price per entity.
    pub table: String,
}

impl Default for SinkSettings {
    fn default() -> Self {
        Self {
            table: "latest_prices".to_string(),
        }
    }
}

/// Server port settings.
#[derive(Debug, Clone)]
pub struct ServerSettings {
    /// Health check HTTP port.
    pub health_port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self { health_port: 8083 }
    }
}

/// Complete ingestor configuration.
#[derive(Debug, Clone)]
pub struct IngestorConfig {
    /// Postgres connection.
    pub database: DatabaseSettings,
    /// Upstream feed.
    pub exchange: ExchangeSettings,
    /// Sharding and rebuild scheduling.
    pub manager: ManagerConfig,
    /// Dedup and flush.
    pub aggregator: AggregatorConfig,
    /// Leader election.
    pub lease: LeaseSettings,
    /// Catalog refresh.
    pub registry: RegistrySettings,
    /// Fan-out.
    pub broadcast: BroadcastSettings,
    /// Persistence.
    pub sink: SinkSettings,
    /// HTTP ports.
    pub server: ServerSettings,
}

impl IngestorConfig {
    /// Create configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if required variables are missing or the resulting
    /// configuration is invalid.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create configuration from an arbitrary key lookup.
    ///
    /// # Errors
    ///
    /// Same as [`IngestorConfig::from_env`].
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let env = Env(&lookup);

        let database = DatabaseSettings {
            url: env.required("DATABASE_URL")?,
            max_connections: env.parse("DATABASE_MAX_CONNECTIONS", 10),
        };

        let keepalive_defaults = KeepaliveConfig::default();
        let subscription_defaults = SubscriptionFormat::default();
        let resilience_defaults = ResilienceConfig::default();
        let exchange = ExchangeSettings {
            url: env.required("EXCHANGE_WS_URL")?,
            connect_timeout: env.millis("INGESTOR_CONNECT_TIMEOUT_MS", Duration::from_secs(10)),
            subscription: SubscriptionFormat {
                tickers_field: env.string(
                    "INGESTOR_SUBSCRIBE_TICKERS_FIELD",
                    subscription_defaults.tickers_field,
                ),
                feed_type_field: env.string(
                    "INGESTOR_SUBSCRIBE_TYPE_FIELD",
                    subscription_defaults.feed_type_field,
                ),
                feed_type: env.string("INGESTOR_FEED_TYPE", subscription_defaults.feed_type),
            },
            keepalive: KeepaliveConfig {
                payload: env.string("INGESTOR_KEEPALIVE_PAYLOAD", keepalive_defaults.payload),
                ack: env.string("INGESTOR_KEEPALIVE_ACK", keepalive_defaults.ack),
                probe: env.string("INGESTOR_KEEPALIVE_PROBE", keepalive_defaults.probe),
                reply: env.string("INGESTOR_KEEPALIVE_REPLY", keepalive_defaults.reply),
                interval: env.millis("INGESTOR_KEEPALIVE_INTERVAL_MS", keepalive_defaults.interval),
                idle_timeout: env.millis(
                    "INGESTOR_IDLE_TIMEOUT_MS",
                    keepalive_defaults.idle_timeout,
                ),
            },
            resilience: ResilienceConfig {
                stability_threshold: env.millis(
                    "INGESTOR_STABILITY_THRESHOLD_MS",
                    resilience_defaults.stability_threshold,
                ),
                stable_delay: env.millis(
                    "INGESTOR_STABLE_RECONNECT_DELAY_MS",
                    resilience_defaults.stable_delay,
                ),
                base_delay: env.millis("INGESTOR_BACKOFF_BASE_MS", resilience_defaults.base_delay),
                max_delay: env.millis("INGESTOR_BACKOFF_MAX_MS", resilience_defaults.max_delay),
                rapid_failure_limit: env.parse(
                    "INGESTOR_RAPID_FAILURE_LIMIT",
                    resilience_defaults.rapid_failure_limit,
                ),
                cooldown: env.millis("INGESTOR_COOLDOWN_MS", resilience_defaults.cooldown),
                jitter_factor: env.parse(
                    "INGESTOR_JITTER_FACTOR",
                    resilience_defaults.jitter_factor,
                ),
            },
            event_buffer: env.parse("INGESTOR_EVENT_BUFFER", 10_000),
        };

        let manager_defaults = ManagerConfig::default();
        let manager = ManagerConfig {
            capacity: env.parse("INGESTOR_SHARD_CAPACITY", manager_defaults.capacity),
            debounce: env.millis("INGESTOR_DEBOUNCE_MS", manager_defaults.debounce),
            settle: env.millis("INGESTOR_SETTLE_MS", manager_defaults.settle),
            recent_window: env.millis("INGESTOR_RECENT_WINDOW_MS", manager_defaults.recent_window),
        };

        let aggregator_defaults = AggregatorConfig::default();
        let aggregator = AggregatorConfig {
            flush_interval: env.millis(
                "INGESTOR_FLUSH_INTERVAL_MS",
                aggregator_defaults.flush_interval,
            ),
            start_offset: env.millis("INGESTOR_FLUSH_OFFSET_MS", aggregator_defaults.start_offset),
            max_pending: env.parse("INGESTOR_MAX_PENDING", aggregator_defaults.max_pending),
        };

        let timing_defaults = LeaseTiming::default();
        let lease = LeaseSettings {
            key: env.string("INGESTOR_LEASE_KEY", "price-ingestor-leader".to_string()),
            worker_id: env.get("INGESTOR_WORKER_ID").map_or_else(
                || {
                    let host = env.get("HOSTNAME").unwrap_or_else(|| "ingestor".to_string());
                    WorkerId::generate(&host)
                },
                WorkerId::new,
            ),
            timing: LeaseTiming {
                ttl: env.millis("INGESTOR_LEASE_TTL_MS", timing_defaults.ttl),
                renew_interval: env.millis("INGESTOR_LEASE_RENEW_MS", timing_defaults.renew_interval),
                acquire_interval: env.millis(
                    "INGESTOR_LEASE_ACQUIRE_MS",
                    timing_defaults.acquire_interval,
                ),
            },
        };

        let registry_defaults = RegistrySettings::default();
        let registry = RegistrySettings {
            refresh_interval: env.millis(
                "INGESTOR_REGISTRY_REFRESH_MS",
                registry_defaults.refresh_interval,
            ),
            catalog_query: env.string("INGESTOR_CATALOG_QUERY", registry_defaults.catalog_query),
        };

        let broadcast_defaults = BroadcastSettings::default();
        let broadcast = BroadcastSettings {
            channel: env.string("INGESTOR_BROADCAST_CHANNEL", broadcast_defaults.channel),
            local_capacity: env.parse(
                "INGESTOR_BROADCAST_CAPACITY",
                broadcast_defaults.local_capacity,
            ),
            max_payload_bytes: env.parse(
                "INGESTOR_MAX_PAYLOAD_BYTES",
                broadcast_defaults.max_payload_bytes,
            ),
        };

        let config = Self {
            database,
            exchange,
            manager,
            aggregator,
            lease,
            registry,
            broadcast,
            sink: SinkSettings {
                table: env.string("INGESTOR_SINK_TABLE", SinkSettings::default().table),
            },
            server: ServerSettings {
                health_port: env.parse("INGESTOR_HEALTH_PORT", ServerSettings::default().health_port),
            },
        };
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the offending variable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.manager.capacity == 0 {
            return Err(invalid("INGESTOR_SHARD_CAPACITY", "must be at least 1"));
        }
        if !self.lease.timing.is_consistent() {
            return Err(invalid(
                "INGESTOR_LEASE_RENEW_MS",
                "must be shorter than the lease TTL",
            ));
        }
        if self.aggregator.max_pending == 0 {
            return Err(invalid("INGESTOR_MAX_PENDING", "must be at least 1"));
        }
        if self.aggregator.flush_interval.is_zero() {
            return Err(invalid("INGESTOR_FLUSH_INTERVAL_MS", "must be positive"));
        }
        if !(0.0..=1.0).contains(&self.exchange.resilience.jitter_factor) {
            return Err(invalid("INGESTOR_JITTER_FACTOR", "must be within 0..=1"));
        }
        if self.broadcast.max_payload_bytes == 0
            || self.broadcast.max_payload_bytes > NOTIFY_PAYLOAD_CEILING
        {
            return Err(invalid(
                "INGESTOR_MAX_PAYLOAD_BYTES",
                "must be between 1 and 7999",
            ));
        }
        if !is_valid_identifier(&self.sink.table) {
            return Err(invalid("INGESTOR_SINK_TABLE", "is not a valid SQL identifier"));
        }
        if !is_valid_identifier(&self.broadcast.channel) {
            return Err(invalid(
                "INGESTOR_BROADCAST_CHANNEL",
                "is not a valid channel name",
            ));
        }
        Ok(())
    }
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),
    /// Environment variable has empty value.
    #[error("environment variable {0} cannot be empty")]
    EmptyValue(String),
    /// Value present but unusable.
    #[error("invalid value for {key}: {reason}")]
    Invalid {
        /// Offending variable.
        key: String,
        /// What is wrong with it.
        reason: String,
    },
}

fn invalid(key: &str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        key: key.to_string(),
        reason: reason.to_string(),
    }
}

struct Env<'a>(&'a dyn Fn(&str) -> Option<String>);

impl Env<'_> {
    fn get(&self, key: &str) -> Option<String> {
        (self.0)(key)
    }

    fn required(&self, key: &str) -> Result<String, ConfigError> {
        let value = self
            .get(key)
            .ok_or_else(|| ConfigError::MissingEnvVar(key.to_string()))?;
        if value.trim().is_empty() {
            return Err(ConfigError::EmptyValue(key.to_string()));
        }
        Ok(value)
    }

    fn string(&self, key: &str, default: String) -> String {
        self.get(key).filter(|v| !v.is_empty()).unwrap_or(default)
    }

    fn parse<T: std::str::FromStr>(&self, key: &str, default: T) -> T {
        self.get(key)
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(default)
    }

    fn millis(&self, key: &str, default: Duration) -> Duration {
        self.get(key)
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map_or(default, Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn load(pairs: &[(&str, &str)]) -> Result<IngestorConfig, ConfigError> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        IngestorConfig::from_lookup(|key| vars.get(key).cloned())
    }

    const REQUIRED: [(&str, &str); 2] = [
        ("DATABASE_URL", "postgres://localhost/prices"),
        ("EXCHANGE_WS_URL", "wss://feed.example/ws"),
    ];

    #[test]
    fn defaults_with_required_vars() {
        let config = load(&REQUIRED).unwrap();
        assert_eq!(config.manager.capacity, 500);
        assert_eq!(config.aggregator.flush_interval, Duration::from_secs(1));
        assert_eq!(config.lease.timing.ttl, Duration::from_secs(15));
        assert_eq!(config.broadcast.max_payload_bytes, 7_500);
        assert_eq!(config.exchange.subscription.tickers_field, "assets_ids");
        assert_eq!(config.server.health_port, 8083);
        assert!(!config.lease.worker_id.as_str().is_empty());
    }

    #[test]
    fn missing_database_url() {
        let err = load(&[("EXCHANGE_WS_URL", "wss://x")]).unwrap_err();
        assert!(matches!(err, ConfigError::MissingEnvVar(key) if key == "DATABASE_URL"));
    }

    #[test]
    fn empty_exchange_url() {
        let err = load(&[("DATABASE_URL", "postgres://x"), ("EXCHANGE_WS_URL", " ")]).unwrap_err();
        assert!(matches!(err, ConfigError::EmptyValue(key) if key == "EXCHANGE_WS_URL"));
    }

    #[test]
    fn overrides_are_applied() {
        let mut pairs = REQUIRED.to_vec();
        pairs.extend([
            ("INGESTOR_SHARD_CAPACITY", "250"),
            ("INGESTOR_KEEPALIVE_PAYLOAD", "ping"),
            ("INGESTOR_WORKER_ID", "worker-a"),
            ("INGESTOR_FLUSH_INTERVAL_MS", "2000"),
        ]);
        let config = load(&pairs).unwrap();
        assert_eq!(config.manager.capacity, 250);
        assert_eq!(config.exchange.keepalive.payload, "ping");
        assert_eq!(config.lease.worker_id.as_str(), "worker-a");
        assert_eq!(config.aggregator.flush_interval, Duration::from_secs(2));
    }

    #[test]
    fn unparseable_value_falls_back_to_default() {
        let mut pairs = REQUIRED.to_vec();
        pairs.push(("INGESTOR_SHARD_CAPACITY", "lots"));
        assert_eq!(load(&pairs).unwrap().manager.capacity, 500);
    }

    #[test]
    fn zero_capacity_is_rejected() {
        let mut pairs = REQUIRED.to_vec();
        pairs.push(("INGESTOR_SHARD_CAPACITY", "0"));
        assert!(matches!(
            load(&pairs),
            Err(ConfigError::Invalid { key, .. }) if key == "INGESTOR_SHARD_CAPACITY"
        ));
    }

    #[test]
    fn renew_not_below_ttl_is_rejected() {
        let mut pairs = REQUIRED.to_vec();
        pairs.extend([
            ("INGESTOR_LEASE_TTL_MS", "5000"),
            ("INGESTOR_LEASE_RENEW_MS", "5000"),
        ]);
        assert!(matches!(
            load(&pairs),
            Err(ConfigError::Invalid { key, .. }) if key == "INGESTOR_LEASE_RENEW_MS"
        ));
    }

    #[test]
    fn unsafe_table_name_is_rejected() {
        let mut pairs = REQUIRED.to_vec();
        pairs.push(("INGESTOR_SINK_TABLE", "prices; drop table x"));
        assert!(load(&pairs).is_err());
    }

    #[test]
    fn payload_limit_above_notify_ceiling_is_rejected() {
        let mut pairs = REQUIRED.to_vec();
        pairs.push(("INGESTOR_MAX_PAYLOAD_BYTES", "9000"));
        assert!(load(&pairs).is_err());
    }

    #[test]
    fn database_url_is_redacted() {
        let config = load(&REQUIRED).unwrap();
        let debug = format!("{:?}", config.database);
        assert!(!debug.contains("localhost"));
        assert!(debug.contains("[REDACTED]"));
    }
}
