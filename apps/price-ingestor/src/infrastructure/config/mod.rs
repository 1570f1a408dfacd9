//! Configuration Module
//!
//! Environment-driven configuration for the ingestor binary.

mod settings;

pub use settings::{
    BroadcastSettings, ConfigError, DatabaseSettings, ExchangeSettings, IngestorConfig,
    LeaseSettings, RegistrySettings, ServerSettings, SinkSettings,
};
