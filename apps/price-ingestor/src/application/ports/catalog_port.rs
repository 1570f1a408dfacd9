//! Catalog Port (Driven Port)
//!
//! Read interface returning the currently active instruments.

use async_trait::async_trait;

use crate::domain::instrument::Instrument;

/// Catalog read error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CatalogError {
    /// Catalog backend unreachable.
    #[error("catalog connection error: {message}")]
    ConnectionError {
        /// Error detail.
        message: String,
    },

    /// Query or row decoding failed.
    #[error("catalog query failed: {message}")]
    QueryFailed {
        /// Error detail.
        message: String,
    },
}

/// Port for loading the active instrument set.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CatalogPort: Send + Sync {
    /// Load every active `(ticker, entity, side)` row.
    async fn active_instruments(&self) -> Result<Vec<Instrument>, CatalogError>;
}
