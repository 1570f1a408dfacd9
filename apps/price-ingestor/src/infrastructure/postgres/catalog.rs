//! Instrument catalog read through a configurable SQL query.

use async_trait::async_trait;
use sqlx::postgres::PgPool;

use super::is_connection_error;
use crate::application::ports::{CatalogError, CatalogPort};
use crate::domain::instrument::Instrument;

/// Catalog backed by a configurable query returning
/// `(ticker_id, entity_id, side)` rows.
#[derive(Debug, Clone)]
pub struct PgCatalog {
    pool: PgPool,
    query: String,
}

impl PgCatalog {
    /// Create a catalog running `query` on every refresh.
    #[must_use]
    pub fn new(pool: PgPool, query: impl Into<String>) -> Self {
        Self {
            pool,
            query: query.into(),
        }
    }
}

#[async_trait]
impl CatalogPort for PgCatalog {
    async fn active_instruments(&self) -> Result<Vec<Instrument>, CatalogError> {
        let rows: Vec<(String, String, Option<String>)> = sqlx::query_as(&self.query)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| {
                if is_connection_error(&e) {
                    CatalogError::ConnectionError {
                        message: e.to_string(),
                    }
                } else {
                    CatalogError::QueryFailed {
                        message: e.to_string(),
                    }
                }
            })?;

        Ok(rows
            .into_iter()
            .map(|(ticker_id, entity_id, side)| {
                let instrument = Instrument::new(ticker_id, entity_id);
                match side {
                    Some(side) => instrument.with_side(side),
                    None => instrument,
                }
            })
            .collect())
    }
}
