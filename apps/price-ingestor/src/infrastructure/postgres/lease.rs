//! Leadership lease store backed by the `ingestor_leases` table.
//!
//! Acquire, renew and release are single statements guarded on owner and
//! expiry, so the database arbitrates every race.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPool;

use super::is_connection_error;
use crate::application::ports::{LeaseError, LeaseStorePort};
use crate::domain::leadership::LeaseRecord;

const CREATE_TABLE: &str = "CREATE TABLE IF NOT EXISTS ingestor_leases (\
    lease_key TEXT PRIMARY KEY, \
    owner_id TEXT NOT NULL, \
    expires_at TIMESTAMPTZ NOT NULL)";

const ACQUIRE: &str = "INSERT INTO ingestor_leases (lease_key, owner_id, expires_at) \
    VALUES ($1, $2, NOW() + make_interval(secs => $3)) \
    ON CONFLICT (lease_key) DO UPDATE SET \
    owner_id = EXCLUDED.owner_id, expires_at = EXCLUDED.expires_at \
    WHERE ingestor_leases.expires_at <= NOW() \
    RETURNING owner_id";

const RENEW: &str = "UPDATE ingestor_leases \
    SET expires_at = NOW() + make_interval(secs => $3) \
    WHERE lease_key = $1 AND owner_id = $2 AND expires_at > NOW()";

const RELEASE: &str = "DELETE FROM ingestor_leases WHERE lease_key = $1 AND owner_id = $2";

const CURRENT: &str = "SELECT owner_id, expires_at FROM ingestor_leases \
    WHERE lease_key = $1 AND expires_at > NOW()";

/// Lease store on the `ingestor_leases` table.
///
/// Expiry is judged by the database clock, so workers with skewed clocks
/// still agree on who holds the lease.
#[derive(Debug, Clone)]
pub struct PgLeaseStore {
    pool: PgPool,
}

impl PgLeaseStore {
    /// Create a store on `pool`.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create the lease table if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the DDL fails.
    pub async fn ensure_schema(&self) -> Result<(), LeaseError> {
        sqlx::query(CREATE_TABLE)
            .execute(&self.pool)
            .await
            .map_err(map_error)?;
        Ok(())
    }
}

fn map_error(e: sqlx::Error) -> LeaseError {
    if is_connection_error(&e) {
        LeaseError::ConnectionError {
            message: e.to_string(),
        }
    } else {
        LeaseError::OperationFailed {
            message: e.to_string(),
        }
    }
}

#[async_trait]
impl LeaseStorePort for PgLeaseStore {
    async fn try_acquire(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool, LeaseError> {
        let row: Option<(String,)> = sqlx::query_as(ACQUIRE)
            .bind(key)
            .bind(owner)
            .bind(ttl.as_secs_f64())
            .fetch_optional(&self.pool)
            .await
            .map_err(map_error)?;
        Ok(row.is_some())
    }

    async fn renew(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool, LeaseError> {
        let result = sqlx::query(RENEW)
            .bind(key)
            .bind(owner)
            .bind(ttl.as_secs_f64())
            .execute(&self.pool)
            .await
            .map_err(map_error)?;
        Ok(result.rows_affected() == 1)
    }

    async fn release(&self, key: &str, owner: &str) -> Result<(), LeaseError> {
        sqlx::query(RELEASE)
            .bind(key)
            .bind(owner)
            .execute(&self.pool)
            .await
            .map_err(map_error)?;
        Ok(())
    }

    async fn current(&self, key: &str) -> Result<Option<LeaseRecord>, LeaseError> {
        let row: Option<(String, DateTime<Utc>)> = sqlx::query_as(CURRENT)
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_error)?;
        Ok(row.map(|(owner_id, expires_at)| LeaseRecord {
            owner_id,
            expires_at,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_only_overwrites_expired_rows() {
        assert!(ACQUIRE.contains("WHERE ingestor_leases.expires_at <= NOW()"));
        assert!(ACQUIRE.contains("RETURNING owner_id"));
    }

    #[test]
    fn renew_and_release_are_owner_guarded() {
        assert!(RENEW.contains("owner_id = $2"));
        assert!(RELEASE.contains("owner_id = $2"));
    }

    #[test]
    fn pool_timeout_maps_to_connection_error() {
        assert!(matches!(
            map_error(sqlx::Error::PoolTimedOut),
            LeaseError::ConnectionError { .. }
        ));
        assert!(matches!(
            map_error(sqlx::Error::RowNotFound),
            LeaseError::OperationFailed { .. }
        ));
    }
}
