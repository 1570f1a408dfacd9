//! Postgres Adapters
//!
//! `sqlx` implementations of the catalog, price sink, lease store and
//! broadcast channel ports, all sharing one connection pool.

mod catalog;
mod channel;
mod lease;
mod sink;

use std::time::Duration;

use sqlx::postgres::{PgPool, PgPoolOptions};

pub use catalog::PgCatalog;
pub use channel::PgBroadcastChannel;
pub use lease::PgLeaseStore;
pub use sink::PgPriceSink;

/// Open a connection pool.
///
/// # Errors
///
/// Returns the driver error when the first connection cannot be made.
pub async fn connect(database_url: &str, max_connections: u32) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(Duration::from_secs(5))
        .connect(database_url)
        .await
}

/// Whether `name` is safe to splice into SQL as a (optionally
/// schema-qualified) identifier.
#[must_use]
pub fn is_valid_identifier(name: &str) -> bool {
    !name.is_empty()
        && name.split('.').count() <= 2
        && name.split('.').all(|part| {
            let mut chars = part.chars();
            chars
                .next()
                .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
                && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        })
}

/// Whether a driver error means the database could not be reached.
fn is_connection_error(error: &sqlx::Error) -> bool {
    matches!(
        error,
        sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed
    )
}
