//! Batched latest-price upsert.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::PgPool;

use super::is_connection_error;
use crate::application::ports::{PriceSinkPort, SinkError};
use crate::domain::pricing::PendingUpdate;

/// Price sink writing one `UNNEST` upsert per flush.
///
/// Rows are keyed by `entity_id`; a row is only overwritten by an update
/// whose exchange timestamp is not older, so replays are no-ops.
#[derive(Debug, Clone)]
pub struct PgPriceSink {
    pool: PgPool,
    statement: String,
}

impl PgPriceSink {
    /// Create a sink writing to `table`.
    ///
    /// `table` must already have passed identifier validation.
    #[must_use]
    pub fn new(pool: PgPool, table: &str) -> Self {
        Self {
            pool,
            statement: upsert_statement(table),
        }
    }
}

fn upsert_statement(table: &str) -> String {
    format!(
        "INSERT INTO {table} \
         (entity_id, ticker_id, side, best_bid, best_ask, mid, spread, last_trade, exchange_ts, received_at) \
         SELECT * FROM UNNEST(\
         $1::text[], $2::text[], $3::text[], $4::numeric[], $5::numeric[], \
         $6::numeric[], $7::numeric[], $8::numeric[], $9::timestamptz[], $10::timestamptz[]) \
         ON CONFLICT (entity_id) DO UPDATE SET \
         ticker_id = EXCLUDED.ticker_id, \
         side = EXCLUDED.side, \
         best_bid = EXCLUDED.best_bid, \
         best_ask = EXCLUDED.best_ask, \
         mid = EXCLUDED.mid, \
         spread = EXCLUDED.spread, \
         last_trade = EXCLUDED.last_trade, \
         exchange_ts = EXCLUDED.exchange_ts, \
         received_at = EXCLUDED.received_at \
         WHERE {table}.exchange_ts <= EXCLUDED.exchange_ts"
    )
}

/// Column-major view of a batch for array binding.
#[derive(Default)]
struct Columns {
    entity_ids: Vec<String>,
    ticker_ids: Vec<String>,
    sides: Vec<Option<String>>,
    best_bids: Vec<Option<Decimal>>,
    best_asks: Vec<Option<Decimal>>,
    mids: Vec<Option<Decimal>>,
    spreads: Vec<Option<Decimal>>,
    last_trades: Vec<Option<Decimal>>,
    exchange_ts: Vec<DateTime<Utc>>,
    received_at: Vec<DateTime<Utc>>,
}

impl Columns {
    fn from_updates(updates: &[PendingUpdate]) -> Self {
        let mut columns = Self::default();
        for u in updates {
            columns.entity_ids.push(u.entity_id.as_str().to_string());
            columns.ticker_ids.push(u.ticker_id.as_str().to_string());
            columns.sides.push(u.side.clone());
            columns.best_bids.push(u.best_bid);
            columns.best_asks.push(u.best_ask);
            columns.mids.push(u.mid);
            columns.spreads.push(u.spread);
            columns.last_trades.push(u.last_trade);
            columns.exchange_ts.push(u.exchange_ts);
            columns.received_at.push(u.received_at);
        }
        columns
    }
}

#[async_trait]
impl PriceSinkPort for PgPriceSink {
    async fn upsert_latest(&self, updates: &[PendingUpdate]) -> Result<u64, SinkError> {
        if updates.is_empty() {
            return Ok(0);
        }
        let c = Columns::from_updates(updates);

        let result = sqlx::query(&self.statement)
            .bind(c.entity_ids)
            .bind(c.ticker_ids)
            .bind(c.sides)
            .bind(c.best_bids)
            .bind(c.best_asks)
            .bind(c.mids)
            .bind(c.spreads)
            .bind(c.last_trades)
            .bind(c.exchange_ts)
            .bind(c.received_at)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                if is_connection_error(&e) {
                    SinkError::ConnectionError {
                        message: e.to_string(),
                    }
                } else {
                    SinkError::WriteFailed {
                        message: e.to_string(),
                    }
                }
            })?;

        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::instrument::{EntityId, TickerId};

    #[test]
    fn statement_guards_on_exchange_timestamp() {
        let sql = upsert_statement("latest_prices");
        assert!(sql.starts_with("INSERT INTO latest_prices"));
        assert!(sql.contains("ON CONFLICT (entity_id)"));
        assert!(sql.ends_with("WHERE latest_prices.exchange_ts <= EXCLUDED.exchange_ts"));
    }

    #[test]
    fn columns_preserve_row_order() {
        let now = Utc::now();
        let updates: Vec<_> = ["e1", "e2"]
            .iter()
            .map(|e| PendingUpdate {
                entity_id: EntityId::new(*e),
                ticker_id: TickerId::new(format!("t-{e}")),
                side: None,
                best_bid: Some(Decimal::ONE),
                best_ask: None,
                mid: None,
                spread: None,
                last_trade: None,
                exchange_ts: now,
                received_at: now,
            })
            .collect();

        let columns = Columns::from_updates(&updates);
        assert_eq!(columns.entity_ids, vec!["e1", "e2"]);
        assert_eq!(columns.ticker_ids, vec!["t-e1", "t-e2"]);
        assert_eq!(columns.best_bids, vec![Some(Decimal::ONE); 2]);
    }
}
