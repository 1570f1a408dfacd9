//! Price Types
//!
//! Ticks are the ephemeral unit that travels from a shard to the
//! aggregator. Pending updates are the per-entity latest value the
//! aggregator holds between flushes.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::instrument::{EntityId, Instrument, TickerId};

/// Raw price observation fields carried by a tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceFields {
    /// Best bid price.
    pub best_bid: Option<Decimal>,
    /// Best ask price.
    pub best_ask: Option<Decimal>,
    /// Last traded price.
    pub last_trade: Option<Decimal>,
}

impl PriceFields {
    /// Create bid/ask fields.
    #[must_use]
    pub const fn quote(best_bid: Decimal, best_ask: Decimal) -> Self {
        Self {
            best_bid: Some(best_bid),
            best_ask: Some(best_ask),
            last_trade: None,
        }
    }

    /// Whether no price field is present.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.best_bid.is_none() && self.best_ask.is_none() && self.last_trade.is_none()
    }

    /// Overlay `newer` on top of `self`, keeping fields `newer` does not carry.
    #[must_use]
    pub fn overlay(self, newer: Self) -> Self {
        Self {
            best_bid: newer.best_bid.or(self.best_bid),
            best_ask: newer.best_ask.or(self.best_ask),
            last_trade: newer.last_trade.or(self.last_trade),
        }
    }
}

/// One price observation for one instrument from the upstream feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tick {
    /// Exchange ticker id.
    pub ticker_id: TickerId,
    /// Observed prices.
    pub prices: PriceFields,
    /// Exchange-side timestamp (falls back to receipt time when absent).
    pub exchange_ts: DateTime<Utc>,
    /// When this worker received the frame.
    pub received_at: DateTime<Utc>,
}

/// Latest derived prices for one entity, pending the next flush.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingUpdate {
    /// Entity the update applies to.
    pub entity_id: EntityId,
    /// Ticker that produced the latest values.
    pub ticker_id: TickerId,
    /// Side metadata of that ticker.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub side: Option<String>,
    /// Best bid price.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub best_bid: Option<Decimal>,
    /// Best ask price.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub best_ask: Option<Decimal>,
    /// Mid price, when both sides are quoted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mid: Option<Decimal>,
    /// Ask minus bid, when both sides are quoted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spread: Option<Decimal>,
    /// Last traded price.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_trade: Option<Decimal>,
    /// Exchange-side timestamp of the latest tick.
    pub exchange_ts: DateTime<Utc>,
    /// Receipt timestamp of the latest tick.
    pub received_at: DateTime<Utc>,
}

impl PendingUpdate {
    /// Derive a pending update from a tick and its resolved instrument.
    #[must_use]
    pub fn derive(instrument: &Instrument, tick: &Tick) -> Self {
        Self::from_fields(instrument, tick, tick.prices)
    }

    /// Apply a newer tick for the same entity.
    ///
    /// A tick from the same ticker overlays only the fields it carries; a
    /// tick from a different ticker replaces the entry.
    pub fn apply(&mut self, instrument: &Instrument, tick: &Tick) {
        let fields = if self.ticker_id == tick.ticker_id {
            self.prices().overlay(tick.prices)
        } else {
            tick.prices
        };
        *self = Self::from_fields(instrument, tick, fields);
    }

    /// Raw price fields of this update.
    #[must_use]
    pub const fn prices(&self) -> PriceFields {
        PriceFields {
            best_bid: self.best_bid,
            best_ask: self.best_ask,
            last_trade: self.last_trade,
        }
    }

    fn from_fields(instrument: &Instrument, tick: &Tick, fields: PriceFields) -> Self {
        let (mid, spread) = match (fields.best_bid, fields.best_ask) {
            (Some(bid), Some(ask)) => (Some((bid + ask) / Decimal::TWO), Some(ask - bid)),
            _ => (None, None),
        };

        Self {
            entity_id: instrument.entity_id.clone(),
            ticker_id: tick.ticker_id.clone(),
            side: instrument.side.clone(),
            best_bid: fields.best_bid,
            best_ask: fields.best_ask,
            mid,
            spread,
            last_trade: fields.last_trade,
            exchange_ts: tick.exchange_ts,
            received_at: tick.received_at,
        }
    }
}

/// A flushed, persisted set of per-entity updates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PriceBatch {
    /// Monotonic per-worker flush sequence.
    pub sequence: u64,
    /// When the batch was snapshotted.
    pub flushed_at: DateTime<Utc>,
    /// One update per entity.
    pub updates: Vec<PendingUpdate>,
}

impl PriceBatch {
    /// Number of entity updates.
    #[must_use]
    pub fn len(&self) -> usize {
        self.updates.len()
    }

    /// Whether the batch carries no updates.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.updates.is_empty()
    }
}
