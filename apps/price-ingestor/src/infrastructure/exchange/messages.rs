//! Exchange WebSocket Message Types
//!
//! Wire format types for the upstream price feed.
//!
//! # Outbound
//!
//! One subscription message per connection naming exactly that shard's
//! tickers. Field names and feed type are configurable:
//!
//! ```json
//! {"assets_ids": ["tok-1", "tok-2"], "type": "market"}
//! ```
//!
//! # Inbound
//!
//! A text frame carries a single JSON object or an array of them:
//!
//! ```json
//! {"asset_id": "tok-1", "best_bid": "0.48", "best_ask": "0.52", "timestamp": "1718000000000"}
//! {"event_type": "book", "asset_id": "tok-1", "bids": [{"price": "0.48", "size": "10"}], "asks": [...]}
//! {"event_type": "price_change", "price_changes": [{"asset_id": "tok-1", "best_bid": "0.5", "best_ask": "0.51"}]}
//! {"event_type": "last_trade_price", "asset_id": "tok-1", "price": "0.5"}
//! ```
//!
//! Prices may be JSON strings or numbers. Timestamps are epoch
//! milliseconds as a string or number, or RFC 3339 text.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;

use crate::domain::instrument::TickerId;
use crate::domain::pricing::PriceFields;

// =============================================================================
// Outbound
// =============================================================================

/// Layout of the subscription message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionFormat {
    /// Field carrying the ticker list.
    pub tickers_field: String,
    /// Field carrying the feed type.
    pub feed_type_field: String,
    /// Feed type value.
    pub feed_type: String,
}

impl Default for SubscriptionFormat {
    fn default() -> Self {
        Self {
            tickers_field: "assets_ids".to_string(),
            feed_type_field: "type".to_string(),
            feed_type: "market".to_string(),
        }
    }
}

impl SubscriptionFormat {
    /// Render the subscription message for `tickers`.
    #[must_use]
    pub fn render(&self, tickers: &[TickerId]) -> String {
        let mut message = serde_json::Map::with_capacity(2);
        message.insert(
            self.tickers_field.clone(),
            serde_json::Value::Array(
                tickers
                    .iter()
                    .map(|t| serde_json::Value::String(t.as_str().to_string()))
                    .collect(),
            ),
        );
        message.insert(
            self.feed_type_field.clone(),
            serde_json::Value::String(self.feed_type.clone()),
        );
        serde_json::Value::Object(message).to_string()
    }
}

// =============================================================================
// Inbound
// =============================================================================

/// Inbound event discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// Full order book snapshot.
    Book,
    /// One or more top-of-book changes.
    PriceChange,
    /// Last traded price.
    LastTradePrice,
    /// Anything else (tick size changes, acknowledgements).
    #[serde(other)]
    Other,
}

/// One price level of a book snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct BookLevel {
    /// Level price.
    pub price: Decimal,
    /// Resting size.
    #[serde(default)]
    pub size: Option<Decimal>,
}

/// One entry of a `price_changes` envelope.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PriceChange {
    /// Ticker; falls back to the envelope's ticker when absent.
    #[serde(default, alias = "ticker_id")]
    pub asset_id: Option<String>,
    /// New best bid.
    #[serde(default)]
    pub best_bid: Option<Decimal>,
    /// New best ask.
    #[serde(default)]
    pub best_ask: Option<Decimal>,
}

/// Exchange timestamp as sent on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum WireTimestamp {
    /// Epoch milliseconds.
    Millis(i64),
    /// Epoch milliseconds or RFC 3339 as text.
    Text(String),
}

impl WireTimestamp {
    /// Convert to UTC, `None` when unparseable.
    #[must_use]
    pub fn to_datetime(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Millis(ms) => DateTime::from_timestamp_millis(*ms),
            Self::Text(text) => text.trim().parse::<i64>().map_or_else(
                |_| {
                    DateTime::parse_from_rfc3339(text.trim())
                        .ok()
                        .map(|dt| dt.with_timezone(&Utc))
                },
                DateTime::from_timestamp_millis,
            ),
        }
    }
}

/// One inbound feed object.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct FeedMessage {
    /// Event discriminator, absent on plain ticks.
    #[serde(default)]
    pub event_type: Option<EventType>,
    /// Ticker the message is about.
    #[serde(default, alias = "ticker_id")]
    pub asset_id: Option<String>,
    /// Best bid.
    #[serde(default)]
    pub best_bid: Option<Decimal>,
    /// Best ask.
    #[serde(default)]
    pub best_ask: Option<Decimal>,
    /// Last traded price.
    #[serde(default)]
    pub last_trade: Option<Decimal>,
    /// Trade price of a `last_trade_price` event.
    #[serde(default)]
    pub price: Option<Decimal>,
    /// Book bids.
    #[serde(default)]
    pub bids: Vec<BookLevel>,
    /// Book asks.
    #[serde(default)]
    pub asks: Vec<BookLevel>,
    /// Batched top-of-book changes.
    #[serde(default)]
    pub price_changes: Vec<PriceChange>,
    /// Exchange timestamp.
    #[serde(default)]
    pub timestamp: Option<WireTimestamp>,
}

impl FeedMessage {
    /// Per-ticker price fields carried by this message.
    ///
    /// Messages without a ticker or without any price are skipped.
    #[must_use]
    pub fn price_updates(&self) -> Vec<(TickerId, PriceFields)> {
        match self.event_type {
            Some(EventType::Book) => self.book_update().into_iter().collect(),
            Some(EventType::PriceChange) => self.change_updates(),
            Some(EventType::LastTradePrice) => self
                .ticker()
                .zip(self.price.or(self.last_trade))
                .map(|(ticker, price)| {
                    (
                        ticker,
                        PriceFields {
                            last_trade: Some(price),
                            ..PriceFields::default()
                        },
                    )
                })
                .into_iter()
                .collect(),
            Some(EventType::Other) => Vec::new(),
            None if !self.price_changes.is_empty() => self.change_updates(),
            None => self.plain_update().into_iter().collect(),
        }
    }

    /// Exchange timestamp, if present and valid.
    #[must_use]
    pub fn exchange_ts(&self) -> Option<DateTime<Utc>> {
        self.timestamp.as_ref().and_then(WireTimestamp::to_datetime)
    }

    fn ticker(&self) -> Option<TickerId> {
        self.asset_id.as_deref().map(TickerId::from)
    }

    fn plain_update(&self) -> Option<(TickerId, PriceFields)> {
        let fields = PriceFields {
            best_bid: self.best_bid,
            best_ask: self.best_ask,
            last_trade: self.last_trade,
        };
        let ticker = self.ticker()?;
        (!fields.is_empty()).then_some((ticker, fields))
    }

    /// Best bid is the highest bid, best ask the lowest ask.
    fn book_update(&self) -> Option<(TickerId, PriceFields)> {
        let fields = PriceFields {
            best_bid: self.bids.iter().map(|l| l.price).max(),
            best_ask: self.asks.iter().map(|l| l.price).min(),
            last_trade: None,
        };
        let ticker = self.ticker()?;
        (!fields.is_empty()).then_some((ticker, fields))
    }

    fn change_updates(&self) -> Vec<(TickerId, PriceFields)> {
        self.price_changes
            .iter()
            .filter_map(|change| {
                let ticker = change
                    .asset_id
                    .as_deref()
                    .map(TickerId::from)
                    .or_else(|| self.ticker())?;
                let fields = PriceFields {
                    best_bid: change.best_bid,
                    best_ask: change.best_ask,
                    last_trade: None,
                };
                (!fields.is_empty()).then_some((ticker, fields))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dec(value: &str) -> Decimal {
        value.parse().unwrap()
    }

    #[test]
    fn subscription_uses_configured_fields() {
        let format = SubscriptionFormat {
            tickers_field: "markets".to_string(),
            feed_type_field: "channel".to_string(),
            feed_type: "prices".to_string(),
        };
        let rendered = format.render(&[TickerId::from("a"), TickerId::from("b")]);
        let value: serde_json::Value = serde_json::from_str(&rendered).unwrap();
        assert_eq!(value["markets"], serde_json::json!(["a", "b"]));
        assert_eq!(value["channel"], "prices");
    }

    #[test]
    fn default_subscription_layout() {
        let rendered = SubscriptionFormat::default().render(&[TickerId::from("x")]);
        let value: serde_json::Value = serde_json::from_str(&rendered).unwrap();
        assert_eq!(value["assets_ids"], serde_json::json!(["x"]));
        assert_eq!(value["type"], "market");
    }

    #[test]
    fn book_picks_best_levels() {
        let msg: FeedMessage = serde_json::from_str(
            r#"{"event_type":"book","asset_id":"t1",
                "bids":[{"price":"0.40","size":"5"},{"price":"0.47","size":"1"}],
                "asks":[{"price":"0.55","size":"2"},{"price":"0.52","size":"9"}]}"#,
        )
        .unwrap();
        let updates = msg.price_updates();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].1.best_bid, Some(dec("0.47")));
        assert_eq!(updates[0].1.best_ask, Some(dec("0.52")));
    }

    #[test]
    fn price_change_entries_fall_back_to_envelope_ticker() {
        let msg: FeedMessage = serde_json::from_str(
            r#"{"event_type":"price_change","asset_id":"t0","price_changes":[
                {"asset_id":"t1","best_bid":"0.5","best_ask":"0.6"},
                {"best_bid":"0.1"},
                {"asset_id":"t2"}]}"#,
        )
        .unwrap();
        let updates = msg.price_updates();
        let tickers: Vec<_> = updates.iter().map(|(t, _)| t.as_str()).collect();
        assert_eq!(tickers, vec!["t1", "t0"]);
    }

    #[test]
    fn last_trade_price_event() {
        let msg: FeedMessage = serde_json::from_str(
            r#"{"event_type":"last_trade_price","asset_id":"t1","price":0.51}"#,
        )
        .unwrap();
        let updates = msg.price_updates();
        assert_eq!(updates[0].1.last_trade, Some(dec("0.51")));
        assert!(updates[0].1.best_bid.is_none());
    }

    #[test]
    fn unknown_events_carry_no_prices() {
        let msg: FeedMessage =
            serde_json::from_str(r#"{"event_type":"tick_size_change","asset_id":"t1"}"#).unwrap();
        assert!(msg.price_updates().is_empty());
    }

    #[test]
    fn timestamps_accept_numbers_and_text() {
        let expected = DateTime::from_timestamp_millis(1_718_000_000_000).unwrap();
        assert_eq!(
            WireTimestamp::Millis(1_718_000_000_000).to_datetime(),
            Some(expected)
        );
        assert_eq!(
            WireTimestamp::Text("1718000000000".to_string()).to_datetime(),
            Some(expected)
        );
        assert!(
            WireTimestamp::Text("2024-06-10T06:13:20Z".to_string())
                .to_datetime()
                .is_some()
        );
        assert!(WireTimestamp::Text("soon".to_string()).to_datetime().is_none());
    }
}
