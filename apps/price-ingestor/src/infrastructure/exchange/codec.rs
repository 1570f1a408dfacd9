//! Tick Codec
//!
//! Decodes inbound text frames into [`Tick`]s. Keepalive tokens are filtered
//! out by the shard before a frame reaches the codec.

use chrono::{DateTime, Utc};

use super::messages::FeedMessage;
use crate::domain::pricing::Tick;

/// Codec errors.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// JSON decoding failed.
    #[error("JSON codec error: {0}")]
    Json(#[from] serde_json::Error),

    /// Frame is neither a JSON object nor an array.
    #[error("invalid message format: {0}")]
    InvalidFormat(String),
}

/// JSON codec for the exchange price feed.
#[derive(Debug, Default, Clone, Copy)]
pub struct TickCodec;

impl TickCodec {
    /// Create a codec.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Decode one text frame.
    ///
    /// A frame may hold a single object or an array of objects; each object
    /// may yield zero or more ticks. Objects without an exchange timestamp
    /// are stamped with `received_at`.
    ///
    /// # Errors
    ///
    /// Returns an error when the frame is not valid JSON or does not match
    /// the feed message shape.
    pub fn decode(&self, text: &str, received_at: DateTime<Utc>) -> Result<Vec<Tick>, CodecError> {
        let trimmed = text.trim();

        let messages: Vec<FeedMessage> = if trimmed.starts_with('[') {
            serde_json::from_str(trimmed)?
        } else if trimmed.starts_with('{') {
            vec![serde_json::from_str(trimmed)?]
        } else {
            let preview: String = trimmed.chars().take(50).collect();
            return Err(CodecError::InvalidFormat(format!(
                "expected JSON array or object, got: {preview}..."
            )));
        };

        Ok(messages
            .iter()
            .flat_map(|message| {
                let exchange_ts = message.exchange_ts().unwrap_or(received_at);
                message
                    .price_updates()
                    .into_iter()
                    .map(move |(ticker_id, prices)| Tick {
                        ticker_id,
                        prices,
                        exchange_ts,
                        received_at,
                    })
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use rust_decimal::Decimal;

    use super::*;
    use crate::domain::instrument::TickerId;

    fn dec(value: &str) -> Decimal {
        value.parse().unwrap()
    }

    #[test]
    fn decodes_single_object() {
        let now = Utc::now();
        let ticks = TickCodec::new()
            .decode(
                r#"{"asset_id":"ABC","best_bid":"40","best_ask":"42","timestamp":"1718000000000"}"#,
                now,
            )
            .unwrap();

        assert_eq!(ticks.len(), 1);
        assert_eq!(ticks[0].ticker_id, TickerId::from("ABC"));
        assert_eq!(ticks[0].prices.best_bid, Some(dec("40")));
        assert_eq!(ticks[0].exchange_ts.timestamp_millis(), 1_718_000_000_000);
        assert_eq!(ticks[0].received_at, now);
    }

    #[test]
    fn decodes_array_of_mixed_events() {
        let frame = r#"[
            {"asset_id":"a","last_trade":0.5},
            {"event_type":"book","asset_id":"b","bids":[{"price":"0.3"}],"asks":[]},
            {"event_type":"price_change","price_changes":[{"asset_id":"c","best_ask":"0.9"}]}
        ]"#;
        let ticks = TickCodec::new().decode(frame, Utc::now()).unwrap();
        let tickers: Vec<_> = ticks.iter().map(|t| t.ticker_id.as_str()).collect();
        assert_eq!(tickers, vec!["a", "b", "c"]);
    }

    #[test]
    fn missing_timestamp_falls_back_to_receipt() {
        let now = Utc::now();
        let ticks = TickCodec::new()
            .decode(r#"{"asset_id":"a","best_bid":"1"}"#, now)
            .unwrap();
        assert_eq!(ticks[0].exchange_ts, now);
    }

    #[test]
    fn empty_array_and_control_objects_yield_nothing() {
        let codec = TickCodec::new();
        assert!(codec.decode("[]", Utc::now()).unwrap().is_empty());
        assert!(
            codec
                .decode(r#"{"status":"subscribed"}"#, Utc::now())
                .unwrap()
                .is_empty()
        );
    }

    #[test]
    fn rejects_non_json() {
        let err = TickCodec::new().decode("hello", Utc::now()).unwrap_err();
        assert!(matches!(err, CodecError::InvalidFormat(_)));

        let err = TickCodec::new().decode("{broken", Utc::now()).unwrap_err();
        assert!(matches!(err, CodecError::Json(_)));
    }
}
