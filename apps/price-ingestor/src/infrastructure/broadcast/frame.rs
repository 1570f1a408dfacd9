//! Batch Frames
//!
//! A flushed batch travels between workers as one or more JSON frames, each
//! below the broadcast channel's payload limit. Frames of one batch share
//! `origin` and `sequence` and are numbered `part` of `parts` (1-based).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::application::ports::BroadcastError;
use crate::domain::pricing::{PendingUpdate, PriceBatch};

/// One broadcast message carrying part of a flushed batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchFrame {
    /// Worker that flushed the batch.
    pub origin: String,
    /// Batch sequence on the origin worker.
    pub sequence: u64,
    /// 1-based frame index.
    pub part: u32,
    /// Frames in the batch.
    pub parts: u32,
    /// When the batch was snapshotted.
    pub flushed_at: DateTime<Utc>,
    /// Entity updates carried by this frame.
    pub updates: Vec<PendingUpdate>,
}

/// A frame together with its wire payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedFrame {
    /// Decoded frame, for local delivery.
    pub frame: BatchFrame,
    /// JSON payload, for the shared channel.
    pub payload: String,
}

/// Split `batch` into frames whose JSON encoding fits in `limit` bytes.
///
/// Updates are packed greedily in batch order. An empty batch yields no
/// frames.
///
/// # Errors
///
/// Returns [`BroadcastError::PayloadTooLarge`] when a single update cannot
/// fit a frame, and [`BroadcastError::SerializationError`] when encoding
/// fails.
pub fn split_batch(
    origin: &str,
    batch: &PriceBatch,
    limit: usize,
) -> Result<Vec<EncodedFrame>, BroadcastError> {
    if batch.is_empty() {
        return Ok(Vec::new());
    }

    // Envelope size with the widest possible part numbers.
    let envelope = encode(&BatchFrame {
        origin: origin.to_string(),
        sequence: batch.sequence,
        part: u32::MAX,
        parts: u32::MAX,
        flushed_at: batch.flushed_at,
        updates: Vec::new(),
    })?
    .len();

    let mut groups: Vec<Vec<PendingUpdate>> = Vec::new();
    let mut current: Vec<PendingUpdate> = Vec::new();
    let mut current_size = envelope;

    for update in &batch.updates {
        let size = encode(update)?.len() + 1;
        if envelope + size > limit {
            return Err(BroadcastError::PayloadTooLarge {
                size: envelope + size,
                limit,
            });
        }
        if current_size + size > limit {
            groups.push(std::mem::take(&mut current));
            current_size = envelope;
        }
        current.push(update.clone());
        current_size += size;
    }
    groups.push(current);

    let parts = u32::try_from(groups.len()).map_err(|_| BroadcastError::SerializationError {
        message: "too many frames".to_string(),
    })?;

    groups
        .into_iter()
        .zip(1..=parts)
        .map(|(updates, part)| {
            let frame = BatchFrame {
                origin: origin.to_string(),
                sequence: batch.sequence,
                part,
                parts,
                flushed_at: batch.flushed_at,
                updates,
            };
            let payload = encode(&frame)?;
            Ok(EncodedFrame { frame, payload })
        })
        .collect()
}

/// Decode a payload received from the shared channel.
///
/// # Errors
///
/// Returns [`BroadcastError::SerializationError`] on malformed payloads.
pub fn decode_frame(payload: &str) -> Result<BatchFrame, BroadcastError> {
    serde_json::from_str(payload).map_err(|e| BroadcastError::SerializationError {
        message: e.to_string(),
    })
}

fn encode<T: Serialize>(value: &T) -> Result<String, BroadcastError> {
    serde_json::to_string(value).map_err(|e| BroadcastError::SerializationError {
        message: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use rust_decimal::Decimal;

    use super::*;
    use crate::domain::instrument::{EntityId, TickerId};

    fn update(i: usize) -> PendingUpdate {
        let now = Utc::now();
        PendingUpdate {
            entity_id: EntityId::new(format!("entity-{i:05}")),
            ticker_id: TickerId::new(format!("ticker-{i:05}")),
            side: Some("yes".to_string()),
            best_bid: Some(Decimal::new(45, 2)),
            best_ask: Some(Decimal::new(47, 2)),
            mid: Some(Decimal::new(46, 2)),
            spread: Some(Decimal::new(2, 2)),
            last_trade: None,
            exchange_ts: now,
            received_at: now,
        }
    }

    fn batch(n: usize) -> PriceBatch {
        PriceBatch {
            sequence: 9,
            flushed_at: Utc::now(),
            updates: (0..n).map(update).collect(),
        }
    }

    #[test]
    fn small_batch_fits_one_frame() {
        let frames = split_batch("w1", &batch(3), 7_500).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].frame.part, 1);
        assert_eq!(frames[0].frame.parts, 1);
        assert_eq!(frames[0].frame.updates.len(), 3);
    }

    #[test]
    fn large_batch_splits_under_limit() {
        let frames = split_batch("w1", &batch(500), 7_500).unwrap();
        assert!(frames.len() > 1);

        let total: usize = frames.iter().map(|f| f.frame.updates.len()).sum();
        assert_eq!(total, 500);

        for (i, encoded) in frames.iter().enumerate() {
            assert!(encoded.payload.len() <= 7_500, "frame {i} is {} bytes", encoded.payload.len());
            assert_eq!(encoded.frame.part as usize, i + 1);
            assert_eq!(encoded.frame.parts as usize, frames.len());
            assert_eq!(decode_frame(&encoded.payload).unwrap(), encoded.frame);
        }
    }

    #[test]
    fn empty_batch_has_no_frames() {
        assert!(split_batch("w1", &batch(0), 7_500).unwrap().is_empty());
    }

    #[test]
    fn oversized_update_is_rejected() {
        let err = split_batch("w1", &batch(1), 64).unwrap_err();
        assert!(matches!(err, BroadcastError::PayloadTooLarge { limit: 64, .. }));
    }

    #[test]
    fn malformed_payload_is_a_serialization_error() {
        assert!(matches!(
            decode_frame("{not json"),
            Err(BroadcastError::SerializationError { .. })
        ));
    }
}
