//! Shard Partitioning
//!
//! Splits the full ticker list into capacity-bounded slices, one per
//! upstream connection, and compares ticker sets independent of order.
//!
//! The first slice always lands on shard 0 (the primary shard); each
//! remaining slice gets its own shard id in order.

use std::collections::BTreeSet;
use std::fmt;

use super::instrument::TickerId;

/// Identifier of one upstream connection within a manager generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ShardId(pub usize);

impl ShardId {
    /// The primary shard.
    pub const PRIMARY: Self = Self(0);
}

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "shard-{}", self.0)
    }
}

/// Ticker slice assigned to one shard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardAssignment {
    /// Shard id.
    pub shard_id: ShardId,
    /// Tickers this shard subscribes to (never more than the capacity).
    pub tickers: Vec<TickerId>,
}

/// Partitioning error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PartitionError {
    /// A zero capacity can hold nothing.
    #[error("shard capacity must be greater than zero")]
    ZeroCapacity,
}

/// Partition tickers into shards of at most `capacity` each.
///
/// Duplicates are removed (first occurrence kept) so a ticker is never
/// subscribed on two connections. An empty list yields no shards.
///
/// # Errors
///
/// Returns [`PartitionError::ZeroCapacity`] when `capacity` is zero.
///
/// # Example
///
/// ```rust
/// use price_ingestor::domain::instrument::TickerId;
/// use price_ingestor::domain::sharding::partition;
///
/// let tickers: Vec<TickerId> = (0..1_200).map(|i| TickerId::new(format!("t{i}"))).collect();
/// let shards = partition(&tickers, 500).unwrap();
/// let sizes: Vec<usize> = shards.iter().map(|s| s.tickers.len()).collect();
/// assert_eq!(sizes, vec![500, 500, 200]);
/// ```
pub fn partition(
    tickers: &[TickerId],
    capacity: usize,
) -> Result<Vec<ShardAssignment>, PartitionError> {
    if capacity == 0 {
        return Err(PartitionError::ZeroCapacity);
    }

    let mut seen = BTreeSet::new();
    let unique: Vec<TickerId> = tickers
        .iter()
        .filter(|t| seen.insert((*t).clone()))
        .cloned()
        .collect();

    Ok(unique
        .chunks(capacity)
        .enumerate()
        .map(|(index, chunk)| ShardAssignment {
            shard_id: ShardId(index),
            tickers: chunk.to_vec(),
        })
        .collect())
}

/// Order-insensitive ticker set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickerSet(BTreeSet<TickerId>);

impl TickerSet {
    /// Create an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of tickers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the set is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Whether the set contains a ticker.
    #[must_use]
    pub fn contains(&self, ticker: &TickerId) -> bool {
        self.0.contains(ticker)
    }

    /// Insert a ticker; returns `true` when it was not present.
    pub fn insert(&mut self, ticker: TickerId) -> bool {
        self.0.insert(ticker)
    }

    /// Add all tickers from `other`.
    pub fn extend(&mut self, other: impl IntoIterator<Item = TickerId>) {
        self.0.extend(other);
    }

    /// Tickers in `self` that are not in `other`.
    #[must_use]
    pub fn difference(&self, other: &Self) -> Vec<TickerId> {
        self.0.difference(&other.0).cloned().collect()
    }

    /// Sorted ticker list.
    #[must_use]
    pub fn to_vec(&self) -> Vec<TickerId> {
        self.0.iter().cloned().collect()
    }

    /// Iterate tickers in sorted order.
    pub fn iter(&self) -> impl Iterator<Item = &TickerId> {
        self.0.iter()
    }
}

impl FromIterator<TickerId> for TickerSet {
    fn from_iter<I: IntoIterator<Item = TickerId>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn tickers(n: usize) -> Vec<TickerId> {
        (0..n).map(|i| TickerId::new(format!("tok-{i:05}"))).collect()
    }

    #[test]
    fn twelve_hundred_at_five_hundred_gives_three_shards() {
        let shards = partition(&tickers(1_200), 500).unwrap();
        let sizes: Vec<_> = shards.iter().map(|s| s.tickers.len()).collect();
        assert_eq!(sizes, vec![500, 500, 200]);
        assert_eq!(shards[0].shard_id, ShardId::PRIMARY);
        assert_eq!(shards[2].shard_id, ShardId(2));
    }

    #[test]
    fn empty_list_yields_no_shards() {
        assert!(partition(&[], 500).unwrap().is_empty());
    }

    #[test]
    fn zero_capacity_is_rejected() {
        assert_eq!(
            partition(&tickers(3), 0).unwrap_err(),
            PartitionError::ZeroCapacity
        );
    }

    #[test]
    fn duplicates_are_subscribed_once() {
        let mut list = tickers(3);
        list.push(TickerId::new("tok-00001"));
        let shards = partition(&list, 10).unwrap();
        assert_eq!(shards.len(), 1);
        assert_eq!(shards[0].tickers.len(), 3);
    }

    #[test]
    fn ticker_set_ignores_order() {
        let a: TickerSet = ["a", "b", "c"].into_iter().map(TickerId::from).collect();
        let b: TickerSet = ["c", "a", "b"].into_iter().map(TickerId::from).collect();
        assert_eq!(a, b);
    }

    #[test]
    fn ticker_set_difference() {
        let old: TickerSet = ["a", "b"].into_iter().map(TickerId::from).collect();
        let new: TickerSet = ["b", "c"].into_iter().map(TickerId::from).collect();
        assert_eq!(new.difference(&old), vec![TickerId::from("c")]);
        assert_eq!(old.difference(&new), vec![TickerId::from("a")]);
    }

    proptest! {
        #[test]
        fn every_shard_respects_capacity(n in 0usize..3_000, capacity in 1usize..700) {
            let list = tickers(n);
            let shards = partition(&list, capacity).unwrap();

            for shard in &shards {
                prop_assert!(shard.tickers.len() <= capacity);
                prop_assert!(!shard.tickers.is_empty());
            }

            let total: usize = shards.iter().map(|s| s.tickers.len()).sum();
            prop_assert_eq!(total, n);
            prop_assert_eq!(shards.len(), n.div_ceil(capacity));
        }
    }
}
