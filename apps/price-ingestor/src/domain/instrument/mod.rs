//! Instrument Registry
//!
//! Maps exchange ticker ids to internal entity ids. The registry holds an
//! immutable snapshot behind an `Arc` and replaces it wholesale on refresh,
//! so a reader either sees the old map or the new one, never a mix.
//!
//! # Invariants
//!
//! - A ticker maps to at most one entity. When a catalog load contains the
//!   same ticker for two entities, the first pair wins and the conflict is
//!   reported in the build result.
//! - The reverse index (`entity → tickers`) is always derived from the same
//!   pairs as the forward index.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

// =============================================================================
// Identifiers
// =============================================================================

/// Exchange-addressable instrument id (ticker / token id).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TickerId(String);

impl TickerId {
    /// Create a ticker id.
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Borrow the raw id.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TickerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TickerId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Internal domain entity id (e.g. a game or market) that instruments quote against.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(String);

impl EntityId {
    /// Create an entity id.
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Borrow the raw id.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EntityId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// One tradable instrument as returned by the catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instrument {
    /// Exchange ticker id.
    pub ticker_id: TickerId,
    /// Entity the ticker quotes against.
    pub entity_id: EntityId,
    /// Side metadata (e.g. `home`, `away`, `yes`), if the catalog provides it.
    pub side: Option<String>,
}

impl Instrument {
    /// Create an instrument without side metadata.
    #[must_use]
    pub fn new(ticker_id: impl Into<String>, entity_id: impl Into<String>) -> Self {
        Self {
            ticker_id: TickerId::new(ticker_id),
            entity_id: EntityId::new(entity_id),
            side: None,
        }
    }

    /// Attach side metadata.
    #[must_use]
    pub fn with_side(mut self, side: impl Into<String>) -> Self {
        self.side = Some(side.into());
        self
    }
}

// =============================================================================
// Snapshot
// =============================================================================

/// Immutable view of the ticker → entity mapping at one point in time.
#[derive(Debug, Default)]
pub struct RegistrySnapshot {
    by_ticker: HashMap<TickerId, Instrument>,
    by_entity: HashMap<EntityId, BTreeSet<TickerId>>,
    version: u64,
    loaded_at: Option<DateTime<Utc>>,
}

/// Result of building a snapshot from catalog rows.
#[derive(Debug)]
pub struct SnapshotBuild {
    /// The built snapshot.
    pub snapshot: RegistrySnapshot,
    /// Tickers that appeared with more than one entity id.
    pub conflicts: Vec<TickerId>,
}

impl RegistrySnapshot {
    /// Build a snapshot from catalog rows.
    #[must_use]
    pub fn build(
        instruments: impl IntoIterator<Item = Instrument>,
        version: u64,
        loaded_at: DateTime<Utc>,
    ) -> SnapshotBuild {
        let mut by_ticker: HashMap<TickerId, Instrument> = HashMap::new();
        let mut conflicts = Vec::new();

        for instrument in instruments {
            match by_ticker.get(&instrument.ticker_id) {
                Some(existing) if existing.entity_id != instrument.entity_id => {
                    conflicts.push(instrument.ticker_id.clone());
                }
                Some(_) => {}
                None => {
                    by_ticker.insert(instrument.ticker_id.clone(), instrument);
                }
            }
        }

        let mut by_entity: HashMap<EntityId, BTreeSet<TickerId>> = HashMap::new();
        for instrument in by_ticker.values() {
            by_entity
                .entry(instrument.entity_id.clone())
                .or_default()
                .insert(instrument.ticker_id.clone());
        }

        SnapshotBuild {
            snapshot: Self {
                by_ticker,
                by_entity,
                version,
                loaded_at: Some(loaded_at),
            },
            conflicts,
        }
    }

    /// Resolve a ticker to its instrument.
    #[must_use]
    pub fn instrument(&self, ticker: &TickerId) -> Option<&Instrument> {
        self.by_ticker.get(ticker)
    }

    /// Resolve a ticker to its entity id.
    #[must_use]
    pub fn lookup(&self, ticker: &TickerId) -> Option<&EntityId> {
        self.by_ticker.get(ticker).map(|i| &i.entity_id)
    }

    /// Tickers quoting against an entity.
    #[must_use]
    pub fn tickers_for_entity(&self, entity: &EntityId) -> BTreeSet<TickerId> {
        self.by_entity.get(entity).cloned().unwrap_or_default()
    }

    /// All tickers, sorted.
    #[must_use]
    pub fn all_tickers(&self) -> Vec<TickerId> {
        let mut tickers: Vec<_> = self.by_ticker.keys().cloned().collect();
        tickers.sort();
        tickers
    }

    /// Number of mapped tickers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.by_ticker.len()
    }

    /// Whether the snapshot is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_ticker.is_empty()
    }

    /// Number of distinct entities.
    #[must_use]
    pub fn entity_count(&self) -> usize {
        self.by_entity.len()
    }

    /// Monotonic snapshot version (0 = never loaded).
    #[must_use]
    pub const fn version(&self) -> u64 {
        self.version
    }

    /// When this snapshot was loaded from the catalog.
    #[must_use]
    pub const fn loaded_at(&self) -> Option<DateTime<Utc>> {
        self.loaded_at
    }
}

/// Ticker changes between two snapshots.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistryDiff {
    /// Tickers present only in the new snapshot.
    pub added: BTreeSet<TickerId>,
    /// Tickers present only in the old snapshot.
    pub removed: BTreeSet<TickerId>,
}

impl RegistryDiff {
    /// Whether the ticker set is unchanged.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }

    fn between(old: &RegistrySnapshot, new: &RegistrySnapshot) -> Self {
        let added = new
            .by_ticker
            .keys()
            .filter(|t| !old.by_ticker.contains_key(*t))
            .cloned()
            .collect();
        let removed = old
            .by_ticker
            .keys()
            .filter(|t| !new.by_ticker.contains_key(*t))
            .cloned()
            .collect();
        Self { added, removed }
    }
}

// =============================================================================
// Registry
// =============================================================================

/// Shared ticker → entity registry with atomic snapshot replacement.
///
/// # Example
///
/// ```rust
/// use chrono::Utc;
/// use price_ingestor::domain::instrument::{Instrument, InstrumentRegistry, TickerId};
///
/// let registry = InstrumentRegistry::new();
/// registry.replace(vec![Instrument::new("tok-1", "game-7")], Utc::now());
///
/// let entity = registry.lookup(&TickerId::from("tok-1")).unwrap();
/// assert_eq!(entity.as_str(), "game-7");
/// ```
#[derive(Debug, Default)]
pub struct InstrumentRegistry {
    current: RwLock<Arc<RegistrySnapshot>>,
}

impl InstrumentRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the mapping with a freshly loaded set of instruments.
    ///
    /// Returns the ticker diff against the previous snapshot and the tickers
    /// that were rejected as conflicting.
    pub fn replace(
        &self,
        instruments: impl IntoIterator<Item = Instrument>,
        loaded_at: DateTime<Utc>,
    ) -> (RegistryDiff, Vec<TickerId>) {
        let next_version = self.current.read().version() + 1;
        let SnapshotBuild {
            snapshot,
            conflicts,
        } = RegistrySnapshot::build(instruments, next_version, loaded_at);
        let snapshot = Arc::new(snapshot);

        let previous = {
            let mut guard = self.current.write();
            std::mem::replace(&mut *guard, Arc::clone(&snapshot))
        };

        (RegistryDiff::between(&previous, &snapshot), conflicts)
    }

    /// Current snapshot (cheap `Arc` clone).
    #[must_use]
    pub fn snapshot(&self) -> Arc<RegistrySnapshot> {
        Arc::clone(&self.current.read())
    }

    /// Resolve a ticker to its entity id.
    #[must_use]
    pub fn lookup(&self, ticker: &TickerId) -> Option<EntityId> {
        self.current.read().lookup(ticker).cloned()
    }

    /// Resolve a ticker to its full instrument record.
    #[must_use]
    pub fn instrument(&self, ticker: &TickerId) -> Option<Instrument> {
        self.current.read().instrument(ticker).cloned()
    }

    /// Tickers quoting against an entity.
    #[must_use]
    pub fn tickers_for_entity(&self, entity: &EntityId) -> BTreeSet<TickerId> {
        self.current.read().tickers_for_entity(entity)
    }

    /// All tickers, sorted.
    #[must_use]
    pub fn all_tickers(&self) -> Vec<TickerId> {
        self.current.read().all_tickers()
    }

    /// Current snapshot version.
    #[must_use]
    pub fn version(&self) -> u64 {
        self.current.read().version()
    }
}

// =============================================================================
// Tests
// =============================================================================
