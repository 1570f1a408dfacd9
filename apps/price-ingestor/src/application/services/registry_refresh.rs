//! Registry Refresher
//!
//! Periodically reloads the active instrument set from the catalog and swaps
//! it into the [`InstrumentRegistry`]. A failed load keeps serving the
//! previous snapshot and retries on the next interval. Every successful
//! swap is published on a `watch` channel so the leader can re-target its
//! shards.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::application::ports::{CatalogError, CatalogPort, Clock};
use crate::domain::instrument::InstrumentRegistry;

/// Summary of one successful refresh.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RefreshReport {
    /// New snapshot version.
    pub version: u64,
    /// Mapped tickers after the swap.
    pub tickers: usize,
    /// Tickers added since the previous snapshot.
    pub added: usize,
    /// Tickers pruned since the previous snapshot.
    pub removed: usize,
    /// Tickers rejected because they mapped to two entities.
    pub conflicts: usize,
}

/// Catalog → registry refresh loop.
pub struct RegistryRefresher {
    catalog: Arc<dyn CatalogPort>,
    registry: Arc<InstrumentRegistry>,
    clock: Arc<dyn Clock>,
    interval: Duration,
    updates: watch::Sender<RefreshReport>,
}

impl RegistryRefresher {
    /// Create a refresher.
    #[must_use]
    pub fn new(
        catalog: Arc<dyn CatalogPort>,
        registry: Arc<InstrumentRegistry>,
        clock: Arc<dyn Clock>,
        interval: Duration,
    ) -> Self {
        let (updates, _) = watch::channel(RefreshReport::default());
        Self {
            catalog,
            registry,
            clock,
            interval,
            updates,
        }
    }

    /// Observe successful refreshes.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<RefreshReport> {
        self.updates.subscribe()
    }

    /// Load the catalog and swap the registry snapshot.
    ///
    /// # Errors
    ///
    /// Returns the catalog error; the registry is left untouched.
    pub async fn refresh(&self) -> Result<RefreshReport, CatalogError> {
        let instruments = self.catalog.active_instruments().await?;
        let (diff, conflicts) = self.registry.replace(instruments, self.clock.now());

        if !conflicts.is_empty() {
            tracing::warn!(
                count = conflicts.len(),
                tickers = ?conflicts,
                "Catalog maps tickers to more than one entity; kept first pair"
            );
        }

        let snapshot = self.registry.snapshot();
        let report = RefreshReport {
            version: snapshot.version(),
            tickers: snapshot.len(),
            added: diff.added.len(),
            removed: diff.removed.len(),
            conflicts: conflicts.len(),
        };

        tracing::info!(
            version = report.version,
            tickers = report.tickers,
            entities = snapshot.entity_count(),
            added = report.added,
            removed = report.removed,
            "Instrument registry refreshed"
        );

        self.updates.send_replace(report.clone());
        Ok(report)
    }

    /// Refresh immediately, then on every interval until cancelled.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = interval.tick() => {
                    if let Err(e) = self.refresh().await {
                        tracing::warn!(
                            error = %e,
                            version = self.registry.version(),
                            "Registry refresh failed, serving previous snapshot"
                        );
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::application::ports::{ManualClock, MockCatalogPort};
    use crate::domain::instrument::{Instrument, TickerId};

    fn refresher(catalog: MockCatalogPort) -> (RegistryRefresher, Arc<InstrumentRegistry>) {
        let registry = Arc::new(InstrumentRegistry::new());
        let refresher = RegistryRefresher::new(
            Arc::new(catalog),
            Arc::clone(&registry),
            Arc::new(ManualClock::new(Utc::now())),
            Duration::from_secs(60),
        );
        (refresher, registry)
    }

    #[tokio::test]
    async fn refresh_swaps_snapshot_and_notifies() {
        let mut catalog = MockCatalogPort::new();
        catalog.expect_active_instruments().returning(|| {
            Ok(vec![
                Instrument::new("a", "e1"),
                Instrument::new("b", "e1"),
                Instrument::new("a", "e2"),
            ])
        });
        let (refresher, registry) = refresher(catalog);
        let mut updates = refresher.subscribe();

        let report = refresher.refresh().await.unwrap();
        assert_eq!(report.version, 1);
        assert_eq!(report.tickers, 2);
        assert_eq!(report.added, 2);
        assert_eq!(report.conflicts, 1);
        assert_eq!(registry.lookup(&TickerId::from("a")).unwrap().as_str(), "e1");

        assert!(updates.has_changed().unwrap());
        assert_eq!(updates.borrow_and_update().version, 1);
    }

    #[tokio::test]
    async fn failed_refresh_keeps_previous_snapshot() {
        let mut catalog = MockCatalogPort::new();
        let mut calls = 0;
        catalog.expect_active_instruments().returning(move || {
            calls += 1;
            if calls == 1 {
                Ok(vec![Instrument::new("a", "e1")])
            } else {
                Err(CatalogError::QueryFailed {
                    message: "timeout".to_string(),
                })
            }
        });
        let (refresher, registry) = refresher(catalog);

        refresher.refresh().await.unwrap();
        assert!(refresher.refresh().await.is_err());
        assert_eq!(registry.version(), 1);
        assert!(registry.lookup(&TickerId::from("a")).is_some());
    }

    #[tokio::test]
    async fn removed_tickers_are_pruned() {
        let mut catalog = MockCatalogPort::new();
        let mut calls = 0;
        catalog.expect_active_instruments().returning(move || {
            calls += 1;
            if calls == 1 {
                Ok(vec![Instrument::new("a", "e1"), Instrument::new("b", "e2")])
            } else {
                Ok(vec![Instrument::new("b", "e2")])
            }
        });
        let (refresher, registry) = refresher(catalog);

        refresher.refresh().await.unwrap();
        let report = refresher.refresh().await.unwrap();
        assert_eq!(report.removed, 1);
        assert!(registry.lookup(&TickerId::from("a")).is_none());
    }
}
