use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::application::ports::{PriceSinkPort, SinkError};
use crate::domain::instrument::EntityId;
use crate::domain::pricing::PendingUpdate;

/// Price store keyed by entity.
///
/// An update replaces the stored row only when its exchange timestamp is not
/// older than the stored one, so replaying a batch leaves the store
/// unchanged.
#[derive(Debug, Default)]
pub struct InMemoryPriceSink {
    rows: Mutex<HashMap<EntityId, PendingUpdate>>,
    batches: Mutex<Vec<Vec<PendingUpdate>>>,
    failures: AtomicUsize,
}

impl InMemoryPriceSink {
    /// Create an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `count` upserts.
    pub fn fail_next(&self, count: usize) {
        self.failures.store(count, Ordering::SeqCst);
    }

    /// Stored row for `entity`.
    #[must_use]
    pub fn latest(&self, entity: &EntityId) -> Option<PendingUpdate> {
        self.rows.lock().get(entity).cloned()
    }

    /// Stored rows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.lock().len()
    }

    /// Whether nothing has been stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.lock().is_empty()
    }

    /// Every batch accepted so far, in order.
    #[must_use]
    pub fn batches(&self) -> Vec<Vec<PendingUpdate>> {
        self.batches.lock().clone()
    }
}

#[async_trait]
impl PriceSinkPort for InMemoryPriceSink {
    async fn upsert_latest(&self, updates: &[PendingUpdate]) -> Result<u64, SinkError> {
        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::SeqCst);
            return Err(SinkError::WriteFailed {
                message: "injected failure".to_string(),
            });
        }

        let mut applied = 0_u64;
        {
            let mut rows = self.rows.lock();
            for update in updates {
                let newer = rows
                    .get(&update.entity_id)
                    .is_none_or(|existing| existing.exchange_ts <= update.exchange_ts);
                if newer {
                    rows.insert(update.entity_id.clone(), update.clone());
                    applied += 1;
                }
            }
        }
        self.batches.lock().push(updates.to_vec());
        Ok(applied)
    }
}
