use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::application::ports::{CatalogError, CatalogPort};
use crate::domain::instrument::Instrument;

/// Catalog holding a replaceable instrument list.
#[derive(Debug, Default)]
pub struct InMemoryCatalog {
    instruments: RwLock<Vec<Instrument>>,
    unavailable: AtomicBool,
}

impl InMemoryCatalog {
    /// Create a catalog with an initial instrument list.
    #[must_use]
    pub fn new(instruments: Vec<Instrument>) -> Self {
        Self {
            instruments: RwLock::new(instruments),
            unavailable: AtomicBool::new(false),
        }
    }

    /// Replace the active instruments.
    pub fn set(&self, instruments: Vec<Instrument>) {
        *self.instruments.write() = instruments;
    }

    /// Make subsequent queries fail with a connection error.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }
}

#[async_trait]
impl CatalogPort for InMemoryCatalog {
    async fn active_instruments(&self) -> Result<Vec<Instrument>, CatalogError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(CatalogError::ConnectionError {
                message: "catalog unavailable".to_string(),
            });
        }
        Ok(self.instruments.read().clone())
    }
}
