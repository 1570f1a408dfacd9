//! In-Memory Adapters
//!
//! Process-local implementations of every driven port. They back the
//! integration tests and single-node runs without Postgres.

mod broadcast;
mod catalog;
mod lease;
mod sink;

pub use broadcast::InMemoryBroadcastChannel;
pub use catalog::InMemoryCatalog;
pub use lease::InMemoryLeaseStore;
pub use sink::InMemoryPriceSink;
