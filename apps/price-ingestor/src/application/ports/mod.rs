//! Port Interfaces
//!
//! Defines the interfaces (ports) for external systems following
//! the Hexagonal Architecture pattern. Infrastructure adapters implement
//! these; application services only ever see the traits.
//!
//! ## Driven Ports (Outbound)
//!
//! - `CatalogPort`: Active `(ticker, entity)` pairs
//! - `PriceSinkPort`: Batched "apply latest values" upsert
//! - `LeaseStorePort`: Create-if-absent-with-TTL lock primitive
//! - `BroadcastChannelPort`: Cross-worker pub/sub topic
//! - `BatchPublisherPort`: Fan-out of persisted batches
//! - `Clock`: Wall-clock time

mod batch_publisher_port;
mod broadcast_channel_port;
mod catalog_port;
mod clock_port;
mod lease_store_port;
mod price_sink_port;

pub use batch_publisher_port::{BatchPublisherPort, NoOpBatchPublisher};
pub use broadcast_channel_port::{BroadcastChannelPort, BroadcastError, FrameStream};
pub use catalog_port::{CatalogError, CatalogPort};
pub use clock_port::{Clock, ManualClock, SystemClock};
pub use lease_store_port::{LeaseError, LeaseStorePort};
pub use price_sink_port::{PriceSinkPort, SinkError};

#[cfg(test)]
pub use batch_publisher_port::MockBatchPublisherPort;
#[cfg(test)]
pub use broadcast_channel_port::MockBroadcastChannelPort;
#[cfg(test)]
pub use catalog_port::MockCatalogPort;
#[cfg(test)]
pub use lease_store_port::MockLeaseStorePort;
#[cfg(test)]
pub use price_sink_port::MockPriceSinkPort;
