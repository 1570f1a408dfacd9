//! Leader ingestion end to end: exchange stub → shard → aggregator →
//! sink → local hub and follower relay.

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use common::{StubExchange, WAIT, is_subscription};
use price_ingestor::application::ports::{Clock, SystemClock};
use price_ingestor::application::services::{
    AggregatorConfig, LeaderConfig, LeaderCoordinator, RegistryRefresher, UpdateAggregator,
};
use price_ingestor::domain::instrument::{EntityId, Instrument, InstrumentRegistry};
use price_ingestor::domain::leadership::{LeaseTiming, Role, WorkerId};
use price_ingestor::infrastructure::broadcast::{
    BatchFrame, BroadcastHub, BroadcastPublisher, FollowerRelay,
};
use price_ingestor::infrastructure::exchange::{ManagerConfig, ShardConfig};
use price_ingestor::infrastructure::memory::{
    InMemoryBroadcastChannel, InMemoryCatalog, InMemoryLeaseStore, InMemoryPriceSink,
};
use price_ingestor::infrastructure::runtime::{IngestionRuntime, RuntimeConfig, RuntimeDeps};
use rust_decimal::Decimal;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

async fn frame_with_bid(
    rx: &mut broadcast::Receiver<Arc<BatchFrame>>,
    bid: Decimal,
) -> Arc<BatchFrame> {
    tokio::time::timeout(WAIT, async {
        loop {
            let frame = rx.recv().await.unwrap();
            if frame.updates.iter().any(|u| u.best_bid == Some(bid)) {
                return frame;
            }
        }
    })
    .await
    .expect("no frame carried the expected bid")
}

#[tokio::test]
async fn two_ticks_in_one_window_persist_one_record() {
    let mut exchange = StubExchange::start().await;
    let shutdown = CancellationToken::new();
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    // Registry
    let registry = Arc::new(InstrumentRegistry::new());
    let catalog = Arc::new(InMemoryCatalog::new(vec![
        Instrument::new("ABC", "entity-abc").with_side("yes"),
    ]));
    let refresher = RegistryRefresher::new(
        catalog,
        Arc::clone(&registry),
        Arc::clone(&clock),
        Duration::from_secs(60),
    );
    refresher.refresh().await.unwrap();

    // Fan-out: leader hub plus a follower relaying from the shared channel
    let channel = Arc::new(InMemoryBroadcastChannel::new(7_500));
    let leader_hub = Arc::new(BroadcastHub::new(64));
    let follower_hub = Arc::new(BroadcastHub::new(64));
    let mut leader_rx = leader_hub.subscribe();
    let mut follower_rx = follower_hub.subscribe();
    tokio::spawn(
        FollowerRelay::new(WorkerId::new("follower"), follower_hub, channel.clone())
            .run(shutdown.child_token()),
    );
    tokio::time::timeout(WAIT, async {
        while channel.subscriber_count() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    // Leader side
    let sink = Arc::new(InMemoryPriceSink::new());
    let aggregator = Arc::new(UpdateAggregator::new(
        AggregatorConfig {
            flush_interval: Duration::from_millis(500),
            start_offset: Duration::from_millis(500),
            max_pending: 100,
        },
        Arc::clone(&registry),
        sink.clone(),
        Arc::new(BroadcastPublisher::new(
            WorkerId::new("leader"),
            Arc::clone(&leader_hub),
            channel.clone(),
        )),
        Arc::clone(&clock),
    ));
    let runtime = Arc::new(IngestionRuntime::new(
        RuntimeConfig {
            manager: ManagerConfig {
                debounce: Duration::from_millis(10),
                settle: Duration::from_millis(10),
                ..ManagerConfig::default()
            },
            shard: Arc::new(ShardConfig::new(exchange.url())),
            event_buffer: 64,
        },
        RuntimeDeps {
            worker_id: WorkerId::new("leader"),
            registry,
            aggregator,
            hub: Arc::clone(&leader_hub),
            channel: channel.clone(),
            clock,
            refreshes: refresher.subscribe(),
        },
        shutdown.clone(),
    ));
    let coordinator = Arc::new(LeaderCoordinator::new(
        LeaderConfig {
            lease_key: "ingest".to_string(),
            worker_id: WorkerId::new("leader"),
            timing: LeaseTiming::default(),
        },
        Arc::new(InMemoryLeaseStore::new()),
        runtime.clone(),
    ));
    let coordinator_task = tokio::spawn(Arc::clone(&coordinator).run(shutdown.clone()));

    // The leader subscribes upstream with the registered ticker.
    let (conn, subscription) = exchange.next_matching(is_subscription).await;
    assert!(subscription.contains("ABC"));
    assert_eq!(coordinator.role(), Role::Leader);

    exchange.send(conn, r#"{"asset_id":"ABC","best_bid":"40","best_ask":"42"}"#);
    exchange.send(conn, r#"{"asset_id":"ABC","best_bid":"41","best_ask":"43"}"#);

    let published = frame_with_bid(&mut leader_rx, Decimal::from(41)).await;
    let relayed = frame_with_bid(&mut follower_rx, Decimal::from(41)).await;
    assert_eq!(published.origin, "leader");
    assert_eq!(relayed.updates, published.updates);

    let entity = EntityId::new("entity-abc");
    assert_eq!(sink.len(), 1);
    let stored = sink.latest(&entity).unwrap();
    assert_eq!(stored.best_bid, Some(Decimal::from(41)));
    assert_eq!(stored.best_ask, Some(Decimal::from(43)));
    assert_eq!(stored.side.as_deref(), Some("yes"));
    for batch in sink.batches() {
        assert!(batch.iter().filter(|u| u.entity_id == entity).count() <= 1);
    }
    assert!(stored.received_at <= Utc::now());

    shutdown.cancel();
    tokio::time::timeout(WAIT, coordinator_task)
        .await
        .expect("coordinator did not stop")
        .unwrap();
    assert!(!runtime.is_leading());
}
