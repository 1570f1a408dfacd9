//! Shard behavior against a local exchange stub: subscription, keepalive,
//! tick forwarding and reconnect.

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{StubExchange, WAIT, is_subscription};
use price_ingestor::application::ports::SystemClock;
use price_ingestor::domain::instrument::TickerId;
use price_ingestor::domain::sharding::ShardId;
use price_ingestor::infrastructure::exchange::{
    CloseClass, ConnectionShard, ShardConfig, ShardEvent, ShardState, ShardStatusBoard,
};
use rust_decimal::Decimal;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

struct RunningShard {
    events: mpsc::Receiver<ShardEvent>,
    board: Arc<ShardStatusBoard>,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl RunningShard {
    async fn next_event(&mut self) -> ShardEvent {
        tokio::time::timeout(WAIT, self.events.recv())
            .await
            .expect("timed out waiting for a shard event")
            .expect("shard stopped")
    }

    async fn stop(self) {
        self.cancel.cancel();
        tokio::time::timeout(WAIT, self.handle)
            .await
            .expect("shard did not stop")
            .unwrap();
    }
}

fn start(config: ShardConfig, tickers: &[&str]) -> RunningShard {
    start_buffered(config, tickers, 64)
}

fn start_buffered(config: ShardConfig, tickers: &[&str], buffer: usize) -> RunningShard {
    let (tx, events) = mpsc::channel(buffer);
    let board = Arc::new(ShardStatusBoard::new());
    let cancel = CancellationToken::new();
    let shard = ConnectionShard::new(
        ShardId(0),
        tickers.iter().map(|t| TickerId::from(*t)).collect(),
        Arc::new(config),
        Arc::new(SystemClock),
        tx,
        Arc::clone(&board),
        cancel.clone(),
    );
    let handle = tokio::spawn(shard.run());
    RunningShard {
        events,
        board,
        cancel,
        handle,
    }
}

#[tokio::test]
async fn subscribes_with_assigned_tickers() {
    let mut exchange = StubExchange::start().await;
    let mut shard = start(ShardConfig::new(exchange.url()), &["ABC", "DEF"]);

    let (_, text) = exchange.next_text().await;
    let subscription: serde_json::Value = serde_json::from_str(&text).unwrap();
    assert_eq!(subscription["assets_ids"], serde_json::json!(["ABC", "DEF"]));
    assert_eq!(subscription["type"], "market");

    assert!(matches!(shard.next_event().await, ShardEvent::Connected { .. }));
    assert_eq!(shard.board.snapshot()[0].state, ShardState::Connected);

    shard.stop().await;
}

#[tokio::test]
async fn forwards_decoded_ticks() {
    let mut exchange = StubExchange::start().await;
    let mut shard = start(ShardConfig::new(exchange.url()), &["ABC"]);

    let (conn, _) = exchange.next_matching(is_subscription).await;
    assert!(matches!(shard.next_event().await, ShardEvent::Connected { .. }));

    exchange.send(conn, r#"{"status":"subscribed"}"#);
    exchange.send(conn, "not json");
    exchange.send(
        conn,
        r#"{"event_type":"price_change","asset_id":"ABC","best_bid":"0.40","best_ask":"0.42"}"#,
    );

    let ShardEvent::Tick { tick, .. } = shard.next_event().await else {
        panic!("expected a tick");
    };
    assert_eq!(tick.ticker_id.as_str(), "ABC");
    assert_eq!(tick.prices.best_bid, Some(Decimal::new(40, 2)));
    assert_eq!(tick.prices.best_ask, Some(Decimal::new(42, 2)));

    shard.stop().await;
}

#[tokio::test]
async fn sends_keepalives_and_answers_probes() {
    let mut exchange = StubExchange::start().await;
    let mut config = ShardConfig::new(exchange.url());
    config.keepalive.payload = "KEEPALIVE".to_string();
    config.keepalive.probe = "ARE-YOU-THERE".to_string();
    config.keepalive.reply = "HERE".to_string();
    config.keepalive.interval = Duration::from_millis(100);
    let mut shard = start(config, &["ABC"]);

    let (conn, _) = exchange.next_matching(is_subscription).await;
    assert!(matches!(shard.next_event().await, ShardEvent::Connected { .. }));

    exchange.next_matching(|t| t == "KEEPALIVE").await;

    exchange.send(conn, "ARE-YOU-THERE");
    exchange.next_matching(|t| t == "HERE").await;

    shard.stop().await;
}

#[tokio::test]
async fn reconnects_after_exchange_close() {
    let mut exchange = StubExchange::start().await;
    let mut config = ShardConfig::new(exchange.url());
    config.resilience.base_delay = Duration::from_millis(50);
    config.resilience.jitter_factor = 0.0;
    let mut shard = start(config, &["ABC"]);

    let (first, _) = exchange.next_matching(is_subscription).await;
    assert!(matches!(shard.next_event().await, ShardEvent::Connected { .. }));

    exchange.close(first);

    let ShardEvent::Closed { class, delay, .. } = shard.next_event().await else {
        panic!("expected a close");
    };
    assert_eq!(class, CloseClass::Rapid);
    assert_eq!(delay, Duration::from_millis(50));

    let (second, text) = exchange.next_matching(is_subscription).await;
    assert_ne!(first, second);
    assert!(text.contains("ABC"));
    assert!(matches!(shard.next_event().await, ShardEvent::Connected { .. }));
    assert_eq!(shard.board.snapshot()[0].reconnects, 1);

    shard.stop().await;
}

#[tokio::test]
async fn cancel_stops_shard_blocked_on_a_full_event_channel() {
    let mut exchange = StubExchange::start().await;
    // The Connected event fills the only slot and nobody drains it.
    let shard = start_buffered(ShardConfig::new(exchange.url()), &["ABC"], 1);

    let (conn, _) = exchange.next_matching(is_subscription).await;
    exchange.send(conn, r#"{"asset_id":"ABC","best_bid":"0.40","best_ask":"0.42"}"#);
    tokio::time::sleep(Duration::from_millis(200)).await;

    let board = Arc::clone(&shard.board);
    shard.stop().await;
    assert_eq!(board.snapshot()[0].state, ShardState::Closing);
}
