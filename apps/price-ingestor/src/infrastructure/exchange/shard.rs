//! Connection Shard
//!
//! One upstream WebSocket holding at most `capacity` tickers. A shard owns
//! its reconnect state and keepalive timer; transport errors are recovered
//! here and never cross the shard boundary. Everything the rest of the
//! system needs to know leaves through one bounded [`ShardEvent`] channel.
//!
//! # Session lifecycle
//!
//! 1. Connect (bounded by the connect timeout).
//! 2. Send the subscription message for exactly this shard's tickers.
//! 3. Only then start the keepalive manager.
//! 4. Stream until cancelled or the connection drops.
//!
//! An explicit close (cancellation) never reconnects. Any other end of the
//! session is classified by [`ReconnectPolicy`] and retried after its delay,
//! resubscribing the same ticker set.

use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use super::codec::TickCodec;
use super::keepalive::{
    KeepaliveConfig, KeepaliveEvent, KeepaliveFrame, KeepaliveManager, KeepaliveState,
};
use super::messages::SubscriptionFormat;
use super::reconnect::{CloseClass, ReconnectPolicy, ResilienceConfig};
use super::state::{ShardState, ShardStateMachine, TransitionError};
use super::status::ShardStatusBoard;
use crate::application::ports::Clock;
use crate::domain::instrument::TickerId;
use crate::domain::pricing::Tick;
use crate::domain::sharding::ShardId;
use crate::infrastructure::metrics;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsWrite = SplitSink<WsStream, Message>;
type WsRead = SplitStream<WsStream>;

// =============================================================================
// Error Type
// =============================================================================

/// Reasons a shard session ended.
#[derive(Debug, thiserror::Error)]
pub enum ShardError {
    /// The connect attempt did not finish in time.
    #[error("connect timed out after {0:?}")]
    ConnectTimeout(Duration),

    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// The exchange closed the connection.
    #[error("connection closed by exchange")]
    ConnectionClosed,

    /// No inbound frame within the idle timeout.
    #[error("idle timeout")]
    IdleTimeout,

    /// The keepalive manager stopped unexpectedly.
    #[error("keepalive manager stopped")]
    KeepaliveStopped,

    /// State machine rejected a transition.
    #[error(transparent)]
    Transition(#[from] TransitionError),

    /// Nobody is consuming shard events any more.
    #[error("shard event channel closed")]
    ChannelClosed,

    /// The shard was cancelled while waiting on I/O or the event channel.
    #[error("shard cancelled")]
    Cancelled,
}

// =============================================================================
// Events
// =============================================================================

/// Everything a shard reports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShardEvent {
    /// Subscription handshake completed.
    Connected {
        /// Reporting shard.
        shard_id: ShardId,
    },
    /// A decoded tick.
    Tick {
        /// Reporting shard.
        shard_id: ShardId,
        /// The tick.
        tick: Tick,
    },
    /// Unexpected close; a reconnect follows after `delay`.
    Closed {
        /// Reporting shard.
        shard_id: ShardId,
        /// Connected time before the close.
        uptime: Duration,
        /// Close classification.
        class: CloseClass,
        /// Wait before the next attempt.
        delay: Duration,
    },
}

// =============================================================================
// Configuration
// =============================================================================

/// Settings shared by every shard.
#[derive(Debug, Clone)]
pub struct ShardConfig {
    /// Exchange WebSocket URL.
    pub url: String,
    /// Subscription message layout.
    pub subscription: SubscriptionFormat,
    /// Keepalive protocol.
    pub keepalive: KeepaliveConfig,
    /// Reconnect classification and backoff.
    pub resilience: ResilienceConfig,
    /// Bound on one connect attempt.
    pub connect_timeout: Duration,
    /// Bound on sending the close frame when cancelled.
    pub close_timeout: Duration,
}

impl ShardConfig {
    /// Default settings for `url`.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            subscription: SubscriptionFormat::default(),
            keepalive: KeepaliveConfig::default(),
            resilience: ResilienceConfig::default(),
            connect_timeout: Duration::from_secs(10),
            close_timeout: Duration::from_secs(1),
        }
    }
}

// =============================================================================
// Shard
// =============================================================================

/// One upstream connection and its reconnect loop.
pub struct ConnectionShard {
    shard_id: ShardId,
    tickers: Vec<TickerId>,
    config: Arc<ShardConfig>,
    codec: TickCodec,
    clock: Arc<dyn Clock>,
    event_tx: mpsc::Sender<ShardEvent>,
    status: Arc<ShardStatusBoard>,
    cancel: CancellationToken,
}

impl ConnectionShard {
    /// Create a shard for `tickers`; it registers itself on the status board.
    #[must_use]
    pub fn new(
        shard_id: ShardId,
        tickers: Vec<TickerId>,
        config: Arc<ShardConfig>,
        clock: Arc<dyn Clock>,
        event_tx: mpsc::Sender<ShardEvent>,
        status: Arc<ShardStatusBoard>,
        cancel: CancellationToken,
    ) -> Self {
        status.register(shard_id, tickers.len());
        Self {
            shard_id,
            tickers,
            config,
            codec: TickCodec::new(),
            clock,
            event_tx,
            status,
            cancel,
        }
    }

    /// Shard id.
    #[must_use]
    pub const fn shard_id(&self) -> ShardId {
        self.shard_id
    }

    /// Run until cancelled or the event channel closes.
    pub async fn run(self) {
        let mut policy = ReconnectPolicy::new(self.config.resilience.clone());
        let mut machine = ShardStateMachine::new();

        loop {
            let result = self.session(&mut machine).await;
            let was_connected = machine.state() == ShardState::Connected;
            let uptime = machine.uptime();
            if was_connected {
                metrics::shard_disconnected();
            }

            match result {
                Ok(()) | Err(ShardError::Cancelled) => {
                    tracing::info!(shard = %self.shard_id, "Shard closed");
                    self.enter(&mut machine, ShardState::Closing);
                    return;
                }
                Err(ShardError::ChannelClosed) => {
                    tracing::warn!(shard = %self.shard_id, "Shard event consumer gone, stopping");
                    self.enter(&mut machine, ShardState::Closing);
                    return;
                }
                Err(e) => {
                    let decision = policy.on_close(uptime);
                    tracing::warn!(
                        shard = %self.shard_id,
                        error = %e,
                        uptime_ms = u64::try_from(uptime.as_millis()).unwrap_or(u64::MAX),
                        class = decision.class.as_str(),
                        rapid_failures = decision.rapid_failures,
                        delay_ms = u64::try_from(decision.delay.as_millis()).unwrap_or(u64::MAX),
                        cooldown = decision.cooldown,
                        "Shard connection lost"
                    );
                    metrics::record_reconnect(decision.class.as_str());
                    if decision.cooldown {
                        metrics::record_cooldown();
                    }

                    self.enter(&mut machine, ShardState::ReconnectWait);
                    self.status.update(self.shard_id, |s| {
                        s.connected_since = None;
                        s.rapid_failures = decision.rapid_failures;
                    });

                    let closed = ShardEvent::Closed {
                        shard_id: self.shard_id,
                        uptime,
                        class: decision.class,
                        delay: decision.delay,
                    };
                    if self.emit(closed).await.is_err() {
                        self.enter(&mut machine, ShardState::Closing);
                        return;
                    }

                    tokio::select! {
                        () = self.cancel.cancelled() => {
                            tracing::debug!(shard = %self.shard_id, "Shard cancelled during reconnect delay");
                            self.enter(&mut machine, ShardState::Closing);
                            return;
                        }
                        () = tokio::time::sleep(decision.delay) => {}
                    }

                    self.enter(&mut machine, ShardState::Connecting);
                    self.status.update(self.shard_id, |s| s.reconnects += 1);
                }
            }
        }
    }

    /// Apply a transition, logging rejected ones.
    fn enter(&self, machine: &mut ShardStateMachine, next: ShardState) -> bool {
        match machine.transition(next) {
            Ok(_) => {
                self.status.update(self.shard_id, |s| s.state = next);
                true
            }
            Err(e) => {
                tracing::error!(shard = %self.shard_id, error = %e, "Rejected shard transition");
                false
            }
        }
    }

    /// One connect-subscribe-stream cycle. `Ok(())` means cancelled.
    async fn session(&self, machine: &mut ShardStateMachine) -> Result<(), ShardError> {
        tracing::debug!(
            shard = %self.shard_id,
            url = %self.config.url,
            tickers = self.tickers.len(),
            "Connecting shard"
        );

        let connect = tokio::time::timeout(
            self.config.connect_timeout,
            tokio_tungstenite::connect_async(self.config.url.as_str()),
        );
        let (ws_stream, _response) = tokio::select! {
            () = self.cancel.cancelled() => return Ok(()),
            result = connect => result
                .map_err(|_| ShardError::ConnectTimeout(self.config.connect_timeout))??,
        };

        let (mut write, mut read) = ws_stream.split();

        let subscription = self.config.subscription.render(&self.tickers);
        tokio::select! {
            () = self.cancel.cancelled() => return Ok(()),
            sent = write.send(Message::Text(subscription.into())) => sent?,
        }

        machine.transition(ShardState::Connected)?;
        let connected_at = self.clock.now();
        self.status.update(self.shard_id, |s| {
            s.state = ShardState::Connected;
            s.connected_since = Some(connected_at);
        });
        metrics::shard_connected();
        tracing::info!(shard = %self.shard_id, tickers = self.tickers.len(), "Shard subscribed");

        self.emit(ShardEvent::Connected {
            shard_id: self.shard_id,
        })
        .await?;

        let keepalive_state = Arc::new(KeepaliveState::new());
        let (keepalive_tx, mut keepalive_rx) = mpsc::channel::<KeepaliveEvent>(4);
        let keepalive_cancel = self.cancel.child_token();
        let _keepalive_guard = keepalive_cancel.clone().drop_guard();
        tokio::spawn(
            KeepaliveManager::new(
                self.config.keepalive.clone(),
                Arc::clone(&keepalive_state),
                keepalive_tx,
                keepalive_cancel,
            )
            .run(),
        );

        match self
            .stream(&mut write, &mut read, &mut keepalive_rx, &keepalive_state)
            .await
        {
            Ok(()) | Err(ShardError::Cancelled) => {
                self.close(&mut write).await;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Pump frames until cancelled (`Ok`) or the session fails.
    async fn stream(
        &self,
        write: &mut WsWrite,
        read: &mut WsRead,
        keepalive_rx: &mut mpsc::Receiver<KeepaliveEvent>,
        keepalive_state: &KeepaliveState,
    ) -> Result<(), ShardError> {
        loop {
            tokio::select! {
                () = self.cancel.cancelled() => return Ok(()),
                event = keepalive_rx.recv() => {
                    match event {
                        Some(KeepaliveEvent::Send) => {
                            write
                                .send(Message::Text(self.config.keepalive.payload.clone().into()))
                                .await?;
                            keepalive_state.mark_sent();
                            metrics::record_keepalive_sent();
                        }
                        Some(KeepaliveEvent::IdleTimeout) => return Err(ShardError::IdleTimeout),
                        None => return Err(ShardError::KeepaliveStopped),
                    }
                }
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            keepalive_state.record_inbound();
                            self.handle_text(text.as_str(), write).await?;
                        }
                        Some(Ok(Message::Binary(data))) => {
                            keepalive_state.record_inbound();
                            match std::str::from_utf8(&data) {
                                Ok(text) => self.handle_text(text, write).await?,
                                Err(_) => {
                                    metrics::record_parse_error();
                                    tracing::warn!(shard = %self.shard_id, "Dropping non-UTF-8 binary frame");
                                }
                            }
                        }
                        Some(Ok(Message::Ping(data))) => {
                            keepalive_state.record_inbound();
                            write.send(Message::Pong(data)).await?;
                        }
                        Some(Ok(Message::Pong(_))) => keepalive_state.record_inbound(),
                        Some(Ok(Message::Close(frame))) => {
                            tracing::info!(shard = %self.shard_id, frame = ?frame, "Exchange sent close frame");
                            return Err(ShardError::ConnectionClosed);
                        }
                        Some(Ok(Message::Frame(_))) => {}
                        Some(Err(e)) => return Err(e.into()),
                        None => return Err(ShardError::ConnectionClosed),
                    }
                }
            }
        }
    }

    async fn handle_text(&self, text: &str, write: &mut WsWrite) -> Result<(), ShardError> {
        match self.config.keepalive.classify(text) {
            KeepaliveFrame::Probe => {
                write
                    .send(Message::Text(self.config.keepalive.reply.clone().into()))
                    .await?;
            }
            KeepaliveFrame::Ack => {
                tracing::trace!(shard = %self.shard_id, "Keepalive acknowledged");
            }
            KeepaliveFrame::Data => match self.codec.decode(text, self.clock.now()) {
                Ok(ticks) => {
                    metrics::record_ticks_received(ticks.len() as u64);
                    for tick in ticks {
                        self.emit(ShardEvent::Tick {
                            shard_id: self.shard_id,
                            tick,
                        })
                        .await?;
                    }
                }
                Err(e) => {
                    metrics::record_parse_error();
                    tracing::warn!(shard = %self.shard_id, error = %e, "Dropping undecodable frame");
                }
            },
        }
        Ok(())
    }

    /// Best-effort close frame; a stalled peer cannot hold up teardown.
    async fn close(&self, write: &mut WsWrite) {
        let close = write.send(Message::Close(None));
        match tokio::time::timeout(self.config.close_timeout, close).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::debug!(shard = %self.shard_id, error = %e, "Close frame failed"),
            Err(_) => tracing::debug!(shard = %self.shard_id, "Close frame timed out, dropping socket"),
        }
    }

    /// Forward an event, giving up when the shard is cancelled so a stalled
    /// consumer cannot block teardown.
    async fn emit(&self, event: ShardEvent) -> Result<(), ShardError> {
        tokio::select! {
            () = self.cancel.cancelled() => Err(ShardError::Cancelled),
            sent = self.event_tx.send(event) => sent.map_err(|_| ShardError::ChannelClosed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::ports::SystemClock;

    #[tokio::test(start_paused = true)]
    async fn unreachable_exchange_backs_off_and_reports_rapid_closes() {
        let mut config = ShardConfig::new("ws://127.0.0.1:9");
        config.resilience.jitter_factor = 0.0;
        config.connect_timeout = Duration::from_millis(200);

        let (tx, mut rx) = mpsc::channel(16);
        let board = Arc::new(ShardStatusBoard::new());
        let cancel = CancellationToken::new();
        let shard = ConnectionShard::new(
            ShardId(0),
            vec![TickerId::from("a")],
            Arc::new(config),
            Arc::new(SystemClock),
            tx,
            Arc::clone(&board),
            cancel.clone(),
        );
        let handle = tokio::spawn(shard.run());

        let event = rx.recv().await.unwrap();
        let ShardEvent::Closed { class, uptime, delay, .. } = event else {
            panic!("expected close event, got {event:?}");
        };
        assert_eq!(class, CloseClass::Rapid);
        assert_eq!(uptime, Duration::ZERO);
        assert_eq!(delay, Duration::from_secs(1));
        assert_eq!(board.snapshot()[0].state, ShardState::ReconnectWait);

        cancel.cancel();
        handle.await.unwrap();
        assert_eq!(board.snapshot()[0].state, ShardState::Closing);
    }
}
