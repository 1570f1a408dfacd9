//! Keepalive Manager
//!
//! The exchange drops idle connections unless it receives an
//! application-level keepalive token (a text frame, not a protocol ping) at a
//! fixed cadence. The manager runs per connected session, asks the shard to
//! send the token on every tick and reports an idle timeout when nothing has
//! arrived from the exchange while a keepalive is outstanding.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Keepalive protocol settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeepaliveConfig {
    /// Text frame sent on every tick.
    pub payload: String,
    /// Text frame the exchange sends back in answer to `payload`.
    pub ack: String,
    /// Text frame the exchange may send expecting `reply`.
    pub probe: String,
    /// Answer to `probe`.
    pub reply: String,
    /// Send cadence.
    pub interval: Duration,
    /// Silence tolerated while a keepalive is outstanding.
    pub idle_timeout: Duration,
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self {
            payload: "PING".to_string(),
            ack: "PONG".to_string(),
            probe: "PING".to_string(),
            reply: "PONG".to_string(),
            interval: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(30),
        }
    }
}

/// What an inbound text frame means to the keepalive protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeepaliveFrame {
    /// The exchange is probing us; answer with the reply.
    Probe,
    /// Acknowledgement of our keepalive.
    Ack,
    /// Not a keepalive frame.
    Data,
}

impl KeepaliveConfig {
    /// Classify an inbound text frame.
    #[must_use]
    pub fn classify(&self, text: &str) -> KeepaliveFrame {
        let trimmed = text.trim();
        if trimmed == self.probe {
            KeepaliveFrame::Probe
        } else if trimmed == self.ack {
            KeepaliveFrame::Ack
        } else {
            KeepaliveFrame::Data
        }
    }
}

/// Events emitted by the keepalive manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeepaliveEvent {
    /// Send the keepalive payload now.
    Send,
    /// No inbound traffic within the idle timeout.
    IdleTimeout,
}

/// Liveness shared between the manager and the shard's read loop.
#[derive(Debug)]
pub struct KeepaliveState {
    last_inbound: RwLock<Instant>,
    outstanding: AtomicBool,
}

impl Default for KeepaliveState {
    fn default() -> Self {
        Self::new()
    }
}

impl KeepaliveState {
    /// Fresh state; the session just started.
    #[must_use]
    pub fn new() -> Self {
        Self {
            last_inbound: RwLock::new(Instant::now()),
            outstanding: AtomicBool::new(false),
        }
    }

    /// Any inbound frame proves liveness.
    pub fn record_inbound(&self) {
        *self.last_inbound.write() = Instant::now();
        self.outstanding.store(false, Ordering::SeqCst);
    }

    /// A keepalive went out.
    pub fn mark_sent(&self) {
        self.outstanding.store(true, Ordering::SeqCst);
    }

    /// Whether a keepalive is awaiting any inbound frame.
    #[must_use]
    pub fn is_outstanding(&self) -> bool {
        self.outstanding.load(Ordering::SeqCst)
    }

    /// Time since the last inbound frame.
    #[must_use]
    pub fn silence(&self) -> Duration {
        self.last_inbound.read().elapsed()
    }
}

/// Keepalive timer for one connected session.
pub struct KeepaliveManager {
    config: KeepaliveConfig,
    state: Arc<KeepaliveState>,
    event_tx: mpsc::Sender<KeepaliveEvent>,
    cancel: CancellationToken,
}

impl KeepaliveManager {
    /// Create a manager; nothing is sent until [`run`](Self::run) is spawned.
    #[must_use]
    pub const fn new(
        config: KeepaliveConfig,
        state: Arc<KeepaliveState>,
        event_tx: mpsc::Sender<KeepaliveEvent>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            state,
            event_tx,
            cancel,
        }
    }

    /// Tick until cancelled, an idle timeout fires, or the shard goes away.
    ///
    /// The first keepalive goes out one interval after start.
    pub async fn run(self) {
        let start = Instant::now() + self.config.interval;
        let mut interval = tokio::time::interval_at(start, self.config.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => {
                    tracing::trace!("Keepalive manager cancelled");
                    break;
                }
                _ = interval.tick() => {
                    if !self.check_and_send().await {
                        break;
                    }
                }
            }
        }
    }

    /// Returns `false` when the loop should exit.
    async fn check_and_send(&self) -> bool {
        if self.state.is_outstanding() {
            let silence = self.state.silence();
            if silence > self.config.idle_timeout {
                tracing::warn!(
                    silence_ms = u64::try_from(silence.as_millis()).unwrap_or(u64::MAX),
                    idle_timeout_ms =
                        u64::try_from(self.config.idle_timeout.as_millis()).unwrap_or(u64::MAX),
                    "Keepalive idle timeout"
                );
                let _ = self.event_tx.send(KeepaliveEvent::IdleTimeout).await;
                return false;
            }
        }

        if self.event_tx.send(KeepaliveEvent::Send).await.is_err() {
            tracing::trace!("Keepalive channel closed");
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(interval_ms: u64, idle_ms: u64) -> KeepaliveConfig {
        KeepaliveConfig {
            interval: Duration::from_millis(interval_ms),
            idle_timeout: Duration::from_millis(idle_ms),
            ..KeepaliveConfig::default()
        }
    }

    #[test]
    fn classify_frames() {
        let config = KeepaliveConfig {
            probe: "ping".to_string(),
            ..KeepaliveConfig::default()
        };
        assert_eq!(config.classify("ping"), KeepaliveFrame::Probe);
        assert_eq!(config.classify(" PONG\n"), KeepaliveFrame::Ack);
        assert_eq!(config.classify("{\"asset_id\":\"x\"}"), KeepaliveFrame::Data);
    }

    #[test]
    fn inbound_clears_outstanding() {
        let state = KeepaliveState::new();
        state.mark_sent();
        assert!(state.is_outstanding());
        state.record_inbound();
        assert!(!state.is_outstanding());
    }

    #[tokio::test(start_paused = true)]
    async fn first_keepalive_waits_one_interval() {
        let state = Arc::new(KeepaliveState::new());
        let (tx, mut rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(
            KeepaliveManager::new(config(10_000, 30_000), state, tx, cancel.clone()).run(),
        );

        tokio::time::sleep(Duration::from_millis(9_900)).await;
        assert!(rx.try_recv().is_err());

        let event = rx.recv().await.unwrap();
        assert_eq!(event, KeepaliveEvent::Send);

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn silence_while_outstanding_times_out() {
        let state = Arc::new(KeepaliveState::new());
        let (tx, mut rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(
            KeepaliveManager::new(config(1_000, 2_500), Arc::clone(&state), tx, cancel).run(),
        );

        let mut saw_timeout = false;
        while let Some(event) = rx.recv().await {
            match event {
                KeepaliveEvent::Send => state.mark_sent(),
                KeepaliveEvent::IdleTimeout => {
                    saw_timeout = true;
                    break;
                }
            }
        }

        assert!(saw_timeout);
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn inbound_traffic_keeps_session_alive() {
        let state = Arc::new(KeepaliveState::new());
        let (tx, mut rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(
            KeepaliveManager::new(config(1_000, 2_500), Arc::clone(&state), tx, cancel.clone())
                .run(),
        );

        for _ in 0..10 {
            let event = rx.recv().await.unwrap();
            assert_eq!(event, KeepaliveEvent::Send);
            state.mark_sent();
            state.record_inbound();
        }

        cancel.cancel();
        handle.await.unwrap();
    }
}
