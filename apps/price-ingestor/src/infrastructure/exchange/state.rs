//! Shard State Machine
//!
//! Typed transition table for one upstream connection:
//!
//! ```text
//! Connecting ──▶ Connected ──▶ ReconnectWait ──▶ Connecting
//!     │              │               │
//!     └──────────────┴───────────────┴──▶ Closing
//! ```
//!
//! `Connecting → ReconnectWait` covers failed connects. `Closing` is
//! terminal.

use std::fmt;

use serde::Serialize;
use tokio::time::{Duration, Instant};

/// Lifecycle state of one shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ShardState {
    /// Opening the socket and sending the subscription.
    Connecting,
    /// Subscribed and streaming.
    Connected,
    /// Explicitly closed; no reconnect follows.
    Closing,
    /// Waiting out a reconnect delay.
    ReconnectWait,
}

impl ShardState {
    /// Whether `self → next` is a legal transition.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Connecting, Self::Connected | Self::ReconnectWait | Self::Closing)
                | (Self::Connected, Self::ReconnectWait | Self::Closing)
                | (Self::ReconnectWait, Self::Connecting | Self::Closing)
        )
    }

    /// State name for logs and health output.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Closing => "closing",
            Self::ReconnectWait => "reconnect_wait",
        }
    }
}

impl fmt::Display for ShardState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rejected state transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("illegal shard transition {from} -> {to}")]
pub struct TransitionError {
    /// State the shard was in.
    pub from: ShardState,
    /// Requested state.
    pub to: ShardState,
}

/// Current state plus when it was entered.
#[derive(Debug, Clone)]
pub struct ShardStateMachine {
    state: ShardState,
    entered_at: Instant,
}

impl Default for ShardStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl ShardStateMachine {
    /// Start in `Connecting`.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: ShardState::Connecting,
            entered_at: Instant::now(),
        }
    }

    /// Current state.
    #[must_use]
    pub const fn state(&self) -> ShardState {
        self.state
    }

    /// Time spent in the current state.
    #[must_use]
    pub fn time_in_state(&self) -> Duration {
        self.entered_at.elapsed()
    }

    /// Connected time so far, zero unless currently `Connected`.
    #[must_use]
    pub fn uptime(&self) -> Duration {
        if self.state == ShardState::Connected {
            self.time_in_state()
        } else {
            Duration::ZERO
        }
    }

    /// Move to `next`, returning the previous state.
    ///
    /// # Errors
    ///
    /// Returns [`TransitionError`] when the table forbids the move; the
    /// state is left unchanged.
    pub fn transition(&mut self, next: ShardState) -> Result<ShardState, TransitionError> {
        if !self.state.can_transition_to(next) {
            return Err(TransitionError {
                from: self.state,
                to: next,
            });
        }
        let previous = self.state;
        self.state = next;
        self.entered_at = Instant::now();
        Ok(previous)
    }
}
