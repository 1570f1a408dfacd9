//! Reconnection Policy
//!
//! Classifies every unexpected shard close by connection uptime and decides
//! how long to wait before reconnecting. This is the only place backoff math
//! lives.
//!
//! - **Stable** close (uptime at or above the stability threshold): wait the
//!   minimal stable delay and reset the rapid-failure counter.
//! - **Rapid** close (shorter uptime, including failed connects): exponential
//!   backoff `base × 2^(n-1)` capped at `max_delay`, `n` being the number of
//!   consecutive rapid closes. The close that brings `n` to the limit waits
//!   the fixed cooldown instead and resets the counter.

use std::time::Duration;

use rand::Rng;

/// Reconnection tuning.
#[derive(Debug, Clone, PartialEq)]
pub struct ResilienceConfig {
    /// Minimum uptime for a close to count as stable.
    pub stability_threshold: Duration,
    /// Delay after a stable close.
    pub stable_delay: Duration,
    /// Delay after the first rapid close.
    pub base_delay: Duration,
    /// Backoff ceiling.
    pub max_delay: Duration,
    /// Consecutive rapid closes that trigger a cooldown.
    pub rapid_failure_limit: u32,
    /// Fixed wait once the limit is reached.
    pub cooldown: Duration,
    /// Jitter as a fraction of the backoff delay (0.1 = ±10%).
    pub jitter_factor: f64,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            stability_threshold: Duration::from_secs(10),
            stable_delay: Duration::from_millis(500),
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            rapid_failure_limit: 5,
            cooldown: Duration::from_secs(60),
            jitter_factor: 0.1,
        }
    }
}

/// Classification of an unexpected close.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseClass {
    /// The connection stayed up past the stability threshold.
    Stable,
    /// The connection dropped (or never came up) before the threshold.
    Rapid,
}

impl CloseClass {
    /// Label for logs and metrics.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Stable => "stable",
            Self::Rapid => "rapid",
        }
    }
}

/// What to do after a close.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectDecision {
    /// How the close was classified.
    pub class: CloseClass,
    /// Wait before the next connect attempt.
    pub delay: Duration,
    /// Rapid-failure counter after this close.
    pub rapid_failures: u32,
    /// Whether this delay is the cooldown.
    pub cooldown: bool,
}

/// Per-shard reconnection state.
///
/// # Example
///
/// ```rust
/// use std::time::Duration;
/// use price_ingestor::infrastructure::exchange::reconnect::{
///     CloseClass, ReconnectPolicy, ResilienceConfig,
/// };
///
/// let mut policy = ReconnectPolicy::new(ResilienceConfig {
///     jitter_factor: 0.0,
///     ..ResilienceConfig::default()
/// });
///
/// let decision = policy.on_close(Duration::from_secs(30));
/// assert_eq!(decision.class, CloseClass::Stable);
/// assert_eq!(decision.rapid_failures, 0);
/// ```
#[derive(Debug)]
pub struct ReconnectPolicy {
    config: ResilienceConfig,
    rapid_failures: u32,
}

impl ReconnectPolicy {
    /// Create a policy with a zero rapid-failure counter.
    #[must_use]
    pub const fn new(config: ResilienceConfig) -> Self {
        Self {
            config,
            rapid_failures: 0,
        }
    }

    /// Classify a close after `uptime` of connected time and compute the delay.
    pub fn on_close(&mut self, uptime: Duration) -> ReconnectDecision {
        if uptime >= self.config.stability_threshold {
            self.rapid_failures = 0;
            return ReconnectDecision {
                class: CloseClass::Stable,
                delay: self.config.stable_delay,
                rapid_failures: 0,
                cooldown: false,
            };
        }

        self.rapid_failures += 1;

        if self.config.rapid_failure_limit > 0
            && self.rapid_failures >= self.config.rapid_failure_limit
        {
            self.rapid_failures = 0;
            return ReconnectDecision {
                class: CloseClass::Rapid,
                delay: self.config.cooldown,
                rapid_failures: 0,
                cooldown: true,
            };
        }

        ReconnectDecision {
            class: CloseClass::Rapid,
            delay: self.apply_jitter(self.backoff(self.rapid_failures)),
            rapid_failures: self.rapid_failures,
            cooldown: false,
        }
    }

    /// Consecutive rapid closes so far.
    #[must_use]
    pub const fn rapid_failures(&self) -> u32 {
        self.rapid_failures
    }

    /// `base × 2^(n-1)`, capped.
    fn backoff(&self, n: u32) -> Duration {
        let exponent = n.saturating_sub(1).min(31);
        self.config
            .base_delay
            .checked_mul(1u32 << exponent)
            .map_or(self.config.max_delay, |d| d.min(self.config.max_delay))
    }

    fn apply_jitter(&self, duration: Duration) -> Duration {
        if self.config.jitter_factor <= 0.0 {
            return duration;
        }

        #[allow(clippy::cast_precision_loss)]
        let base_millis = duration.as_millis() as f64;
        let jitter_range = base_millis * self.config.jitter_factor;
        let mut rng = rand::rng();
        let jitter: f64 = rng.random_range(-jitter_range..=jitter_range);
        let adjusted_millis = (base_millis + jitter).max(1.0);

        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let adjusted_u64 = adjusted_millis as u64;
        Duration::from_millis(adjusted_u64)
    }
}
