//! Leadership Types
//!
//! A worker is a `Candidate` until it either wins the lease (`Leader`) or
//! observes another owner (`Follower`). Losing or failing to renew the lease
//! always returns it to `Candidate`.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Identity of one worker process in the fleet.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WorkerId(String);

impl WorkerId {
    /// Create a worker id.
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Generate a unique worker id with the given prefix.
    #[must_use]
    pub fn generate(prefix: &str) -> Self {
        Self(format!("{prefix}-{}", uuid::Uuid::new_v4().simple()))
    }

    /// Borrow the raw id.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Role of this worker in the fleet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Racing for the lease.
    #[default]
    Candidate,
    /// Holds the lease and owns the upstream connections.
    Leader,
    /// Another worker holds the lease; consumes the broadcast channel.
    Follower,
}

impl Role {
    /// Role name for logs and health output.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Candidate => "candidate",
            Self::Leader => "leader",
            Self::Follower => "follower",
        }
    }
}

/// Current holder of a lease key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseRecord {
    /// Worker holding the lease.
    pub owner_id: String,
    /// When the lease lapses unless renewed.
    pub expires_at: DateTime<Utc>,
}

impl LeaseRecord {
    /// Whether the lease is still valid at `now`.
    #[must_use]
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }

    /// Whether `worker` holds this lease.
    #[must_use]
    pub fn is_held_by(&self, worker: &WorkerId) -> bool {
        self.owner_id == worker.as_str()
    }
}

/// Lease timing parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaseTiming {
    /// Lease time-to-live.
    pub ttl: Duration,
    /// How often the leader renews (must be shorter than `ttl`).
    pub renew_interval: Duration,
    /// How often candidates and followers retry acquisition.
    pub acquire_interval: Duration,
}

impl LeaseTiming {
    /// Whether the renewal cadence can keep the lease alive.
    #[must_use]
    pub fn is_consistent(&self) -> bool {
        !self.ttl.is_zero() && self.renew_interval < self.ttl
    }
}

impl Default for LeaseTiming {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(15),
            renew_interval: Duration::from_secs(5),
            acquire_interval: Duration::from_secs(3),
        }
    }
}
