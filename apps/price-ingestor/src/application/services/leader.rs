//! Leader Coordinator
//!
//! Wraps the upstream connection lifecycle behind a distributed lease so
//! exactly one worker in the fleet owns the exchange connections.
//!
//! ```text
//! Candidate ──try_acquire ok──▶ Leader ──renew fails / lease lost──▶ Candidate
//!     │                            ▲
//!     └──lease held elsewhere──▶ Follower ──try_acquire ok──┘
//! ```
//!
//! A renewal is bounded by the remaining local lease validity, so a hung
//! store cannot keep a stale leader alive past its TTL. Demotion is
//! synchronous: the handler finishes stepping down before the role changes
//! and before any further lease traffic.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::application::ports::{LeaseError, LeaseStorePort};
use crate::domain::leadership::{LeaseTiming, Role, WorkerId};
use crate::infrastructure::metrics;

/// What the coordinator drives on role changes.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LeadershipHandler: Send + Sync {
    /// The lease was won. `term` is cancelled when leadership ends.
    async fn become_leader(&self, term: CancellationToken);

    /// Another worker holds the lease.
    async fn become_follower(&self, leader: Option<String>);

    /// Stop whatever the current role started; returns once stopped.
    async fn step_down(&self);
}

/// Lease identity and timing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaderConfig {
    /// Lease key shared by the fleet.
    pub lease_key: String,
    /// This worker.
    pub worker_id: WorkerId,
    /// TTL and intervals.
    pub timing: LeaseTiming,
}

/// Races for the lease and keeps it renewed.
pub struct LeaderCoordinator {
    config: LeaderConfig,
    store: Arc<dyn LeaseStorePort>,
    handler: Arc<dyn LeadershipHandler>,
    role_tx: watch::Sender<Role>,
    term: Mutex<Option<CancellationToken>>,
    valid_until: Mutex<Option<Instant>>,
}

impl LeaderCoordinator {
    /// Create a coordinator in the `Candidate` role.
    #[must_use]
    pub fn new(
        config: LeaderConfig,
        store: Arc<dyn LeaseStorePort>,
        handler: Arc<dyn LeadershipHandler>,
    ) -> Self {
        let (role_tx, _) = watch::channel(Role::Candidate);
        Self {
            config,
            store,
            handler,
            role_tx,
            term: Mutex::new(None),
            valid_until: Mutex::new(None),
        }
    }

    /// Current role.
    #[must_use]
    pub fn role(&self) -> Role {
        *self.role_tx.borrow()
    }

    /// Observe role changes.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<Role> {
        self.role_tx.subscribe()
    }

    /// This worker's id.
    #[must_use]
    pub const fn worker_id(&self) -> &WorkerId {
        &self.config.worker_id
    }

    /// Try to take the lease and switch role accordingly.
    ///
    /// # Errors
    ///
    /// Returns the store error; the role is left unchanged.
    pub async fn try_acquire(&self, parent: &CancellationToken) -> Result<Role, LeaseError> {
        let issued = Instant::now();
        let won = self
            .store
            .try_acquire(
                &self.config.lease_key,
                self.config.worker_id.as_str(),
                self.config.timing.ttl,
            )
            .await?;

        if won {
            *self.valid_until.lock() = Some(issued + self.config.timing.ttl);
            if self.role() != Role::Leader {
                if self.role() == Role::Follower {
                    self.handler.step_down().await;
                }
                let term = parent.child_token();
                *self.term.lock() = Some(term.clone());
                self.set_role(Role::Leader);
                tracing::info!(worker = %self.config.worker_id, "Acquired leadership");
                self.handler.become_leader(term).await;
            }
        } else if self.role() != Role::Follower {
            let leader = match self.store.current(&self.config.lease_key).await {
                Ok(record) => record.map(|r| r.owner_id),
                Err(e) => {
                    tracing::debug!(error = %e, "Could not read lease holder");
                    None
                }
            };
            self.set_role(Role::Follower);
            tracing::info!(worker = %self.config.worker_id, leader = ?leader, "Following");
            self.handler.become_follower(leader).await;
        }

        Ok(self.role())
    }

    /// Renew the lease; `false` means leadership must end.
    pub async fn renew(&self) -> bool {
        let Some(valid_until) = *self.valid_until.lock() else {
            return false;
        };
        let issued = Instant::now();
        let remaining = valid_until.saturating_duration_since(issued);
        if remaining.is_zero() {
            tracing::warn!(worker = %self.config.worker_id, "Lease expired before renewal");
            return false;
        }

        let renewal = self.store.renew(
            &self.config.lease_key,
            self.config.worker_id.as_str(),
            self.config.timing.ttl,
        );
        match tokio::time::timeout(remaining, renewal).await {
            Ok(Ok(true)) => {
                *self.valid_until.lock() = Some(issued + self.config.timing.ttl);
                true
            }
            Ok(Ok(false)) => {
                tracing::warn!(worker = %self.config.worker_id, "Lease held by another worker");
                false
            }
            Ok(Err(e)) => {
                tracing::warn!(worker = %self.config.worker_id, error = %e, "Lease renewal failed");
                false
            }
            Err(_) => {
                tracing::warn!(
                    worker = %self.config.worker_id,
                    "Lease renewal timed out at local lease expiry"
                );
                false
            }
        }
    }

    /// Race, follow and renew until cancelled, then stand down.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        tracing::info!(
            worker = %self.config.worker_id,
            key = %self.config.lease_key,
            ttl_ms = u64::try_from(self.config.timing.ttl.as_millis()).unwrap_or(u64::MAX),
            "Leader coordinator started"
        );

        loop {
            if self.role() == Role::Leader {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    () = tokio::time::sleep(self.config.timing.renew_interval) => {}
                }
                if !self.renew().await {
                    metrics::record_lease_renewal_failure();
                    self.demote().await;
                }
                continue;
            }

            if let Err(e) = self.try_acquire(&cancel).await {
                tracing::warn!(worker = %self.config.worker_id, error = %e, "Lease acquisition failed");
            }
            if self.role() != Role::Leader {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    () = tokio::time::sleep(self.config.timing.acquire_interval) => {}
                }
            }
        }

        self.stand_down().await;
    }

    /// Leave leadership: stop the handler first, then become `Candidate`.
    async fn demote(&self) {
        if let Some(term) = self.term.lock().take() {
            term.cancel();
        }
        self.handler.step_down().await;
        *self.valid_until.lock() = None;
        self.set_role(Role::Candidate);
        tracing::warn!(worker = %self.config.worker_id, "Demoted to candidate");
    }

    /// Shutdown path: stop the role and release a held lease.
    async fn stand_down(&self) {
        match self.role() {
            Role::Leader => {
                self.demote().await;
                if let Err(e) = self
                    .store
                    .release(&self.config.lease_key, self.config.worker_id.as_str())
                    .await
                {
                    tracing::warn!(error = %e, "Lease release failed");
                } else {
                    tracing::info!(worker = %self.config.worker_id, "Lease released");
                }
            }
            Role::Follower => {
                self.handler.step_down().await;
                self.set_role(Role::Candidate);
            }
            Role::Candidate => {}
        }
    }

    fn set_role(&self, role: Role) {
        self.role_tx.send_replace(role);
        metrics::set_leader(role == Role::Leader);
    }
}
