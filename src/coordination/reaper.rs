//! Liveness-based recovery of abandoned claims.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;
use tracing::debug;

use crate::coordination::coordinator::{ClaimError, WorkClaimCoordinator};
use crate::id::{AgentId, WorkId};

#[derive(Debug, Clone)]
pub struct ReaperConfig {
    /// An agent whose heartbeat is older than this is considered dead.
    pub agent_liveness: Duration,
    /// A held item not updated for this long is reclaimed even if its owner
    /// still heartbeats.
    pub work_staleness: Duration,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            agent_liveness: Duration::from_secs(90),
            work_staleness: Duration::from_secs(300),
        }
    }
}

/// One item returned to the pool by a scan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReapedItem {
    pub work_id: WorkId,
    pub previous_owner: AgentId,
    pub reason: String,
}

/// Result of one reaper cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReapReport {
    pub expired_agents: Vec<AgentId>,
    pub released: Vec<ReapedItem>,
}

impl ReapReport {
    pub fn is_empty(&self) -> bool {
        self.expired_agents.is_empty() && self.released.is_empty()
    }
}

/// Finds claims held by dead or stalled agents and releases them.
#[derive(Debug, Clone)]
pub struct Reaper {
    coordinator: WorkClaimCoordinator,
    config: ReaperConfig,
}

impl Reaper {
    pub fn new(coordinator: WorkClaimCoordinator, config: ReaperConfig) -> Self {
        Self {
            coordinator,
            config,
        }
    }

    pub fn config(&self) -> &ReaperConfig {
        &self.config
    }

    /// Run one cycle as of `now`.
    ///
    /// Agents past the liveness threshold are marked `error`. Every held
    /// item whose owner is gone, expired, or whose last update is older than
    /// the staleness threshold is released back to `pending`. Items that
    /// change hands or receive an update between the snapshot and the
    /// release are skipped.
    ///
    /// # Errors
    ///
    /// Only `ClaimError::StoreUnavailable` is returned; per-item races are
    /// not errors.
    pub async fn scan(&self, now: DateTime<Utc>) -> Result<ReapReport, ClaimError> {
        let expired_agents = self
            .coordinator
            .expire_agents(now, self.config.agent_liveness)
            .await?;

        let snapshot = self.coordinator.snapshot().await?;
        let mut released = Vec::new();

        // The snapshot only nominates candidates; `reap` re-checks each one
        // against the live record before releasing it.
        for item in snapshot.work_items.iter().filter(|w| w.state.is_held()) {
            let Some(owner) = item.claimed_by else {
                continue;
            };
            if item
                .abandonment(snapshot.agent(&owner), now, self.config.work_staleness)
                .is_none()
            {
                continue;
            }

            match self
                .coordinator
                .reap(&item.id, &owner, now, self.config.work_staleness)
                .await
            {
                Ok(Some((_, reason))) => released.push(ReapedItem {
                    work_id: item.id,
                    previous_owner: owner,
                    reason,
                }),
                Ok(None) => {}
                Err(e @ ClaimError::StoreUnavailable(_)) => return Err(e),
                Err(e) => debug!(work_id = %item.id, error = %e, "skipping item changed during scan"),
            }
        }

        Ok(ReapReport {
            expired_agents,
            released,
        })
    }
}
