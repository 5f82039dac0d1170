//! Heartbeat actor: keeps one agent's liveness lease fresh.

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::coordination::{ClaimError, WorkClaimCoordinator};
use crate::id::AgentId;

use super::ActorHandle;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

pub struct HeartbeatActor {
    coordinator: WorkClaimCoordinator,
    agent_id: AgentId,
    interval: Duration,
}

impl HeartbeatActor {
    pub fn new(coordinator: WorkClaimCoordinator, agent_id: AgentId) -> Self {
        Self {
            coordinator,
            agent_id,
            interval: HEARTBEAT_INTERVAL,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn spawn(self) -> ActorHandle {
        self.spawn_with(CancellationToken::new())
    }

    pub fn spawn_with(self, cancel: CancellationToken) -> ActorHandle {
        let cancel_clone = cancel.clone();

        debug!(agent_id = %self.agent_id, "HeartbeatActor::spawn");

        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.interval);

            loop {
                tokio::select! {
                    _ = cancel_clone.cancelled() => {
                        debug!(agent_id = %self.agent_id, "HeartbeatActor cancelled");
                        break;
                    }
                    _ = interval.tick() => {
                        match self.coordinator.heartbeat(&self.agent_id).await {
                            Ok(_) => {}
                            Err(ClaimError::NotFound { .. }) => {
                                warn!(agent_id = %self.agent_id, "agent deregistered, stopping heartbeat");
                                break;
                            }
                            Err(e) => error!(agent_id = %self.agent_id, error = %e, "heartbeat failed"),
                        }
                    }
                }
            }
        });

        ActorHandle::new(cancel, task)
    }
}
