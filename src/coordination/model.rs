//! Typed records held by the coordination store.
//!
//! Agents never own work items directly: ownership is expressed only through
//! `WorkItem::claimed_by`, and state transitions only happen through the
//! `WorkClaimCoordinator`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::Error;
use crate::id::{AgentId, WorkId};

/// Liveness status of an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    /// Holding at least one claim.
    Active,
    /// Registered and heartbeating with no claims.
    #[default]
    Idle,
    /// Heartbeat expired; set by the reaper.
    Error,
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentStatus::Active => write!(f, "active"),
            AgentStatus::Idle => write!(f, "idle"),
            AgentStatus::Error => write!(f, "error"),
        }
    }
}

/// A registered worker agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Agent {
    pub id: AgentId,
    pub team: String,
    pub status: AgentStatus,
    /// Maximum number of work items held at once.
    pub capacity: u32,
    pub current_load: u32,
    pub last_heartbeat: DateTime<Utc>,
}

impl Agent {
    pub fn new(id: AgentId, team: &str, capacity: u32) -> Self {
        Self {
            id,
            team: team.to_string(),
            status: AgentStatus::Idle,
            capacity,
            current_load: 0,
            last_heartbeat: Utc::now(),
        }
    }

    pub fn has_capacity(&self) -> bool {
        self.current_load < self.capacity
    }

    /// Time since the last heartbeat, zero if the heartbeat is in the future.
    pub fn heartbeat_age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.last_heartbeat).to_std().unwrap_or_default()
    }

    pub fn is_live(&self, now: DateTime<Utc>, liveness: Duration) -> bool {
        self.heartbeat_age(now) <= liveness
    }

    /// Record a heartbeat and recompute the status from the current load.
    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.last_heartbeat = now;
        self.refresh_status();
    }

    pub fn acquire(&mut self) {
        self.current_load += 1;
        self.refresh_status();
    }

    pub fn relinquish(&mut self) {
        self.current_load = self.current_load.saturating_sub(1);
        if self.status != AgentStatus::Error {
            self.refresh_status();
        }
    }

    fn refresh_status(&mut self) {
        self.status = if self.current_load > 0 {
            AgentStatus::Active
        } else {
            AgentStatus::Idle
        };
    }
}

/// Work item priority. Ordering follows urgency, `Critical` is greatest.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Priority::Low => write!(f, "low"),
            Priority::Medium => write!(f, "medium"),
            Priority::High => write!(f, "high"),
            Priority::Critical => write!(f, "critical"),
        }
    }
}

impl std::str::FromStr for Priority {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Ok(Priority::Low),
            "medium" => Ok(Priority::Medium),
            "high" => Ok(Priority::High),
            "critical" => Ok(Priority::Critical),
            other => Err(Error::Validation(format!("unknown priority: {}", other))),
        }
    }
}

/// Lifecycle state of a work item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum WorkState {
    #[default]
    Pending,
    Claimed,
    InProgress,
    Completed,
    Failed,
}

impl WorkState {
    /// Can transition from self to `to`?
    pub fn can_transition_to(self, to: WorkState) -> bool {
        use WorkState::*;
        matches!(
            (self, to),
            (Pending, Claimed)
                | (Claimed, InProgress)
                | (Claimed, Pending) // released
                | (Claimed, Failed)
                | (InProgress, Pending) // released
                | (InProgress, Claimed) // handed off
                | (InProgress, Completed)
                | (InProgress, Failed)
        )
    }

    /// Terminal states are immutable once written.
    pub fn is_terminal(self) -> bool {
        matches!(self, WorkState::Completed | WorkState::Failed)
    }

    /// Is the item currently held by an agent?
    pub fn is_held(self) -> bool {
        matches!(self, WorkState::Claimed | WorkState::InProgress)
    }
}

impl std::fmt::Display for WorkState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            WorkState::Pending => "pending",
            WorkState::Claimed => "claimed",
            WorkState::InProgress => "in_progress",
            WorkState::Completed => "completed",
            WorkState::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

/// A discrete unit of work competed for by agents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: WorkId,
    #[serde(rename = "type")]
    pub work_type: String,
    pub priority: Priority,
    pub state: WorkState,
    pub claimed_by: Option<AgentId>,
    /// Percent complete, 0..=100.
    pub progress: u8,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub result: Option<serde_json::Value>,
}

impl WorkItem {
    pub fn new(id: WorkId, work_type: &str, priority: Priority) -> Self {
        let now = Utc::now();
        Self {
            id,
            work_type: work_type.to_string(),
            priority,
            state: WorkState::Pending,
            claimed_by: None,
            progress: 0,
            created_at: now,
            updated_at: now,
            result: None,
        }
    }

    pub fn is_owned_by(&self, agent_id: &AgentId) -> bool {
        self.claimed_by.as_ref() == Some(agent_id)
    }

    /// Time since the last update, zero if the update is in the future.
    pub fn age_since_update(&self, now: DateTime<Utc>) -> Duration {
        (now - self.updated_at).to_std().unwrap_or_default()
    }

    /// Why a held item counts as abandoned as of `now`, if it does.
    ///
    /// `owner` is the record of the holding agent, `None` if it is no
    /// longer registered.
    pub fn abandonment(
        &self,
        owner: Option<&Agent>,
        now: DateTime<Utc>,
        staleness: Duration,
    ) -> Option<String> {
        if !self.state.is_held() {
            return None;
        }
        match owner {
            None => Some("owner no longer registered".to_string()),
            Some(agent) if agent.status == AgentStatus::Error => Some(format!(
                "owner heartbeat expired ({}s old)",
                agent.heartbeat_age(now).as_secs()
            )),
            Some(_) if self.age_since_update(now) > staleness => Some(format!(
                "no update for {}s",
                self.age_since_update(now).as_secs()
            )),
            Some(_) => None,
        }
    }
}
