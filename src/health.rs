//! Health scoring and throughput metrics.
//!
//! The `HealthAggregator` derives a report from a store snapshot plus the
//! span stream and workflow events. It is read-only with respect to the
//! store and tolerates snapshots that lag the live state.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;

use crate::coordination::{AgentStatus, StoreSnapshot, WorkState};
use crate::telemetry::{SpanStatus, TraceSpan};
use crate::workflow::{RunState, WorkflowEvent};

pub use crate::actors::MetricsActor;

/// Score at or above which the system is healthy.
pub const HEALTHY_SCORE: u8 = 80;
/// Score at or above which the system is degraded rather than unhealthy.
pub const DEGRADED_SCORE: u8 = 50;

#[derive(Debug, Clone)]
pub struct HealthConfig {
    /// Sliding window for completion throughput.
    pub window: Duration,
    /// Heartbeat age after which an agent counts as expired.
    pub agent_liveness: Duration,
    /// Pending items older than this count as stale backlog.
    pub stale_backlog: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(300),
            agent_liveness: Duration::from_secs(90),
            stale_backlog: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    pub fn from_score(score: u8) -> Self {
        if score >= HEALTHY_SCORE {
            HealthStatus::Healthy
        } else if score >= DEGRADED_SCORE {
            HealthStatus::Degraded
        } else {
            HealthStatus::Unhealthy
        }
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Degraded => write!(f, "degraded"),
            HealthStatus::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

/// A point-in-time health summary.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub generated_at: DateTime<Utc>,
    pub status: HealthStatus,
    pub score: u8,
    pub agents_by_status: BTreeMap<String, usize>,
    pub work_by_state: BTreeMap<String, usize>,
    pub expired_agents: usize,
    pub stale_backlog: usize,
    pub claims: u64,
    pub conflicts: u64,
    pub errors: u64,
    pub conflict_rate: f64,
    pub error_rate: f64,
    pub completed_per_minute: f64,
    pub runs_completed: u64,
    pub runs_failed: u64,
    pub step_retries: u64,
}

/// Accumulates span and event counters between reports.
#[derive(Debug, Clone, Default)]
pub struct HealthAggregator {
    config: HealthConfig,
    operations: u64,
    claims: u64,
    conflicts: u64,
    errors: u64,
    completions: VecDeque<DateTime<Utc>>,
    runs_completed: u64,
    runs_failed: u64,
    step_retries: u64,
}

impl HealthAggregator {
    pub fn new(config: HealthConfig) -> Self {
        Self {
            config,
            ..Default::default()
        }
    }

    /// Count one closed span. Only coordination spans are tallied.
    pub fn observe_span(&mut self, span: &TraceSpan) {
        let Some(op) = span.operation.strip_prefix("coord.") else {
            return;
        };
        self.operations += 1;
        let outcome = span.attribute("outcome");
        if op == "claim" {
            self.claims += 1;
            if outcome == Some("conflict") {
                self.conflicts += 1;
            }
        }
        if span.status == SpanStatus::Error {
            self.errors += 1;
        }
        if op == "complete" && outcome == Some("ok") {
            let finished = span.start
                + chrono::Duration::from_std(span.duration).unwrap_or_else(|_| chrono::Duration::zero());
            self.completions.push_back(finished);
        }
    }

    pub fn observe_event(&mut self, event: &WorkflowEvent) {
        match event {
            WorkflowEvent::RunFinished { state, .. } => match state {
                RunState::Completed => self.runs_completed += 1,
                RunState::Failed => self.runs_failed += 1,
                _ => {}
            },
            WorkflowEvent::StepFinished { attempts, .. } => {
                self.step_retries += u64::from(attempts.saturating_sub(1));
            }
            WorkflowEvent::RunStarted { .. } => {}
        }
    }

    /// Build a report against `snapshot` as of `now`.
    pub fn report(&mut self, snapshot: &StoreSnapshot, now: DateTime<Utc>) -> HealthReport {
        let window = chrono::Duration::from_std(self.config.window)
            .unwrap_or_else(|_| chrono::Duration::minutes(5));
        while self
            .completions
            .front()
            .is_some_and(|t| *t < now - window)
        {
            self.completions.pop_front();
        }

        let mut agents_by_status = BTreeMap::new();
        let mut expired_agents = 0;
        for agent in &snapshot.agents {
            *agents_by_status.entry(agent.status.to_string()).or_insert(0) += 1;
            if agent.status == AgentStatus::Error || !agent.is_live(now, self.config.agent_liveness) {
                expired_agents += 1;
            }
        }

        let mut work_by_state = BTreeMap::new();
        let mut pending = 0;
        let mut stale_backlog = 0;
        for item in &snapshot.work_items {
            *work_by_state.entry(item.state.to_string()).or_insert(0) += 1;
            if item.state == WorkState::Pending {
                pending += 1;
                if item.age_since_update(now) > self.config.stale_backlog {
                    stale_backlog += 1;
                }
            }
        }

        let conflict_rate = ratio(self.conflicts, self.claims);
        let error_rate = ratio(self.errors, self.operations);
        let window_minutes = (self.config.window.as_secs_f64() / 60.0).max(1.0 / 60.0);
        let completed_per_minute = self.completions.len() as f64 / window_minutes;

        let expired_ratio = ratio(expired_agents as u64, snapshot.agents.len() as u64);
        let stale_ratio = ratio(stale_backlog as u64, pending as u64);
        let penalty = expired_ratio * 40.0 + error_rate * 40.0 + stale_ratio * 20.0;
        let score = (100.0 - penalty).clamp(0.0, 100.0).round() as u8;

        HealthReport {
            generated_at: now,
            status: HealthStatus::from_score(score),
            score,
            agents_by_status,
            work_by_state,
            expired_agents,
            stale_backlog,
            claims: self.claims,
            conflicts: self.conflicts,
            errors: self.errors,
            conflict_rate,
            error_rate,
            completed_per_minute,
            runs_completed: self.runs_completed,
            runs_failed: self.runs_failed,
            step_retries: self.step_retries,
        }
    }
}

fn ratio(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64
    }
}
