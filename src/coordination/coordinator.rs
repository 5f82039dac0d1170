//! Conflict-free claim, progress, completion and release of work items.
//!
//! Atomicity is delegated to `CoordinationStore::transact`; the coordinator
//! validates preconditions inside the transaction and translates outcomes
//! into `ClaimError`. Logical rejections (conflict, not owner, invalid
//! state) are returned to the caller immediately. Only lock contention is
//! retried, a bounded number of times.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::coordination::model::{Agent, AgentStatus, Priority, WorkItem, WorkState};
use crate::coordination::store::{CoordinationStore, StoreError, StoreSnapshot, StoreState};
use crate::id::{AgentId, WorkId};
use crate::telemetry::{SpanContext, SpanStatus, Tracer};

/// Outcome of a coordination operation that did not succeed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClaimError {
    /// Another agent holds the item. Pick different work.
    #[error("work item {work_id} is held by another agent")]
    Conflict { work_id: WorkId },

    #[error("agent {agent_id} does not hold work item {work_id}")]
    NotOwner { work_id: WorkId, agent_id: AgentId },

    #[error("work item {work_id} is {state}: {reason}")]
    InvalidState {
        work_id: WorkId,
        state: WorkState,
        reason: String,
    },

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("invalid request: {0}")]
    Validation(String),

    #[error("coordination store unavailable: {0}")]
    StoreUnavailable(String),
}

impl ClaimError {
    /// Short machine-readable label, used as the span `outcome`.
    pub fn kind(&self) -> &'static str {
        match self {
            ClaimError::Conflict { .. } => "conflict",
            ClaimError::NotOwner { .. } => "not_owner",
            ClaimError::InvalidState { .. } => "invalid_state",
            ClaimError::NotFound { .. } => "not_found",
            ClaimError::Validation(_) => "validation",
            ClaimError::StoreUnavailable(_) => "store_unavailable",
        }
    }

    /// Everything except an unreachable store can be handled by the caller.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, ClaimError::StoreUnavailable(_))
    }

    fn work_not_found(id: &WorkId) -> Self {
        ClaimError::NotFound {
            entity: "work item",
            id: id.to_string(),
        }
    }

    fn agent_not_found(id: &AgentId) -> Self {
        ClaimError::NotFound {
            entity: "agent",
            id: id.to_string(),
        }
    }
}

type ClaimResult<T> = std::result::Result<T, ClaimError>;

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Attempts at acquiring the store lock before giving up.
    pub claim_attempts: u32,
    /// Pause between contended attempts, multiplied by the attempt number.
    pub contention_pause: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            claim_attempts: 3,
            contention_pause: Duration::from_millis(10),
        }
    }
}

/// A successful claim.
#[derive(Debug, Clone, PartialEq)]
pub struct Claimed {
    pub work_item: WorkItem,
}

/// Why a held item is being returned to the pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReleaseReason {
    /// The owning agent gave the item back.
    Voluntary(String),
    /// The reaper reclaimed the item from a dead or stalled owner.
    Reaped { reason: String },
}

impl std::fmt::Display for ReleaseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReleaseReason::Voluntary(reason) => write!(f, "released: {reason}"),
            ReleaseReason::Reaped { reason } => write!(f, "reaped: {reason}"),
        }
    }
}

/// Per-operation bookkeeping for spans and contention handling.
struct Op {
    name: &'static str,
    work_id: Option<WorkId>,
    agent_id: Option<AgentId>,
}

impl Op {
    fn new(name: &'static str) -> Self {
        Self {
            name,
            work_id: None,
            agent_id: None,
        }
    }

    fn work(mut self, id: WorkId) -> Self {
        self.work_id = Some(id);
        self
    }

    fn agent(mut self, id: AgentId) -> Self {
        self.agent_id = Some(id);
        self
    }
}

struct Inner {
    store: Arc<CoordinationStore>,
    tracer: Tracer,
    config: CoordinatorConfig,
}

/// Public face of the coordination store.
///
/// Cheap to clone. `child_of` returns a clone whose operation spans are
/// parented to the given context, which is how workflow steps link their
/// coordination calls into the run's trace.
///
/// # Example
///
/// ```ignore
/// let coordinator = WorkClaimCoordinator::new(store, tracer);
/// let agent = coordinator.register_agent("core", 1).await?;
/// let item = coordinator.enqueue("analysis", Priority::High).await?;
/// coordinator.claim(&item.id, &agent.id).await?;
/// ```
#[derive(Clone)]
pub struct WorkClaimCoordinator {
    inner: Arc<Inner>,
    parent: Option<SpanContext>,
}

impl WorkClaimCoordinator {
    pub fn new(store: Arc<CoordinationStore>, tracer: Tracer) -> Self {
        Self::with_config(store, tracer, CoordinatorConfig::default())
    }

    pub fn with_config(
        store: Arc<CoordinationStore>,
        tracer: Tracer,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                tracer,
                config,
            }),
            parent: None,
        }
    }

    /// A handle whose spans are children of `parent`.
    pub fn child_of(&self, parent: &SpanContext) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            parent: Some(*parent),
        }
    }

    pub fn store(&self) -> &Arc<CoordinationStore> {
        &self.inner.store
    }

    pub fn tracer(&self) -> &Tracer {
        &self.inner.tracer
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.inner.config
    }

    /// Claim a pending work item for an agent.
    ///
    /// # Errors
    ///
    /// - `Conflict` if another agent already holds the item, or the store
    ///   stayed contended for every attempt
    /// - `InvalidState` if the item is completed or failed
    /// - `NotFound` for an unknown item or agent
    /// - `Validation` if the agent is at capacity
    pub async fn claim(&self, work_id: &WorkId, agent_id: &AgentId) -> ClaimResult<Claimed> {
        let (work_id, agent_id) = (*work_id, *agent_id);
        self.mutate(Op::new("claim").work(work_id).agent(agent_id), |s, now| {
            let item = s
                .work(&work_id)
                .ok_or_else(|| ClaimError::work_not_found(&work_id))?;
            if item.state.is_terminal() {
                return Err(invalid(item, "cannot claim a finished work item"));
            }
            if item.state.is_held() {
                return Err(ClaimError::Conflict { work_id });
            }
            let agent = s
                .agent(&agent_id)
                .ok_or_else(|| ClaimError::agent_not_found(&agent_id))?;
            if !agent.has_capacity() {
                return Err(ClaimError::Validation(format!(
                    "agent {} is at capacity ({})",
                    agent_id, agent.capacity
                )));
            }

            if let Some(agent) = s.agent_mut(&agent_id) {
                agent.acquire();
                agent.touch(now);
            }
            let item = s
                .work_mut(&work_id)
                .ok_or_else(|| ClaimError::work_not_found(&work_id))?;
            advance(item, WorkState::Claimed, now)?;
            item.claimed_by = Some(agent_id);
            Ok(Claimed {
                work_item: item.clone(),
            })
        })
        .await
    }

    /// Move a claimed item to `in_progress`.
    pub async fn start_progress(&self, work_id: &WorkId, agent_id: &AgentId) -> ClaimResult<WorkItem> {
        let (work_id, agent_id) = (*work_id, *agent_id);
        self.mutate(Op::new("start").work(work_id).agent(agent_id), |s, now| {
            let item = owned_item(s, &work_id, &agent_id)?;
            advance(item, WorkState::InProgress, now)?;
            let item = item.clone();
            touch_agent(s, &agent_id, now);
            Ok(item)
        })
        .await
    }

    /// Record progress. `percent` must not be lower than the stored value.
    pub async fn update_progress(
        &self,
        work_id: &WorkId,
        agent_id: &AgentId,
        percent: u8,
    ) -> ClaimResult<WorkItem> {
        if percent > 100 {
            return Err(ClaimError::Validation(format!(
                "progress must be within 0..=100, got {percent}"
            )));
        }
        let (work_id, agent_id) = (*work_id, *agent_id);
        self.mutate(Op::new("progress").work(work_id).agent(agent_id), |s, now| {
            let item = owned_item(s, &work_id, &agent_id)?;
            if item.state != WorkState::InProgress {
                return Err(invalid(item, "progress requires an item in progress"));
            }
            if percent < item.progress {
                let reason = format!("progress may not decrease from {} to {}", item.progress, percent);
                return Err(invalid(item, &reason));
            }
            item.progress = percent;
            item.updated_at = now;
            let item = item.clone();
            touch_agent(s, &agent_id, now);
            Ok(item)
        })
        .await
    }

    /// Finish an item successfully and store its result. Terminal.
    pub async fn complete(
        &self,
        work_id: &WorkId,
        agent_id: &AgentId,
        result: serde_json::Value,
    ) -> ClaimResult<WorkItem> {
        let (work_id, agent_id) = (*work_id, *agent_id);
        self.mutate(Op::new("complete").work(work_id).agent(agent_id), |s, now| {
            let item = owned_item(s, &work_id, &agent_id)?;
            advance(item, WorkState::Completed, now)?;
            item.progress = 100;
            item.result = Some(result.clone());
            let item = item.clone();
            relinquish_agent(s, &agent_id, now);
            Ok(item)
        })
        .await
    }

    /// Mark a held item failed, recording `{"error": reason}`. Terminal.
    pub async fn fail(
        &self,
        work_id: &WorkId,
        agent_id: &AgentId,
        reason: &str,
    ) -> ClaimResult<WorkItem> {
        let (work_id, agent_id) = (*work_id, *agent_id);
        self.mutate(Op::new("fail").work(work_id).agent(agent_id), |s, now| {
            let item = owned_item(s, &work_id, &agent_id)?;
            advance(item, WorkState::Failed, now)?;
            item.result = Some(serde_json::json!({ "error": reason }));
            let item = item.clone();
            relinquish_agent(s, &agent_id, now);
            Ok(item)
        })
        .await
    }

    /// Return a held item to `pending`, resetting its progress.
    ///
    /// `agent_id` must be the current owner. The reaper passes the owner it
    /// observed, so an item re-claimed in the meantime is left alone.
    pub async fn release(
        &self,
        work_id: &WorkId,
        agent_id: &AgentId,
        reason: ReleaseReason,
    ) -> ClaimResult<WorkItem> {
        let (work_id, agent_id) = (*work_id, *agent_id);
        let released = self
            .mutate(Op::new("release").work(work_id).agent(agent_id), |s, now| {
                let item = owned_item(s, &work_id, &agent_id)?;
                return_to_pool(item, now)?;
                let item = item.clone();
                if let Some(agent) = s.agent_mut(&agent_id) {
                    agent.relinquish();
                }
                Ok(item)
            })
            .await?;

        log_release(&work_id, &agent_id, &reason);
        Ok(released)
    }

    /// Release a held item only if it is still abandoned as of `now`.
    ///
    /// The abandonment check runs inside the same transaction as the
    /// release: `owner` must still hold the item and be unregistered,
    /// marked `error`, or silent on the item for longer than `staleness`.
    /// Returns the released item and the reason, or `None` if the item
    /// turned out to be live.
    pub async fn reap(
        &self,
        work_id: &WorkId,
        owner: &AgentId,
        now: DateTime<Utc>,
        staleness: Duration,
    ) -> ClaimResult<Option<(WorkItem, String)>> {
        let (work_id, owner) = (*work_id, *owner);
        let reaped = self
            .mutate(Op::new("reap").work(work_id).agent(owner), |s, at| {
                let item = s
                    .work(&work_id)
                    .ok_or_else(|| ClaimError::work_not_found(&work_id))?;
                if item.state.is_terminal() {
                    return Err(invalid(item, "work item is finished"));
                }
                if !item.is_owned_by(&owner) {
                    return Err(ClaimError::NotOwner {
                        work_id,
                        agent_id: owner,
                    });
                }
                let Some(reason) = item.abandonment(s.agent(&owner), now, staleness) else {
                    return Ok(None);
                };

                let item = s
                    .work_mut(&work_id)
                    .ok_or_else(|| ClaimError::work_not_found(&work_id))?;
                return_to_pool(item, at)?;
                let item = item.clone();
                if let Some(agent) = s.agent_mut(&owner) {
                    agent.relinquish();
                }
                Ok(Some((item, reason)))
            })
            .await?;

        match &reaped {
            Some((_, reason)) => log_release(
                &work_id,
                &owner,
                &ReleaseReason::Reaped {
                    reason: reason.clone(),
                },
            ),
            None => debug!(work_id = %work_id, agent_id = %owner, "item is live again, not reaped"),
        }
        Ok(reaped)
    }

    /// Move a held item from `from` to another registered agent.
    ///
    /// The item keeps its progress and goes back to `claimed`, so the new
    /// holder starts it the same way as a fresh claim.
    ///
    /// # Errors
    ///
    /// - `NotOwner` if `from` does not hold the item
    /// - `NotFound` for an unknown target agent
    /// - `Validation` if the target is the current holder or at capacity
    pub async fn handoff(
        &self,
        work_id: &WorkId,
        from: &AgentId,
        to: &AgentId,
    ) -> ClaimResult<WorkItem> {
        let (work_id, from, to) = (*work_id, *from, *to);
        if from == to {
            return Err(ClaimError::Validation(format!(
                "agent {from} already holds work item {work_id}"
            )));
        }
        let handed = self
            .mutate(Op::new("handoff").work(work_id).agent(from), |s, now| {
                owned_item(s, &work_id, &from)?;
                let target = s
                    .agent(&to)
                    .ok_or_else(|| ClaimError::agent_not_found(&to))?;
                if !target.has_capacity() {
                    return Err(ClaimError::Validation(format!(
                        "agent {} is at capacity ({})",
                        to, target.capacity
                    )));
                }

                let item = owned_item(s, &work_id, &from)?;
                if item.state == WorkState::InProgress {
                    advance(item, WorkState::Claimed, now)?;
                }
                item.claimed_by = Some(to);
                item.updated_at = now;
                let item = item.clone();
                relinquish_agent(s, &from, now);
                if let Some(agent) = s.agent_mut(&to) {
                    agent.acquire();
                    agent.touch(now);
                }
                Ok(item)
            })
            .await?;
        info!(work_id = %work_id, from = %from, to = %to, "work item handed off");
        Ok(handed)
    }

    /// Insert a new pending work item.
    pub async fn enqueue(&self, work_type: &str, priority: Priority) -> ClaimResult<WorkItem> {
        let work_type = work_type.trim();
        if work_type.is_empty() {
            return Err(ClaimError::Validation("work type must not be empty".into()));
        }
        let item = WorkItem::new(WorkId::new(), work_type, priority);
        let op = Op::new("enqueue").work(item.id);
        self.mutate(op, |s, _| {
            if s.insert_work(item.clone()) {
                Ok(item.clone())
            } else {
                Err(ClaimError::Validation(format!("duplicate work id {}", item.id)))
            }
        })
        .await
    }

    /// Register a new agent with the given capacity.
    pub async fn register_agent(&self, team: &str, capacity: u32) -> ClaimResult<Agent> {
        if capacity == 0 {
            return Err(ClaimError::Validation("capacity must be at least 1".into()));
        }
        let agent = Agent::new(AgentId::new(), team, capacity);
        let registered = self
            .mutate(Op::new("register").agent(agent.id), |s, _| {
                s.upsert_agent(agent.clone());
                Ok(agent.clone())
            })
            .await?;
        info!(agent_id = %registered.id, team = %registered.team, capacity, "agent registered");
        Ok(registered)
    }

    /// Refresh an agent's liveness lease.
    pub async fn heartbeat(&self, agent_id: &AgentId) -> ClaimResult<Agent> {
        let agent_id = *agent_id;
        self.mutate(Op::new("heartbeat").agent(agent_id), |s, now| {
            let agent = s
                .agent_mut(&agent_id)
                .ok_or_else(|| ClaimError::agent_not_found(&agent_id))?;
            agent.touch(now);
            Ok(agent.clone())
        })
        .await
    }

    /// Remove an agent, returning every item it held to the pool.
    pub async fn deregister_agent(&self, agent_id: &AgentId) -> ClaimResult<Vec<WorkId>> {
        let agent_id = *agent_id;
        let released = self
            .mutate(Op::new("deregister").agent(agent_id), |s, now| {
                s.remove_agent(&agent_id)
                    .ok_or_else(|| ClaimError::agent_not_found(&agent_id))?;
                let held: Vec<WorkId> = s
                    .work_items()
                    .filter(|w| w.state.is_held() && w.is_owned_by(&agent_id))
                    .map(|w| w.id)
                    .collect();
                for id in &held {
                    if let Some(item) = s.work_mut(id) {
                        return_to_pool(item, now)?;
                    }
                }
                Ok(held)
            })
            .await?;
        info!(agent_id = %agent_id, released = released.len(), "agent deregistered");
        Ok(released)
    }

    /// Mark agents whose heartbeat is older than `liveness` as `error`.
    ///
    /// Returns the ids that changed status in this call.
    pub async fn expire_agents(
        &self,
        now: DateTime<Utc>,
        liveness: Duration,
    ) -> ClaimResult<Vec<AgentId>> {
        self.mutate(Op::new("expire"), |s, _| {
            let expired: Vec<AgentId> = s
                .agents()
                .filter(|a| a.status != AgentStatus::Error && !a.is_live(now, liveness))
                .map(|a| a.id)
                .collect();
            for id in &expired {
                if let Some(agent) = s.agent_mut(id) {
                    agent.status = AgentStatus::Error;
                }
            }
            Ok(expired)
        })
        .await
    }

    /// Pending items, most urgent first, oldest first within a priority.
    pub async fn next_claimable(&self, limit: usize) -> ClaimResult<Vec<WorkItem>> {
        self.query(Op::new("next_claimable"), |s| {
            let mut pending: Vec<WorkItem> = s
                .work_items()
                .filter(|w| w.state == WorkState::Pending)
                .cloned()
                .collect();
            pending.sort_by(|a, b| {
                b.priority
                    .cmp(&a.priority)
                    .then(a.created_at.cmp(&b.created_at))
            });
            pending.truncate(limit);
            Ok(pending)
        })
        .await
    }

    pub async fn status(&self, work_id: &WorkId) -> ClaimResult<WorkItem> {
        let work_id = *work_id;
        self.query(Op::new("status").work(work_id), |s| {
            s.work(&work_id)
                .cloned()
                .ok_or_else(|| ClaimError::work_not_found(&work_id))
        })
        .await
    }

    pub async fn agent(&self, agent_id: &AgentId) -> ClaimResult<Agent> {
        let agent_id = *agent_id;
        self.query(Op::new("agent").agent(agent_id), |s| {
            s.agent(&agent_id)
                .cloned()
                .ok_or_else(|| ClaimError::agent_not_found(&agent_id))
        })
        .await
    }

    /// Full read-only snapshot for dashboards and health checks.
    pub async fn snapshot(&self) -> ClaimResult<StoreSnapshot> {
        self.inner
            .store
            .snapshot()
            .await
            .map_err(|e| ClaimError::StoreUnavailable(e.to_string()))
    }

    async fn mutate<T, F>(&self, op: Op, f: F) -> ClaimResult<T>
    where
        F: Fn(&mut StoreState, DateTime<Utc>) -> ClaimResult<T>,
    {
        let mut span = self.open_span(&op);
        let mut attempt = 0;
        let outcome = loop {
            attempt += 1;
            match self.inner.store.transact(|s| f(s, Utc::now())).await {
                Ok(result) => break result,
                Err(e) => match self.contention(&op, attempt, e).await {
                    Some(err) => break Err(err),
                    None => continue,
                },
            }
        };
        span.set_attribute("attempts", attempt);
        self.close_span(span, &op, &outcome);
        outcome
    }

    async fn query<T, F>(&self, op: Op, f: F) -> ClaimResult<T>
    where
        F: Fn(&StoreState) -> ClaimResult<T>,
    {
        let span = self.open_span(&op);
        let mut attempt = 0;
        let outcome = loop {
            attempt += 1;
            match self.inner.store.read(&f).await {
                Ok(result) => break result,
                Err(e) => match self.contention(&op, attempt, e).await {
                    Some(err) => break Err(err),
                    None => continue,
                },
            }
        };
        self.close_span(span, &op, &outcome);
        outcome
    }

    /// Decide whether a store failure is retried (`None`) or final.
    async fn contention(&self, op: &Op, attempt: u32, err: StoreError) -> Option<ClaimError> {
        match err {
            StoreError::Busy(wait) if attempt < self.inner.config.claim_attempts => {
                debug!(op = op.name, attempt, ?wait, "store contended, retrying");
                tokio::time::sleep(self.inner.config.contention_pause * attempt).await;
                None
            }
            StoreError::Busy(_) => match (op.name, op.work_id) {
                ("claim", Some(work_id)) => Some(ClaimError::Conflict { work_id }),
                _ => Some(ClaimError::StoreUnavailable(format!(
                    "store lock contended after {attempt} attempts"
                ))),
            },
            StoreError::Unavailable(msg) => Some(ClaimError::StoreUnavailable(msg)),
        }
    }

    fn open_span(&self, op: &Op) -> crate::telemetry::SpanHandle {
        let mut span = self
            .inner
            .tracer
            .start_span(&format!("coord.{}", op.name), self.parent.as_ref());
        if let Some(work_id) = op.work_id {
            span.set_attribute("work_id", work_id);
        }
        if let Some(agent_id) = op.agent_id {
            span.set_attribute("agent_id", agent_id);
        }
        span
    }

    fn close_span<T>(&self, span: crate::telemetry::SpanHandle, op: &Op, outcome: &ClaimResult<T>) {
        let (status, label) = match outcome {
            Ok(_) => (SpanStatus::Ok, "ok"),
            Err(e @ ClaimError::Conflict { .. }) => {
                debug!(op = op.name, work_id = ?op.work_id, agent_id = ?op.agent_id, "claim conflict");
                (SpanStatus::Ok, e.kind())
            }
            Err(e @ ClaimError::StoreUnavailable(_)) => {
                error!(op = op.name, error = %e, "coordination store unavailable");
                (SpanStatus::Error, e.kind())
            }
            Err(e @ ClaimError::NotOwner { .. }) => {
                warn!(op = op.name, error = %e, "operation on work not held by caller");
                (SpanStatus::Error, e.kind())
            }
            Err(e) => {
                debug!(op = op.name, error = %e, "operation rejected");
                (SpanStatus::Error, e.kind())
            }
        };
        let mut attributes = BTreeMap::new();
        attributes.insert("outcome".to_string(), label.to_string());
        self.inner.tracer.end_span(span, status, attributes);
    }
}

impl std::fmt::Debug for WorkClaimCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkClaimCoordinator")
            .field("config", &self.inner.config)
            .field("parent", &self.parent)
            .finish()
    }
}

fn invalid(item: &WorkItem, reason: &str) -> ClaimError {
    ClaimError::InvalidState {
        work_id: item.id,
        state: item.state,
        reason: reason.to_string(),
    }
}

/// Move an item to `to` if the lifecycle table allows it.
fn advance(item: &mut WorkItem, to: WorkState, now: DateTime<Utc>) -> ClaimResult<()> {
    if !item.state.can_transition_to(to) {
        let reason = format!("cannot move from {} to {}", item.state, to);
        return Err(invalid(item, &reason));
    }
    item.state = to;
    item.updated_at = now;
    Ok(())
}

/// Back to `pending` with no holder and no progress.
fn return_to_pool(item: &mut WorkItem, now: DateTime<Utc>) -> ClaimResult<()> {
    advance(item, WorkState::Pending, now)?;
    item.claimed_by = None;
    item.progress = 0;
    Ok(())
}

fn log_release(work_id: &WorkId, agent_id: &AgentId, reason: &ReleaseReason) {
    match reason {
        ReleaseReason::Reaped { .. } => warn!(
            work_id = %work_id,
            agent_id = %agent_id,
            %reason,
            "work item reclaimed"
        ),
        ReleaseReason::Voluntary(_) => info!(
            work_id = %work_id,
            agent_id = %agent_id,
            %reason,
            "work item released"
        ),
    }
}

/// Look up an item for a mutation by its owner.
///
/// Finished items answer `InvalidState` regardless of caller; otherwise the
/// caller must be the current holder.
fn owned_item<'a>(
    s: &'a mut StoreState,
    work_id: &WorkId,
    agent_id: &AgentId,
) -> ClaimResult<&'a mut WorkItem> {
    let item = s
        .work_mut(work_id)
        .ok_or_else(|| ClaimError::work_not_found(work_id))?;
    if item.state.is_terminal() {
        return Err(invalid(item, "work item is finished"));
    }
    if !item.is_owned_by(agent_id) {
        return Err(ClaimError::NotOwner {
            work_id: *work_id,
            agent_id: *agent_id,
        });
    }
    Ok(item)
}

fn touch_agent(s: &mut StoreState, agent_id: &AgentId, now: DateTime<Utc>) {
    if let Some(agent) = s.agent_mut(agent_id) {
        agent.touch(now);
    }
}

fn relinquish_agent(s: &mut StoreState, agent_id: &AgentId, now: DateTime<Utc>) {
    if let Some(agent) = s.agent_mut(agent_id) {
        agent.relinquish();
        agent.touch(now);
    }
}
