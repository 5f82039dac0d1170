//! Agents as concurrent actors.
//!
//! A `Worker` is one registered agent pulling work through the coordinator
//! and running the workflow registered for each item's type. A `Swarm`
//! starts a fleet of workers together with the reaper and metrics actors,
//! all under one parent cancellation token.

use futures::future::join_all;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::actors::{ActorHandle, HeartbeatActor, MetricsActor, ReaperActor};
use crate::coordination::{
    ClaimError, ReapReport, Reaper, ReaperConfig, ReleaseReason, WorkClaimCoordinator, WorkItem,
};
use crate::health::{HealthAggregator, HealthConfig, HealthReport};
use crate::id::{AgentId, WorkId};
use crate::telemetry::SpanStatus;
use crate::workflow::{RetryPolicy, Workflow, WorkflowEngine};
use crate::Error;

/// Maps a work item's `type` to the workflow that processes it.
#[derive(Debug, Clone, Default)]
pub struct WorkflowRegistry {
    workflows: HashMap<String, Arc<Workflow>>,
}

impl WorkflowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `workflow` for `work_type`, replacing any previous entry.
    pub fn register(&mut self, work_type: &str, workflow: Workflow) -> &mut Self {
        self.workflows
            .insert(work_type.to_string(), Arc::new(workflow));
        self
    }

    pub fn get(&self, work_type: &str) -> Option<Arc<Workflow>> {
        self.workflows.get(work_type).cloned()
    }

    pub fn contains(&self, work_type: &str) -> bool {
        self.workflows.contains_key(work_type)
    }

    pub fn work_types(&self) -> impl Iterator<Item = &str> {
        self.workflows.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.workflows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workflows.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub team: String,
    /// Items the agent holds and works at once.
    pub capacity: u32,
    /// Pause between polls when no work could be claimed.
    pub poll_interval: Duration,
    pub heartbeat_interval: Duration,
    /// Ceiling for the pause after repeated store failures.
    pub max_backoff: Duration,
    /// How many pending candidates to look at per poll.
    pub candidates: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            team: "default".to_string(),
            capacity: 1,
            poll_interval: Duration::from_millis(100),
            heartbeat_interval: Duration::from_secs(15),
            max_backoff: Duration::from_secs(5),
            candidates: 8,
        }
    }
}

/// Result of one `Worker::work_once` pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkOutcome {
    /// Nothing was pending.
    Idle,
    /// Every candidate was claimed by someone else first.
    Conflicted,
    Completed(WorkId),
    Failed(WorkId),
    /// The item went back to the pool, usually on cancellation.
    Released(WorkId),
    /// The claim was lost mid-run, typically to the reaper.
    Lost(WorkId),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WorkerStats {
    pub completed: u64,
    pub failed: u64,
    pub released: u64,
    pub lost: u64,
    pub conflicts: u64,
    pub store_errors: u64,
}

impl WorkerStats {
    fn record(&mut self, outcome: &WorkOutcome) {
        match outcome {
            WorkOutcome::Idle => {}
            WorkOutcome::Conflicted => self.conflicts += 1,
            WorkOutcome::Completed(_) => self.completed += 1,
            WorkOutcome::Failed(_) => self.failed += 1,
            WorkOutcome::Released(_) => self.released += 1,
            WorkOutcome::Lost(_) => self.lost += 1,
        }
    }

    fn merge(&mut self, other: &WorkerStats) {
        self.completed += other.completed;
        self.failed += other.failed;
        self.released += other.released;
        self.lost += other.lost;
        self.conflicts += other.conflicts;
        self.store_errors += other.store_errors;
    }
}

/// One agent pulling and processing work.
pub struct Worker {
    agent_id: AgentId,
    coordinator: WorkClaimCoordinator,
    engine: WorkflowEngine,
    registry: Arc<WorkflowRegistry>,
    config: WorkerConfig,
}

impl Worker {
    /// Register a new agent and wrap it in a worker.
    pub async fn register(
        coordinator: WorkClaimCoordinator,
        engine: WorkflowEngine,
        registry: Arc<WorkflowRegistry>,
        config: WorkerConfig,
    ) -> Result<Self, ClaimError> {
        let agent = coordinator
            .register_agent(&config.team, config.capacity)
            .await?;
        info!(agent_id = %agent.id, team = %config.team, "worker registered");
        Ok(Self {
            agent_id: agent.id,
            coordinator,
            engine,
            registry,
            config,
        })
    }

    pub fn agent_id(&self) -> AgentId {
        self.agent_id
    }

    /// Claim and process at most one item.
    ///
    /// Candidates are tried in priority order; losing a claim moves on to
    /// the next one. Only `StoreUnavailable` is returned as an error.
    pub async fn work_once(&self, cancel: &CancellationToken) -> Result<WorkOutcome, ClaimError> {
        let candidates = self
            .coordinator
            .next_claimable(self.config.candidates)
            .await?;
        if candidates.is_empty() {
            return Ok(WorkOutcome::Idle);
        }

        for candidate in candidates {
            match self.coordinator.claim(&candidate.id, &self.agent_id).await {
                Ok(claimed) => return self.process(claimed.work_item, cancel).await,
                Err(ClaimError::Conflict { .. }) => {
                    debug!(agent_id = %self.agent_id, work_id = %candidate.id, "lost claim, trying next");
                }
                Err(e @ ClaimError::StoreUnavailable(_)) => return Err(e),
                Err(e) => {
                    debug!(agent_id = %self.agent_id, work_id = %candidate.id, error = %e, "candidate skipped");
                }
            }
        }
        Ok(WorkOutcome::Conflicted)
    }

    async fn process(
        &self,
        item: WorkItem,
        cancel: &CancellationToken,
    ) -> Result<WorkOutcome, ClaimError> {
        let tracer = self.engine.tracer();
        let mut span = tracer.start_span("worker.process", None);
        span.set_attribute("agent_id", self.agent_id);
        span.set_attribute("work_id", item.id);
        span.set_attribute("type", &item.work_type);
        let coordinator = self.coordinator.child_of(&span.context());
        let work_id = item.id;

        let item = match coordinator.start_progress(&work_id, &self.agent_id).await {
            Ok(item) => item,
            Err(e @ ClaimError::StoreUnavailable(_)) => return Err(e),
            Err(e) => {
                warn!(agent_id = %self.agent_id, work_id = %work_id, error = %e, "claim lost before start");
                span.end(SpanStatus::Error);
                return Ok(WorkOutcome::Lost(work_id));
            }
        };

        let Some(workflow) = self.registry.get(&item.work_type) else {
            let reason = Error::UnknownWorkType(item.work_type.clone()).to_string();
            warn!(agent_id = %self.agent_id, work_id = %work_id, %reason, "no workflow for item");
            let outcome = settle(
                coordinator.fail(&work_id, &self.agent_id, &reason).await,
                WorkOutcome::Failed(work_id),
            )?;
            span.end(SpanStatus::Error);
            return Ok(outcome);
        };

        let parent = span.context();
        let result = self
            .engine
            .execute_with_parent(&workflow, item, cancel.child_token(), Some(&parent))
            .await;

        let outcome = if result.is_success() {
            settle(
                coordinator
                    .complete(&work_id, &self.agent_id, result.outputs_json())
                    .await,
                WorkOutcome::Completed(work_id),
            )?
        } else if result.was_cancelled() {
            settle(
                coordinator
                    .release(
                        &work_id,
                        &self.agent_id,
                        ReleaseReason::Voluntary("cancelled".to_string()),
                    )
                    .await,
                WorkOutcome::Released(work_id),
            )?
        } else {
            let reason = match &result.error {
                Some((step, e)) => format!("{step}: {e}"),
                None => "workflow failed".to_string(),
            };
            match coordinator.fail(&work_id, &self.agent_id, &reason).await {
                Ok(_) => WorkOutcome::Failed(work_id),
                // The coordination middleware may have failed the item already.
                Err(ClaimError::InvalidState { .. }) => WorkOutcome::Failed(work_id),
                other => settle(other, WorkOutcome::Failed(work_id))?,
            }
        };

        let status = match outcome {
            WorkOutcome::Completed(_) => SpanStatus::Ok,
            _ => SpanStatus::Error,
        };
        span.set_attribute("outcome", format!("{outcome:?}"));
        span.end(status);
        Ok(outcome)
    }

    /// Poll for work until `cancel` fires, then deregister.
    ///
    /// The agent works `capacity` items at a time: one polling lane per
    /// unit of capacity, all sharing the agent's identity and heartbeat.
    pub async fn run(self, cancel: CancellationToken) -> WorkerStats {
        let heartbeat = HeartbeatActor::new(self.coordinator.clone(), self.agent_id)
            .with_interval(self.config.heartbeat_interval)
            .spawn_with(cancel.child_token());

        let lanes = self.config.capacity.max(1) as usize;
        let mut stats = WorkerStats::default();
        for lane in join_all((0..lanes).map(|_| self.poll(&cancel))).await {
            stats.merge(&lane);
        }

        heartbeat.stop().await;
        match self.coordinator.deregister_agent(&self.agent_id).await {
            Ok(released) if !released.is_empty() => {
                info!(agent_id = %self.agent_id, released = released.len(), "worker released held work on exit")
            }
            Ok(_) => {}
            Err(e) => warn!(agent_id = %self.agent_id, error = %e, "deregister failed"),
        }
        info!(agent_id = %self.agent_id, completed = stats.completed, failed = stats.failed, "worker stopped");
        stats
    }

    /// One lane of the polling loop.
    async fn poll(&self, cancel: &CancellationToken) -> WorkerStats {
        let mut stats = WorkerStats::default();
        let mut backoff = self.config.poll_interval;

        loop {
            if cancel.is_cancelled() {
                break;
            }

            let pause = match self.work_once(cancel).await {
                Ok(outcome) => {
                    stats.record(&outcome);
                    backoff = self.config.poll_interval;
                    match outcome {
                        WorkOutcome::Idle | WorkOutcome::Conflicted => {
                            Some(self.config.poll_interval)
                        }
                        _ => None,
                    }
                }
                Err(e) => {
                    stats.store_errors += 1;
                    error!(agent_id = %self.agent_id, error = %e, backoff_ms = backoff.as_millis() as u64, "store unavailable, backing off");
                    let pause = backoff;
                    backoff = (backoff * 2).min(self.config.max_backoff);
                    Some(pause)
                }
            };

            if let Some(pause) = pause {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(pause) => {}
                }
            }
        }
        stats
    }

    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<WorkerStats> {
        tokio::spawn(self.run(cancel))
    }
}

/// Map a coordinator result onto an outcome, treating a lost claim as
/// `Lost` and only store failures as errors.
fn settle<T>(
    result: Result<T, ClaimError>,
    outcome: WorkOutcome,
) -> Result<WorkOutcome, ClaimError> {
    match result {
        Ok(_) => Ok(outcome),
        Err(e @ ClaimError::StoreUnavailable(_)) => Err(e),
        Err(e) => {
            let work_id = match &outcome {
                WorkOutcome::Completed(id)
                | WorkOutcome::Failed(id)
                | WorkOutcome::Released(id)
                | WorkOutcome::Lost(id) => *id,
                WorkOutcome::Idle | WorkOutcome::Conflicted => return Ok(outcome),
            };
            warn!(work_id = %work_id, error = %e, "claim lost while settling");
            Ok(WorkOutcome::Lost(work_id))
        }
    }
}

#[derive(Debug, Clone)]
pub struct SwarmConfig {
    pub workers: usize,
    pub worker: WorkerConfig,
    pub retry: RetryPolicy,
    pub reaper: ReaperConfig,
    pub reaper_interval: Duration,
    pub health: HealthConfig,
    pub metrics_interval: Duration,
}

impl Default for SwarmConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            worker: WorkerConfig::default(),
            retry: RetryPolicy::default(),
            reaper: ReaperConfig::default(),
            reaper_interval: Duration::from_secs(30),
            health: HealthConfig::default(),
            metrics_interval: Duration::from_secs(60),
        }
    }
}

/// A fleet of workers plus the background actors that keep it healthy.
pub struct Swarm {
    coordinator: WorkClaimCoordinator,
    registry: Arc<WorkflowRegistry>,
    config: SwarmConfig,
}

impl Swarm {
    pub fn new(
        coordinator: WorkClaimCoordinator,
        registry: WorkflowRegistry,
        config: SwarmConfig,
    ) -> Self {
        Self {
            coordinator,
            registry: Arc::new(registry),
            config,
        }
    }

    /// Register every worker and start all tasks.
    pub async fn start(self) -> Result<SwarmHandle, ClaimError> {
        let cancel = CancellationToken::new();
        let tracer = self.coordinator.tracer().clone();
        let spans = tracer.subscribe();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (health_tx, health_rx) = mpsc::unbounded_channel();
        let (reaps_tx, reaps_rx) = mpsc::unbounded_channel();

        let engine = WorkflowEngine::with_default_stack(
            tracer,
            self.coordinator.clone(),
            self.config.retry.clone(),
        )
        .with_events(events_tx);

        let mut workers = Vec::with_capacity(self.config.workers);
        let mut agents = Vec::with_capacity(self.config.workers);
        for _ in 0..self.config.workers {
            let worker = Worker::register(
                self.coordinator.clone(),
                engine.clone(),
                Arc::clone(&self.registry),
                self.config.worker.clone(),
            )
            .await?;
            agents.push(worker.agent_id());
            workers.push(worker.spawn(cancel.child_token()));
        }

        let reaper = ReaperActor::new(Reaper::new(
            self.coordinator.clone(),
            self.config.reaper.clone(),
        ))
        .with_interval(self.config.reaper_interval)
        .with_reports(reaps_tx)
        .spawn_with(cancel.child_token());

        let metrics = MetricsActor::new(
            self.coordinator.clone(),
            HealthAggregator::new(self.config.health.clone()),
            spans,
        )
        .with_events(events_rx)
        .with_interval(self.config.metrics_interval)
        .with_reports(health_tx)
        .spawn_with(cancel.child_token());

        info!(workers = agents.len(), "swarm started");

        Ok(SwarmHandle {
            cancel,
            coordinator: self.coordinator,
            agents,
            workers,
            actors: vec![reaper, metrics],
            health: health_rx,
            reaps: reaps_rx,
        })
    }
}

/// Handle to a running swarm.
pub struct SwarmHandle {
    cancel: CancellationToken,
    coordinator: WorkClaimCoordinator,
    agents: Vec<AgentId>,
    workers: Vec<JoinHandle<WorkerStats>>,
    actors: Vec<ActorHandle>,
    health: mpsc::UnboundedReceiver<HealthReport>,
    reaps: mpsc::UnboundedReceiver<ReapReport>,
}

impl SwarmHandle {
    pub fn agents(&self) -> &[AgentId] {
        &self.agents
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn health_reports(&mut self) -> &mut mpsc::UnboundedReceiver<HealthReport> {
        &mut self.health
    }

    pub fn reap_reports(&mut self) -> &mut mpsc::UnboundedReceiver<ReapReport> {
        &mut self.reaps
    }

    /// Wait until no item is pending or held.
    pub async fn wait_idle(&self, poll: Duration) -> Result<(), ClaimError> {
        loop {
            let snapshot = self.coordinator.snapshot().await?;
            if snapshot.work_items.iter().all(|item| item.state.is_terminal()) {
                return Ok(());
            }
            tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep(poll) => {}
            }
        }
    }

    /// Cancel every task and collect the workers' combined stats.
    pub async fn shutdown(self) -> WorkerStats {
        self.cancel.cancel();
        let mut total = WorkerStats::default();
        for worker in self.workers {
            match worker.await {
                Ok(stats) => total.merge(&stats),
                Err(e) => error!(error = %e, "worker task panicked"),
            }
        }
        for actor in self.actors {
            actor.stop().await;
        }
        info!(
            completed = total.completed,
            failed = total.failed,
            conflicts = total.conflicts,
            "swarm stopped"
        );
        total
    }
}
