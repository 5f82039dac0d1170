//! Executes a workflow for one work item.

use futures::stream::{FuturesUnordered, StreamExt};
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::coordination::{WorkClaimCoordinator, WorkItem};
use crate::error::{Error, Result};
use crate::id::{RunId, WorkId};
use crate::telemetry::{SpanContext, SpanStatus, TraceSpan, Tracer};

use super::graph::StepGraph;
use super::middleware::{
    CoordinationMiddleware, Middleware, Next, RetryMiddleware, RetryPolicy, TracingMiddleware,
};
use super::run::{RunState, StepState, WorkflowRun};
use super::step::{RunProgress, Step, StepContext, StepError};

/// A named, validated set of steps and their dependencies.
#[derive(Debug, Clone)]
pub struct Workflow {
    name: String,
    steps: HashMap<String, Step>,
    order: Vec<String>,
    graph: StepGraph,
    layers: Vec<Vec<String>>,
}

impl Workflow {
    pub fn builder(name: &str) -> WorkflowBuilder {
        WorkflowBuilder {
            name: name.to_string(),
            steps: Vec::new(),
            last_stage: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Step names in declaration order.
    pub fn step_names(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(String::as_str)
    }

    pub fn step(&self, name: &str) -> Option<&Step> {
        self.steps.get(name)
    }

    /// Groups of steps that run concurrently, in execution order.
    pub fn layers(&self) -> &[Vec<String>] {
        &self.layers
    }

    pub fn graph(&self) -> &StepGraph {
        &self.graph
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

/// Builds a `Workflow`.
///
/// `step` appends a step that depends on the previous stage, `parallel`
/// appends a stage of mutually independent steps, and `step_after` names
/// dependencies explicitly.
///
/// # Example
///
/// ```
/// use hive::workflow::{Step, Workflow};
/// use serde_json::json;
///
/// let workflow = Workflow::builder("build")
///     .step(Step::from_fn("checkout", |_| async { Ok(json!(null)) }))
///     .parallel(vec![
///         Step::from_fn("lint", |_| async { Ok(json!(null)) }),
///         Step::from_fn("test", |_| async { Ok(json!(null)) }),
///     ])
///     .step(Step::from_fn("package", |_| async { Ok(json!(null)) }))
///     .build()
///     .unwrap();
///
/// assert_eq!(workflow.layers().len(), 3);
/// assert_eq!(workflow.layers()[1], vec!["lint", "test"]);
/// ```
pub struct WorkflowBuilder {
    name: String,
    steps: Vec<(Step, Vec<String>)>,
    last_stage: Vec<String>,
}

impl WorkflowBuilder {
    pub fn step(mut self, step: Step) -> Self {
        let deps = self.last_stage.clone();
        self.last_stage = vec![step.name.clone()];
        self.steps.push((step, deps));
        self
    }

    pub fn parallel(mut self, steps: Vec<Step>) -> Self {
        let deps = self.last_stage.clone();
        self.last_stage = steps.iter().map(|s| s.name.clone()).collect();
        for step in steps {
            self.steps.push((step, deps.clone()));
        }
        self
    }

    pub fn step_after(mut self, step: Step, dependencies: &[&str]) -> Self {
        let deps = dependencies.iter().map(|d| d.to_string()).collect();
        self.last_stage = vec![step.name.clone()];
        self.steps.push((step, deps));
        self
    }

    /// Validate and freeze the workflow.
    ///
    /// # Errors
    /// Returns `Error::Validation` for an empty workflow, duplicate step
    /// names, unknown dependencies, or dependency cycles.
    pub fn build(self) -> Result<Workflow> {
        if self.steps.is_empty() {
            return Err(Error::Validation(format!(
                "workflow {} has no steps",
                self.name
            )));
        }

        let mut graph = StepGraph::new();
        for (step, _) in &self.steps {
            graph.add_step(&step.name)?;
        }
        for (step, deps) in &self.steps {
            for dep in deps {
                graph.add_dependency(&step.name, dep)?;
            }
        }
        let layers = graph.layers()?;

        let order = self.steps.iter().map(|(s, _)| s.name.clone()).collect();
        let steps = self
            .steps
            .into_iter()
            .map(|(s, _)| (s.name.clone(), s))
            .collect();

        Ok(Workflow {
            name: self.name,
            steps,
            order,
            graph,
            layers,
        })
    }
}

/// Lifecycle notifications for observers such as the health aggregator.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum WorkflowEvent {
    RunStarted {
        run_id: RunId,
        work_id: WorkId,
        workflow: String,
    },
    StepFinished {
        run_id: RunId,
        step: String,
        state: StepState,
        attempts: u32,
        duration: Duration,
    },
    RunFinished {
        run_id: RunId,
        work_id: WorkId,
        state: RunState,
        duration: Duration,
    },
}

/// Outcome of `WorkflowEngine::execute`.
#[derive(Debug, Clone)]
pub struct WorkflowResult {
    pub run: WorkflowRun,
    /// Outputs of every step that succeeded, keyed by step name.
    pub outputs: BTreeMap<String, Value>,
    pub root_span: TraceSpan,
    /// The first step failure, if any.
    pub error: Option<(String, StepError)>,
}

impl WorkflowResult {
    pub fn is_success(&self) -> bool {
        self.run.state == RunState::Completed
    }

    pub fn was_cancelled(&self) -> bool {
        matches!(self.error, Some((_, StepError::Cancelled)))
    }

    pub fn outputs_json(&self) -> Value {
        Value::Object(self.outputs.clone().into_iter().collect())
    }
}

/// Runs workflows through the middleware pipeline.
///
/// # Example
///
/// ```ignore
/// let engine = WorkflowEngine::with_default_stack(tracer, coordinator, RetryPolicy::default());
/// let result = engine.execute(&workflow, claimed.work_item, cancel).await;
/// ```
#[derive(Clone)]
pub struct WorkflowEngine {
    tracer: Tracer,
    middleware: Vec<Arc<dyn Middleware>>,
    events: Option<mpsc::UnboundedSender<WorkflowEvent>>,
}

impl WorkflowEngine {
    /// An engine with no middleware.
    pub fn new(tracer: Tracer) -> Self {
        Self {
            tracer,
            middleware: Vec::new(),
            events: None,
        }
    }

    /// Tracing, then coordination, then retry (outermost first).
    pub fn with_default_stack(
        tracer: Tracer,
        coordinator: WorkClaimCoordinator,
        retry: RetryPolicy,
    ) -> Self {
        Self::new(tracer.clone())
            .with_middleware(TracingMiddleware::new(tracer))
            .with_middleware(CoordinationMiddleware::new(coordinator))
            .with_middleware(RetryMiddleware::new(retry))
    }

    /// Append a middleware inside those already added.
    pub fn with_middleware(mut self, middleware: impl Middleware + 'static) -> Self {
        self.middleware.push(Arc::new(middleware));
        self
    }

    pub fn with_events(mut self, events: mpsc::UnboundedSender<WorkflowEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn tracer(&self) -> &Tracer {
        &self.tracer
    }

    /// Execute a workflow in a new trace.
    pub async fn execute(
        &self,
        workflow: &Workflow,
        work_item: WorkItem,
        cancel: CancellationToken,
    ) -> WorkflowResult {
        self.execute_with_parent(workflow, work_item, cancel, None)
            .await
    }

    /// Execute a workflow, parenting the run span to `parent` if given.
    ///
    /// Layers run in order and the steps of a layer run concurrently. The
    /// first failure stops further layers once its siblings settle; then
    /// every succeeded step is compensated in reverse completion order and
    /// the run ends `failed`. Cancellation aborts in-flight steps and goes
    /// straight to compensation.
    pub async fn execute_with_parent(
        &self,
        workflow: &Workflow,
        work_item: WorkItem,
        cancel: CancellationToken,
        parent: Option<&SpanContext>,
    ) -> WorkflowResult {
        let started = Instant::now();
        let mut run = WorkflowRun::new(work_item.id, workflow.name(), workflow.step_names());
        let mut root = self.tracer.start_span("workflow.run", parent);
        root.set_attribute("workflow", workflow.name());
        root.set_attribute("work_id", work_item.id);
        root.set_attribute("run_id", run.id);
        let root_context = root.context();

        info!(run_id = %run.id, workflow = %workflow.name(), work_id = %work_item.id, "workflow run started");
        self.emit(WorkflowEvent::RunStarted {
            run_id: run.id,
            work_id: work_item.id,
            workflow: workflow.name().to_string(),
        });

        let chain: Arc<[Arc<dyn Middleware>]> = self.middleware.clone().into();
        let progress = Arc::new(RunProgress::new(workflow.len()));
        let mut outputs: BTreeMap<String, Value> = BTreeMap::new();
        let mut completed: Vec<String> = Vec::new();
        let mut failure: Option<(String, StepError)> = None;

        for layer in workflow.layers() {
            if cancel.is_cancelled() {
                failure = Some((layer.join(","), StepError::Cancelled));
                break;
            }

            let inputs = Arc::new(outputs.clone());
            let mut in_flight = FuturesUnordered::new();
            for name in layer {
                let Some(step) = workflow.step(name) else {
                    continue;
                };
                if let Some(result) = run.step_mut(name) {
                    result.state = StepState::Running;
                }
                let mut ctx = StepContext::new(
                    run.id,
                    name,
                    work_item.clone(),
                    root_context,
                    cancel.clone(),
                )
                .with_inputs(Arc::clone(&inputs))
                .with_progress(Arc::clone(&progress));
                ctx.retry = step.retry.clone();

                let next = Next::new(Arc::clone(&step.handler), Arc::clone(&chain));
                in_flight.push(async move {
                    let step_started = Instant::now();
                    let finished = ctx.clone();
                    let result = next.run(ctx).await;
                    (finished, result, step_started.elapsed())
                });
            }

            while let Some((ctx, result, elapsed)) = in_flight.next().await {
                let attempts = ctx.invocations();
                let state = if result.is_ok() {
                    StepState::Succeeded
                } else {
                    StepState::Failed
                };
                if let Some(step) = run.step_mut(&ctx.step) {
                    step.state = state;
                    step.attempt_count = attempts;
                    step.error = result.as_ref().err().map(ToString::to_string);
                }
                self.emit(WorkflowEvent::StepFinished {
                    run_id: run.id,
                    step: ctx.step.clone(),
                    state,
                    attempts,
                    duration: elapsed,
                });

                match result {
                    Ok(output) => {
                        debug!(run_id = %run.id, step = %ctx.step, attempts, "step succeeded");
                        outputs.insert(ctx.step.clone(), output);
                        completed.push(ctx.step);
                    }
                    Err(e) => {
                        warn!(run_id = %run.id, step = %ctx.step, attempts, error = %e, "step failed");
                        // Keep the first real failure over cancellations it caused.
                        let replace = match &failure {
                            None => true,
                            Some((_, StepError::Cancelled)) => e != StepError::Cancelled,
                            Some(_) => false,
                        };
                        if replace {
                            failure = Some((ctx.step, e));
                        }
                    }
                }
            }

            if failure.is_some() {
                break;
            }
        }

        let status = match &failure {
            None => {
                advance(&mut run, RunState::Completed);
                SpanStatus::Ok
            }
            Some((step, error)) => {
                root.set_attribute("failed_step", step);
                root.set_attribute("error", error);
                advance(&mut run, RunState::Compensating);
                self.compensate(workflow, &mut run, &work_item, &completed, &outputs, &root_context)
                    .await;
                advance(&mut run, RunState::Failed);
                SpanStatus::Error
            }
        };

        let root_span = root.end(status);
        let duration = started.elapsed();
        info!(
            run_id = %run.id,
            state = %run.state,
            duration_ms = duration.as_millis() as u64,
            "workflow run finished"
        );
        self.emit(WorkflowEvent::RunFinished {
            run_id: run.id,
            work_id: work_item.id,
            state: run.state,
            duration,
        });

        WorkflowResult {
            run,
            outputs,
            root_span,
            error: failure,
        }
    }

    /// Undo succeeded steps, newest first. Failures are logged and skipped.
    async fn compensate(
        &self,
        workflow: &Workflow,
        run: &mut WorkflowRun,
        work_item: &WorkItem,
        completed: &[String],
        outputs: &BTreeMap<String, Value>,
        root: &SpanContext,
    ) {
        // A fresh token: compensation must finish even after cancellation.
        let cancel = CancellationToken::new();
        for name in completed.iter().rev() {
            let Some(step) = workflow.step(name) else {
                continue;
            };
            let mut span = self.tracer.start_span("workflow.compensate", Some(root));
            span.set_attribute("step", name);
            span.set_attribute("run_id", run.id);

            let ctx = StepContext::new(run.id, name, work_item.clone(), span.context(), cancel.clone());
            let output = outputs.get(name).cloned().unwrap_or(Value::Null);

            match step.handler.compensate(&ctx, &output).await {
                Ok(()) => {
                    if let Some(result) = run.step_mut(name) {
                        result.state = StepState::Compensated;
                    }
                    span.end(SpanStatus::Ok);
                }
                Err(e) => {
                    warn!(run_id = %run.id, step = %name, error = %e, "compensation failed");
                    if let Some(result) = run.step_mut(name) {
                        result.error = Some(format!("compensation failed: {e}"));
                    }
                    span.set_attribute("error", &e);
                    span.end(SpanStatus::Error);
                }
            }
        }
    }

    fn emit(&self, event: WorkflowEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }
}

impl std::fmt::Debug for WorkflowEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowEngine")
            .field("middleware", &self.middleware.len())
            .field("events", &self.events.is_some())
            .finish()
    }
}

fn advance(run: &mut WorkflowRun, target: RunState) {
    if let Err(e) = run.transition(target) {
        warn!(run_id = %run.id, error = %e, "ignored run transition");
    }
}
