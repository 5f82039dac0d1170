//! Step handlers and the context they run in.

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;

use crate::coordination::WorkItem;
use crate::id::RunId;
use crate::telemetry::SpanContext;

use super::middleware::RetryPolicy;

/// Failure of a single step, tagged by how the engine should react.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StepError {
    /// Transient; the retry middleware re-invokes the step.
    #[error("retryable step error: {0}")]
    Retryable(String),
    /// Permanent; goes straight to compensation.
    #[error("fatal step error: {0}")]
    Fatal(String),
    /// The run was cancelled while the step was in flight.
    #[error("step cancelled")]
    Cancelled,
}

impl StepError {
    pub fn retryable(msg: impl Into<String>) -> Self {
        StepError::Retryable(msg.into())
    }

    pub fn fatal(msg: impl Into<String>) -> Self {
        StepError::Fatal(msg.into())
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, StepError::Retryable(_))
    }
}

/// Successful steps counted across one run, shared by parallel steps.
#[derive(Debug)]
pub struct RunProgress {
    total: usize,
    succeeded: Mutex<usize>,
}

impl RunProgress {
    pub fn new(total: usize) -> Self {
        Self {
            total: total.max(1),
            succeeded: Mutex::new(0),
        }
    }

    pub fn total(&self) -> usize {
        self.total
    }

    /// Lock the counter. Hold the guard while reporting so that reports
    /// from parallel steps reach the store in increasing order.
    pub async fn lock(&self) -> MutexGuard<'_, usize> {
        self.succeeded.lock().await
    }

    pub fn percent_of(&self, succeeded: usize) -> u8 {
        ((succeeded.min(self.total) * 100) / self.total) as u8
    }
}

/// Everything a step handler and the middleware around it can see.
#[derive(Debug, Clone)]
pub struct StepContext {
    pub run_id: RunId,
    pub step: String,
    pub work_item: WorkItem,
    /// Outputs of every step that finished before this step's layer.
    pub inputs: Arc<BTreeMap<String, Value>>,
    /// Span of the innermost enclosing operation.
    pub span: SpanContext,
    pub cancel: CancellationToken,
    /// 1-based attempt number, maintained by the retry middleware.
    pub attempt: u32,
    /// Per-step override of the engine's retry policy.
    pub retry: Option<RetryPolicy>,
    progress: Arc<RunProgress>,
    invocations: Arc<AtomicU32>,
}

impl StepContext {
    pub fn new(
        run_id: RunId,
        step: &str,
        work_item: WorkItem,
        span: SpanContext,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            run_id,
            step: step.to_string(),
            work_item,
            inputs: Arc::new(BTreeMap::new()),
            span,
            cancel,
            attempt: 1,
            retry: None,
            progress: Arc::new(RunProgress::new(1)),
            invocations: Arc::new(AtomicU32::new(0)),
        }
    }

    pub fn with_inputs(mut self, inputs: Arc<BTreeMap<String, Value>>) -> Self {
        self.inputs = inputs;
        self
    }

    pub fn with_progress(mut self, progress: Arc<RunProgress>) -> Self {
        self.progress = progress;
        self
    }

    pub fn input(&self, step: &str) -> Option<&Value> {
        self.inputs.get(step)
    }

    pub fn progress(&self) -> &Arc<RunProgress> {
        &self.progress
    }

    /// How many times the handler itself has been invoked.
    pub fn invocations(&self) -> u32 {
        self.invocations.load(Ordering::SeqCst)
    }

    pub(crate) fn record_invocation(&self) {
        self.invocations.fetch_add(1, Ordering::SeqCst);
    }
}

/// A named unit of work supplied by the hosting application.
#[async_trait]
pub trait StepHandler: Send + Sync {
    async fn run(&self, ctx: &StepContext) -> Result<Value, StepError>;

    /// Undo a successful run. `output` is what `run` returned.
    async fn compensate(&self, _ctx: &StepContext, _output: &Value) -> Result<(), StepError> {
        Ok(())
    }
}

type RunFn = Arc<dyn Fn(StepContext) -> BoxFuture<'static, Result<Value, StepError>> + Send + Sync>;
type CompensateFn =
    Arc<dyn Fn(StepContext, Value) -> BoxFuture<'static, Result<(), StepError>> + Send + Sync>;

/// A step handler built from closures.
///
/// # Example
///
/// ```
/// use hive::workflow::{FnStep, StepError};
/// use serde_json::json;
///
/// let handler = FnStep::new(|_ctx| async { Ok(json!({"rows": 3})) })
///     .with_compensation(|_ctx, _output| async { Ok::<(), StepError>(()) });
/// ```
#[derive(Clone)]
pub struct FnStep {
    run: RunFn,
    compensate: Option<CompensateFn>,
}

impl FnStep {
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(StepContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, StepError>> + Send + 'static,
    {
        Self {
            run: Arc::new(move |ctx| f(ctx).boxed()),
            compensate: None,
        }
    }

    pub fn with_compensation<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(StepContext, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), StepError>> + Send + 'static,
    {
        self.compensate = Some(Arc::new(move |ctx, output| f(ctx, output).boxed()));
        self
    }
}

#[async_trait]
impl StepHandler for FnStep {
    async fn run(&self, ctx: &StepContext) -> Result<Value, StepError> {
        (self.run)(ctx.clone()).await
    }

    async fn compensate(&self, ctx: &StepContext, output: &Value) -> Result<(), StepError> {
        match &self.compensate {
            Some(f) => f(ctx.clone(), output.clone()).await,
            None => Ok(()),
        }
    }
}

/// A named step within a workflow.
#[derive(Clone)]
pub struct Step {
    pub name: String,
    pub handler: Arc<dyn StepHandler>,
    pub retry: Option<RetryPolicy>,
}

impl Step {
    pub fn new(name: &str, handler: impl StepHandler + 'static) -> Self {
        Self {
            name: name.to_string(),
            handler: Arc::new(handler),
            retry: None,
        }
    }

    /// Shorthand for a step backed by a single closure.
    pub fn from_fn<F, Fut>(name: &str, f: F) -> Self
    where
        F: Fn(StepContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, StepError>> + Send + 'static,
    {
        Self::new(name, FnStep::new(f))
    }

    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = Some(policy);
        self
    }
}

impl std::fmt::Debug for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Step")
            .field("name", &self.name)
            .field("retry", &self.retry)
            .finish()
    }
}
