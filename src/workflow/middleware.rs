//! The middleware pipeline wrapped around every step.
//!
//! Middleware compose as nested decorators: the first middleware in the
//! stack is the outermost and sees the final outcome of everything inside
//! it. The innermost link invokes the handler and races it against the
//! run's cancellation token.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::coordination::{ClaimError, WorkClaimCoordinator};
use crate::telemetry::{SpanStatus, Tracer};

use super::step::{StepContext, StepError, StepHandler};

/// A decorator around step invocation.
#[async_trait]
pub trait Middleware: Send + Sync {
    async fn handle(&self, ctx: StepContext, next: Next) -> Result<Value, StepError>;
}

/// The remainder of the pipeline below a middleware.
#[derive(Clone)]
pub struct Next {
    handler: Arc<dyn StepHandler>,
    chain: Arc<[Arc<dyn Middleware>]>,
    index: usize,
}

impl Next {
    pub fn new(handler: Arc<dyn StepHandler>, chain: Arc<[Arc<dyn Middleware>]>) -> Self {
        Self {
            handler,
            chain,
            index: 0,
        }
    }

    /// Run the rest of the pipeline.
    pub async fn run(self, ctx: StepContext) -> Result<Value, StepError> {
        match self.chain.get(self.index).cloned() {
            Some(middleware) => {
                let next = Next {
                    index: self.index + 1,
                    ..self
                };
                middleware.handle(ctx, next).await
            }
            None => {
                ctx.record_invocation();
                tokio::select! {
                    _ = ctx.cancel.cancelled() => Err(StepError::Cancelled),
                    result = self.handler.run(&ctx) => result,
                }
            }
        }
    }
}

/// Exponential backoff policy for retryable step errors.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total invocations, including the first.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay after the given failed attempt (1-based), capped at `max_backoff`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(63) as i32;
        let secs = self.initial_backoff.as_secs_f64() * self.multiplier.powi(exponent);
        if !secs.is_finite() || secs >= self.max_backoff.as_secs_f64() {
            return self.max_backoff;
        }
        Duration::from_secs_f64(secs.max(0.0))
    }
}

/// Opens a child span per step and records its outcome.
#[derive(Debug, Clone)]
pub struct TracingMiddleware {
    tracer: Tracer,
}

impl TracingMiddleware {
    pub fn new(tracer: Tracer) -> Self {
        Self { tracer }
    }
}

#[async_trait]
impl Middleware for TracingMiddleware {
    async fn handle(&self, mut ctx: StepContext, next: Next) -> Result<Value, StepError> {
        let mut span = self
            .tracer
            .start_span(&format!("step.{}", ctx.step), Some(&ctx.span));
        span.set_attribute("step", &ctx.step);
        span.set_attribute("work_id", ctx.work_item.id);
        span.set_attribute("run_id", ctx.run_id);
        ctx.span = span.context();

        let invocations_before = ctx.invocations();
        let result = next.run(ctx.clone()).await;

        let mut attributes = BTreeMap::new();
        attributes.insert(
            "attempts".to_string(),
            (ctx.invocations() - invocations_before).to_string(),
        );
        let status = match &result {
            Ok(_) => SpanStatus::Ok,
            Err(e) => {
                attributes.insert("error".to_string(), e.to_string());
                SpanStatus::Error
            }
        };
        self.tracer.end_span(span, status, attributes);
        result
    }
}

/// Reports step outcomes back to the coordination store.
///
/// Success advances the work item's progress by the share of steps done.
/// Any error that reaches this layer is final for the step, so the work item
/// is marked failed. Cancellation is left to the caller.
#[derive(Debug, Clone)]
pub struct CoordinationMiddleware {
    coordinator: WorkClaimCoordinator,
}

impl CoordinationMiddleware {
    pub fn new(coordinator: WorkClaimCoordinator) -> Self {
        Self { coordinator }
    }
}

#[async_trait]
impl Middleware for CoordinationMiddleware {
    async fn handle(&self, ctx: StepContext, next: Next) -> Result<Value, StepError> {
        let result = next.run(ctx.clone()).await;

        let Some(agent_id) = ctx.work_item.claimed_by else {
            return result;
        };
        let work_id = ctx.work_item.id;
        let coordinator = self.coordinator.child_of(&ctx.span);

        match &result {
            Ok(_) => {
                let mut succeeded = ctx.progress().lock().await;
                *succeeded += 1;
                let percent = ctx.progress().percent_of(*succeeded);
                if let Err(e) = coordinator.update_progress(&work_id, &agent_id, percent).await {
                    warn!(step = %ctx.step, work_id = %work_id, error = %e, "progress update failed");
                }
            }
            Err(StepError::Cancelled) => {}
            Err(step_err) => {
                match coordinator.fail(&work_id, &agent_id, &step_err.to_string()).await {
                    Ok(_) => {}
                    Err(ClaimError::InvalidState { .. }) => {
                        debug!(work_id = %work_id, "work item already finished");
                    }
                    Err(e) => {
                        warn!(step = %ctx.step, work_id = %work_id, error = %e, "failed to mark work item failed");
                    }
                }
            }
        }
        result
    }
}

/// Re-invokes steps that fail with a retryable error.
#[derive(Debug, Clone, Default)]
pub struct RetryMiddleware {
    policy: RetryPolicy,
}

impl RetryMiddleware {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }
}

#[async_trait]
impl Middleware for RetryMiddleware {
    async fn handle(&self, mut ctx: StepContext, next: Next) -> Result<Value, StepError> {
        let policy = ctx.retry.clone().unwrap_or_else(|| self.policy.clone());
        let mut attempt = 1;
        loop {
            ctx.attempt = attempt;
            match next.clone().run(ctx.clone()).await {
                Err(StepError::Retryable(msg)) if attempt < policy.max_attempts => {
                    let delay = policy.backoff(attempt);
                    warn!(
                        step = %ctx.step,
                        attempt,
                        max_attempts = policy.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %msg,
                        "step failed, retrying"
                    );
                    tokio::select! {
                        _ = ctx.cancel.cancelled() => return Err(StepError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                    attempt += 1;
                }
                other => return other,
            }
        }
    }
}
