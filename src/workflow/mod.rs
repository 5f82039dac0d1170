//! Step-based workflow execution.
//!
//! A `Workflow` is a DAG of named steps. The `WorkflowEngine` runs it for a
//! claimed work item, wrapping every step in the middleware pipeline
//! (tracing, coordination, retry) and compensating succeeded steps in
//! reverse order when a step fails for good.

pub mod engine;
pub mod graph;
pub mod middleware;
pub mod run;
pub mod step;

pub use engine::{Workflow, WorkflowBuilder, WorkflowEngine, WorkflowEvent, WorkflowResult};
pub use graph::StepGraph;
pub use middleware::{
    CoordinationMiddleware, Middleware, Next, RetryMiddleware, RetryPolicy, TracingMiddleware,
};
pub use run::{RunHistoryEntry, RunState, StepResult, StepState, WorkflowRun};
pub use step::{FnStep, RunProgress, Step, StepContext, StepError, StepHandler};
