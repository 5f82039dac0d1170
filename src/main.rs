use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, info};

use hive::config::Config;
use hive::coordination::{
    CoordinationStore, JsonFileBackend, Priority, Reaper, ReleaseReason, StoreLock,
    WorkClaimCoordinator, WorkState,
};
use hive::error::EXIT_VALIDATION;
use hive::health::{HealthAggregator, HealthConfig};
use hive::id::{AgentId, WorkId};
use hive::swarm::{Swarm, SwarmConfig, WorkerConfig, WorkflowRegistry};
use hive::telemetry::{JsonlSink, SpanContext, SpanHandle, SpanStatus, Tracer};
use hive::workflow::{RetryPolicy, Step, StepError, Workflow};
use hive::{Error, Result};

/// Hive - work-claim coordination for agent swarms
#[derive(Parser, Debug)]
#[command(name = "hive")]
#[command(version, about, long_about = None)]
#[command(after_help = "ENVIRONMENT:\n    HIVE_DEBUG=1    Enable debug logging (alternative to --debug)\n\nEXIT CODES:\n    0 success, 1 fatal, 2 conflict, 3 validation")]
pub struct Cli {
    /// Enable debug logging (writes to ~/.hive/hive.log)
    #[arg(short = 'd', long, global = true)]
    pub debug: bool,

    /// Parent trace context in W3C traceparent form
    #[arg(long, global = true, value_name = "CARRIER")]
    pub traceparent: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    #[command(flatten)]
    Store(StoreCommand),

    /// Run an in-process swarm over built-in workflows
    Run {
        /// Number of workers
        #[arg(long, default_value_t = 3)]
        agents: usize,

        /// Number of items to enqueue
        #[arg(long, default_value_t = 12)]
        items: usize,
    },
}

/// Commands that operate on the shared file-backed store.
#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum StoreCommand {
    /// Add a pending work item
    Enqueue {
        /// Work type, used to pick a workflow
        work_type: String,

        /// low, medium, high or critical
        #[arg(long, short = 'p', default_value = "medium")]
        priority: String,
    },

    /// Register a new agent
    Register {
        team: String,

        /// Concurrent items the agent may hold (defaults to the configured value)
        #[arg(long, short = 'c')]
        capacity: Option<u32>,
    },

    /// Refresh an agent's liveness lease
    Heartbeat { agent: String },

    /// Claim a pending work item
    Claim { work: String, agent: String },

    /// Move a claimed item to in_progress
    Start { work: String, agent: String },

    /// Report progress (0-100) on an owned item
    Progress {
        work: String,
        agent: String,
        percent: u8,
    },

    /// Complete an owned item
    Complete {
        work: String,
        agent: String,

        /// Result payload as JSON
        #[arg(long)]
        result: Option<String>,
    },

    /// Fail an owned item
    Fail {
        work: String,
        agent: String,
        reason: String,
    },

    /// Return an owned item to the pool
    Release {
        work: String,
        agent: String,

        #[arg(long, default_value = "released by agent")]
        reason: String,
    },

    /// Show one item, or the whole store
    Status { work: Option<String> },

    /// Print a health report
    Health,

    /// Pass an owned item to another agent, e.g. the next role in a pipeline
    Handoff {
        work: String,
        from: String,
        to: String,
    },

    /// Release claims held by dead or stalled agents
    Reap,
}

fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let code = if e.use_stderr() { EXIT_VALIDATION } else { 0 };
            let _ = e.print();
            std::process::exit(code);
        }
    };

    hive::log::init_with_debug(cli.debug);

    let code = match run(cli) {
        Ok(output) => {
            println!("{}", render(&output));
            hive::error::EXIT_OK
        }
        Err(e) => {
            let kind = match &e {
                Error::Claim(claim) => claim.kind(),
                _ => "error",
            };
            eprintln!("{}", render(&json!({ "error": kind, "message": e.to_string() })));
            e.exit_code()
        }
    };
    std::process::exit(code);
}

fn render(value: &Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}

fn run(cli: Cli) -> Result<Value> {
    let config = Config::load()?;
    config.validate()?;
    let parent = cli
        .traceparent
        .as_deref()
        .map(SpanContext::from_carrier)
        .transpose()?;

    let runtime = tokio::runtime::Runtime::new()?;
    match cli.command {
        Command::Run { agents, items } => runtime.block_on(run_swarm(&config, agents, items)),
        Command::Store(command) => {
            let (coordinator, _lock) = open_coordinator(&config)?;
            runtime.block_on(run_command(&config, coordinator, command, parent))
        }
    }
}

/// Open the file-backed store, holding its lock until the returned guard drops.
fn open_coordinator(config: &Config) -> Result<(WorkClaimCoordinator, StoreLock)> {
    let backend = JsonFileBackend::new(config.state_path()?);
    let lock = backend.lock(config.lock_wait())?;
    let store = CoordinationStore::open(Arc::new(backend))?.with_lock_wait(config.lock_wait());
    let tracer = Tracer::new().with_sink(Arc::new(JsonlSink::open(config.trace_path()?)?));
    let coordinator =
        WorkClaimCoordinator::with_config(Arc::new(store), tracer, config.coordinator_config());
    Ok((coordinator, lock))
}

async fn run_command(
    config: &Config,
    coordinator: WorkClaimCoordinator,
    command: StoreCommand,
    parent: Option<SpanContext>,
) -> Result<Value> {
    let mut span = coordinator
        .tracer()
        .start_span(&format!("cli.{}", command_name(&command)), parent.as_ref());
    debug!(traceparent = %span.context().to_carrier(), "command span opened");
    let coordinator = coordinator.child_of(&span.context());

    let result = dispatch(config, &coordinator, command, &mut span).await;
    span.end(if result.is_ok() {
        SpanStatus::Ok
    } else {
        SpanStatus::Error
    });
    result
}

async fn dispatch(
    config: &Config,
    coordinator: &WorkClaimCoordinator,
    command: StoreCommand,
    span: &mut SpanHandle,
) -> Result<Value> {
    match command {
        StoreCommand::Enqueue {
            work_type,
            priority,
        } => {
            let priority: Priority = priority.parse()?;
            to_json(&coordinator.enqueue(&work_type, priority).await?)
        }
        StoreCommand::Register { team, capacity } => {
            let capacity = capacity.unwrap_or(config.default_capacity);
            to_json(&coordinator.register_agent(&team, capacity).await?)
        }
        StoreCommand::Heartbeat { agent } => {
            to_json(&coordinator.heartbeat(&parse_agent(&agent)?).await?)
        }
        StoreCommand::Claim { work, agent } => {
            let (work, agent) = (parse_work(&work)?, parse_agent(&agent)?);
            span.set_attribute("work_id", work);
            to_json(&coordinator.claim(&work, &agent).await?.work_item)
        }
        StoreCommand::Start { work, agent } => {
            let (work, agent) = (parse_work(&work)?, parse_agent(&agent)?);
            to_json(&coordinator.start_progress(&work, &agent).await?)
        }
        StoreCommand::Progress {
            work,
            agent,
            percent,
        } => {
            let (work, agent) = (parse_work(&work)?, parse_agent(&agent)?);
            to_json(&coordinator.update_progress(&work, &agent, percent).await?)
        }
        StoreCommand::Complete {
            work,
            agent,
            result,
        } => {
            let (work, agent) = (parse_work(&work)?, parse_agent(&agent)?);
            let result = parse_result(result.as_deref())?;
            to_json(&coordinator.complete(&work, &agent, result).await?)
        }
        StoreCommand::Fail {
            work,
            agent,
            reason,
        } => {
            let (work, agent) = (parse_work(&work)?, parse_agent(&agent)?);
            to_json(&coordinator.fail(&work, &agent, &reason).await?)
        }
        StoreCommand::Release {
            work,
            agent,
            reason,
        } => {
            let (work, agent) = (parse_work(&work)?, parse_agent(&agent)?);
            to_json(
                &coordinator
                    .release(&work, &agent, ReleaseReason::Voluntary(reason))
                    .await?,
            )
        }
        StoreCommand::Status { work: Some(work) } => {
            to_json(&coordinator.status(&parse_work(&work)?).await?)
        }
        StoreCommand::Status { work: None } => to_json(&coordinator.snapshot().await?),
        StoreCommand::Health => {
            let now = Utc::now();
            let health = HealthConfig {
                agent_liveness: config.agent_liveness(),
                ..HealthConfig::default()
            };
            let since = now
                - chrono::Duration::from_std(health.window)
                    .unwrap_or_else(|_| chrono::Duration::minutes(5));
            let mut aggregator = HealthAggregator::new(health);
            for recorded in JsonlSink::read_all(&config.trace_path()?)? {
                if recorded.start >= since {
                    aggregator.observe_span(&recorded);
                }
            }
            to_json(&aggregator.report(&coordinator.snapshot().await?, now))
        }
        StoreCommand::Handoff { work, from, to } => {
            let work = parse_work(&work)?;
            let (from, to) = (parse_agent(&from)?, parse_agent(&to)?);
            span.set_attribute("work_id", work);
            to_json(&coordinator.handoff(&work, &from, &to).await?)
        }
        StoreCommand::Reap => {
            let reaper = Reaper::new(coordinator.clone(), config.reaper_config());
            to_json(&reaper.scan(Utc::now()).await?)
        }
    }
}

fn command_name(command: &StoreCommand) -> &'static str {
    match command {
        StoreCommand::Enqueue { .. } => "enqueue",
        StoreCommand::Register { .. } => "register",
        StoreCommand::Heartbeat { .. } => "heartbeat",
        StoreCommand::Claim { .. } => "claim",
        StoreCommand::Start { .. } => "start",
        StoreCommand::Progress { .. } => "progress",
        StoreCommand::Complete { .. } => "complete",
        StoreCommand::Fail { .. } => "fail",
        StoreCommand::Release { .. } => "release",
        StoreCommand::Status { .. } => "status",
        StoreCommand::Health => "health",
        StoreCommand::Handoff { .. } => "handoff",
        StoreCommand::Reap => "reap",
    }
}

fn to_json<T: Serialize>(value: &T) -> Result<Value> {
    Ok(serde_json::to_value(value)?)
}

fn parse_work(s: &str) -> Result<WorkId> {
    s.parse()
        .map_err(|e| Error::Validation(format!("invalid work id {s:?}: {e}")))
}

fn parse_agent(s: &str) -> Result<AgentId> {
    s.parse()
        .map_err(|e| Error::Validation(format!("invalid agent id {s:?}: {e}")))
}

fn parse_result(raw: Option<&str>) -> Result<Value> {
    match raw {
        None => Ok(Value::Null),
        Some(raw) => serde_json::from_str(raw)
            .map_err(|e| Error::Validation(format!("invalid --result JSON: {e}"))),
    }
}

/// Enqueue `items` demo items and drain them with an in-process swarm.
async fn run_swarm(config: &Config, agents: usize, items: usize) -> Result<Value> {
    if agents == 0 {
        return Err(Error::Validation("--agents must be at least 1".to_string()));
    }

    let tracer = Tracer::new();
    let mut spans = tracer.subscribe();
    let coordinator = WorkClaimCoordinator::with_config(
        Arc::new(CoordinationStore::in_memory()),
        tracer,
        config.coordinator_config(),
    );

    let priorities = [
        Priority::Low,
        Priority::Medium,
        Priority::High,
        Priority::Critical,
    ];
    for i in 0..items {
        let work_type = if i % 2 == 0 { "analysis" } else { "build" };
        coordinator
            .enqueue(work_type, priorities[i % priorities.len()])
            .await?;
    }

    let swarm_config = SwarmConfig {
        workers: agents,
        worker: WorkerConfig {
            team: "demo".to_string(),
            capacity: config.default_capacity,
            poll_interval: Duration::from_millis(20),
            heartbeat_interval: config.heartbeat_interval(),
            ..WorkerConfig::default()
        },
        retry: config.retry_policy(),
        reaper: config.reaper_config(),
        reaper_interval: config.reaper_interval(),
        metrics_interval: config.metrics_interval(),
        ..SwarmConfig::default()
    };

    let handle = Swarm::new(coordinator.clone(), builtin_registry()?, swarm_config)
        .start()
        .await?;
    handle.wait_idle(Duration::from_millis(20)).await?;
    let stats = handle.shutdown().await;

    let mut aggregator = HealthAggregator::default();
    while let Ok(span) = spans.try_recv() {
        aggregator.observe_span(&span);
    }
    let snapshot = coordinator.snapshot().await?;
    let report = aggregator.report(&snapshot, Utc::now());
    let completed = snapshot
        .work_items
        .iter()
        .filter(|item| item.state == WorkState::Completed)
        .count();
    info!(items, completed, "swarm demo finished");

    Ok(json!({
        "agents": agents,
        "items": items,
        "stats": stats,
        "health": report,
    }))
}

/// Workflows for the `run` demo.
///
/// `analysis` fans out after a fetch and joins on a summary. `build` hits a
/// transient failure on its first compile attempt to exercise retries.
fn builtin_registry() -> Result<WorkflowRegistry> {
    let analysis = Workflow::builder("analysis")
        .step(Step::from_fn("fetch", |ctx| async move {
            Ok(json!({ "work_id": ctx.work_item.id, "rows": 128 }))
        }))
        .parallel(vec![
            Step::from_fn("profile", |ctx| async move {
                let rows = ctx.input("fetch").and_then(|v| v["rows"].as_u64()).unwrap_or(0);
                Ok(json!({ "columns": 12, "rows": rows }))
            }),
            Step::from_fn("score", |_ctx| async { Ok(json!({ "score": 0.87 })) }),
        ])
        .step(Step::from_fn("summarise", |ctx| async move {
            Ok(json!({
                "profile": ctx.input("profile").cloned(),
                "score": ctx.input("score").cloned(),
            }))
        }))
        .build()?;

    let build = Workflow::builder("build")
        .step(
            Step::from_fn("compile", |ctx| async move {
                if ctx.attempt < 2 {
                    return Err(StepError::retryable("toolchain cache cold"));
                }
                Ok(json!({ "artifact": format!("{}.tar", ctx.work_item.id.short()) }))
            })
            .with_retry(RetryPolicy {
                initial_backoff: Duration::from_millis(10),
                ..RetryPolicy::default()
            }),
        )
        .step(Step::from_fn("test", |_ctx| async { Ok(json!({ "passed": 42 })) }))
        .build()?;

    let mut registry = WorkflowRegistry::new();
    registry.register("analysis", analysis).register("build", build);
    Ok(registry)
}
