//! Test fixtures for integration tests.
//!
//! Provides helpers for:
//! - Building coordinators over memory or file-backed stores
//! - Capturing spans in memory
//! - Recording step and compensation order

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;
use tempfile::TempDir;

use hive::coordination::{
    Agent, CoordinationStore, JsonFileBackend, Priority, StateBackend, StoreSnapshot,
    WorkClaimCoordinator, WorkItem,
};
use hive::telemetry::{MemorySink, Tracer};
use hive::workflow::{FnStep, Step, StepError};

/// A coordinator over an in-memory store with every span captured.
pub struct Harness {
    pub coordinator: WorkClaimCoordinator,
    pub spans: Arc<MemorySink>,
}

impl Harness {
    pub fn new() -> Self {
        let spans = Arc::new(MemorySink::new());
        let tracer = Tracer::new().with_sink(spans.clone());
        let coordinator =
            WorkClaimCoordinator::new(Arc::new(CoordinationStore::in_memory()), tracer);
        Self { coordinator, spans }
    }

    /// A harness whose store persists through `backend`.
    pub fn with_backend(backend: Arc<dyn StateBackend>, lock_wait: Duration) -> Self {
        let spans = Arc::new(MemorySink::new());
        let tracer = Tracer::new().with_sink(spans.clone());
        let store = CoordinationStore::open(backend)
            .expect("open store")
            .with_lock_wait(lock_wait);
        let coordinator = WorkClaimCoordinator::new(Arc::new(store), tracer);
        Self { coordinator, spans }
    }

    pub async fn agent(&self) -> Agent {
        self.coordinator
            .register_agent("core", 1)
            .await
            .expect("register agent")
    }

    pub async fn agents(&self, n: usize) -> Vec<Agent> {
        let mut agents = Vec::with_capacity(n);
        for _ in 0..n {
            agents.push(self.agent().await);
        }
        agents
    }

    pub async fn item(&self, work_type: &str, priority: Priority) -> WorkItem {
        self.coordinator
            .enqueue(work_type, priority)
            .await
            .expect("enqueue")
    }
}

/// A backend that takes `delay` to persist each commit, widening the window
/// between a read and the next write.
pub struct SlowBackend {
    pub delay: Duration,
}

impl StateBackend for SlowBackend {
    fn load(&self) -> hive::Result<Option<StoreSnapshot>> {
        Ok(None)
    }

    fn persist(&self, _snapshot: &StoreSnapshot) -> hive::Result<()> {
        std::thread::sleep(self.delay);
        Ok(())
    }

    fn describe(&self) -> String {
        format!("slow ({:?})", self.delay)
    }
}

/// A JSON-file-backed store in a temporary directory.
pub struct FileStore {
    /// Kept alive for the lifetime of the store.
    pub temp_dir: TempDir,
    pub path: PathBuf,
}

impl FileStore {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let path = temp_dir.path().join("state.json");
        Self { temp_dir, path }
    }

    pub fn open(&self) -> WorkClaimCoordinator {
        let store = CoordinationStore::open(Arc::new(JsonFileBackend::new(&self.path)))
            .expect("open store");
        WorkClaimCoordinator::new(Arc::new(store), Tracer::new())
    }
}

/// Shared, ordered record of what the steps did.
#[derive(Clone, Default)]
pub struct Journal(Arc<Mutex<Vec<String>>>);

impl Journal {
    pub fn push(&self, entry: impl Into<String>) {
        self.0.lock().unwrap().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }
}

/// A step that journals `run:<name>` and `undo:<name>`.
pub fn journaled_step(name: &str, journal: &Journal) -> Step {
    let run_journal = journal.clone();
    let undo_journal = journal.clone();
    let run_name = name.to_string();
    let undo_name = name.to_string();
    Step::new(
        name,
        FnStep::new(move |_ctx| {
            let journal = run_journal.clone();
            let name = run_name.clone();
            async move {
                journal.push(format!("run:{name}"));
                Ok(json!({ "step": name }))
            }
        })
        .with_compensation(move |_ctx, _output| {
            let journal = undo_journal.clone();
            let name = undo_name.clone();
            async move {
                journal.push(format!("undo:{name}"));
                Ok(())
            }
        }),
    )
}

/// A step that always fails with a non-retryable error.
pub fn fatal_step(name: &str) -> Step {
    Step::from_fn(name, |_ctx| async { Err(StepError::fatal("disk full")) })
}

/// A step that sleeps for `delay` unless cancelled first.
pub fn slow_step(name: &str, delay: Duration) -> Step {
    Step::from_fn(name, move |ctx| async move {
        tokio::select! {
            _ = ctx.cancel.cancelled() => Err(StepError::Cancelled),
            _ = tokio::time::sleep(delay) => Ok(json!("done")),
        }
    })
}
