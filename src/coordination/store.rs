//! The coordination store: the single shared, mutable source of truth.
//!
//! All mutations go through one `tokio::sync::Mutex` (single writer). A
//! transaction runs against a copy of the state; only when the closure
//! succeeds and the backend accepts the new snapshot is the copy swapped in.
//! Lock acquisition is bounded so callers never wait indefinitely.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, error, warn};

use crate::coordination::model::{Agent, WorkItem};
use crate::error::{Error, Result};
use crate::id::{AgentId, WorkId};
use crate::util::blocking;

/// Default bounded wait for the store lock.
pub const DEFAULT_LOCK_WAIT: Duration = Duration::from_millis(250);

/// A lock file older than this is considered abandoned.
const STALE_LOCK_AGE: Duration = Duration::from_secs(30);

/// Failure to run a transaction at all.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The single-writer lock was not acquired within the bounded wait.
    #[error("store lock not acquired within {0:?}")]
    Busy(Duration),
    /// The backend could not persist the new state.
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Point-in-time copy of every record, used for persistence and readers.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreSnapshot {
    pub version: u64,
    pub taken_at: DateTime<Utc>,
    pub agents: Vec<Agent>,
    pub work_items: Vec<WorkItem>,
}

impl StoreSnapshot {
    pub fn agent(&self, id: &AgentId) -> Option<&Agent> {
        self.agents.iter().find(|a| &a.id == id)
    }

    pub fn work(&self, id: &WorkId) -> Option<&WorkItem> {
        self.work_items.iter().find(|w| &w.id == id)
    }
}

/// Records keyed by entity id, mutated only inside transactions.
#[derive(Debug, Clone, Default)]
pub struct StoreState {
    version: u64,
    agents: BTreeMap<AgentId, Agent>,
    work: BTreeMap<WorkId, WorkItem>,
}

impl StoreState {
    fn from_snapshot(snapshot: StoreSnapshot) -> Self {
        Self {
            version: snapshot.version,
            agents: snapshot.agents.into_iter().map(|a| (a.id, a)).collect(),
            work: snapshot.work_items.into_iter().map(|w| (w.id, w)).collect(),
        }
    }

    fn to_snapshot(&self) -> StoreSnapshot {
        StoreSnapshot {
            version: self.version,
            taken_at: Utc::now(),
            agents: self.agents.values().cloned().collect(),
            work_items: self.work.values().cloned().collect(),
        }
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn agent(&self, id: &AgentId) -> Option<&Agent> {
        self.agents.get(id)
    }

    pub fn agent_mut(&mut self, id: &AgentId) -> Option<&mut Agent> {
        self.agents.get_mut(id)
    }

    pub fn upsert_agent(&mut self, agent: Agent) {
        self.agents.insert(agent.id, agent);
    }

    pub fn remove_agent(&mut self, id: &AgentId) -> Option<Agent> {
        self.agents.remove(id)
    }

    pub fn agents(&self) -> impl Iterator<Item = &Agent> {
        self.agents.values()
    }

    pub fn work(&self, id: &WorkId) -> Option<&WorkItem> {
        self.work.get(id)
    }

    pub fn work_mut(&mut self, id: &WorkId) -> Option<&mut WorkItem> {
        self.work.get_mut(id)
    }

    /// Insert a work item; returns false if the id is already present.
    pub fn insert_work(&mut self, item: WorkItem) -> bool {
        if self.work.contains_key(&item.id) {
            return false;
        }
        self.work.insert(item.id, item);
        true
    }

    pub fn work_items(&self) -> impl Iterator<Item = &WorkItem> {
        self.work.values()
    }
}

/// Durable home for store snapshots.
pub trait StateBackend: Send + Sync {
    /// Load the last persisted snapshot, if any.
    fn load(&self) -> Result<Option<StoreSnapshot>>;

    /// Atomically replace the persisted snapshot.
    fn persist(&self, snapshot: &StoreSnapshot) -> Result<()>;

    fn describe(&self) -> String;
}

/// Keeps nothing; state lives only in the process.
#[derive(Debug, Default, Clone, Copy)]
pub struct MemoryBackend;

impl StateBackend for MemoryBackend {
    fn load(&self) -> Result<Option<StoreSnapshot>> {
        Ok(None)
    }

    fn persist(&self, _snapshot: &StoreSnapshot) -> Result<()> {
        Ok(())
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}

/// Persists snapshots as a JSON document using write-to-temp and rename.
#[derive(Debug, Clone)]
pub struct JsonFileBackend {
    path: PathBuf,
}

impl JsonFileBackend {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Take the cross-process lock guarding a load-mutate-persist cycle.
    ///
    /// Waits at most `wait`; a lock file older than 30 seconds is treated
    /// as abandoned and removed.
    ///
    /// # Errors
    ///
    /// Returns `Error::StoreLocked` if another process keeps the lock for
    /// the whole wait.
    pub fn lock(&self, wait: Duration) -> Result<StoreLock> {
        let lock_path = self.path.with_extension("json.lock");
        if let Some(parent) = lock_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let started = Instant::now();
        loop {
            match OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&lock_path)
            {
                Ok(mut file) => {
                    if let Err(e) = writeln!(file, "{}", std::process::id()) {
                        warn!(path = %lock_path.display(), error = %e, "could not record lock owner");
                    }
                    debug!(path = %lock_path.display(), "store lock acquired");
                    return Ok(StoreLock { path: lock_path });
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    if lock_is_stale(&lock_path) {
                        warn!(path = %lock_path.display(), "removing abandoned store lock");
                        match fs::remove_file(&lock_path) {
                            Ok(()) => continue,
                            // Another process removed it first.
                            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                            Err(e) => {
                                warn!(path = %lock_path.display(), error = %e, "failed to remove abandoned store lock");
                                return Err(e.into());
                            }
                        }
                    }
                    if started.elapsed() >= wait {
                        return Err(Error::StoreLocked(lock_path));
                    }
                    std::thread::sleep(Duration::from_millis(10));
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

fn lock_is_stale(path: &Path) -> bool {
    fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|modified| modified.elapsed().ok())
        .map(|age| age > STALE_LOCK_AGE)
        .unwrap_or(false)
}

impl StateBackend for JsonFileBackend {
    fn load(&self) -> Result<Option<StoreSnapshot>> {
        debug!(path = %self.path.display(), "loading store snapshot");
        if !self.path.exists() {
            return Ok(None);
        }
        let contents = fs::read_to_string(&self.path)?;
        Ok(Some(serde_json::from_str(&contents)?))
    }

    fn persist(&self, snapshot: &StoreSnapshot) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.exists() {
                fs::create_dir_all(parent)?;
            }
        }
        if self.path.exists() {
            fs::copy(&self.path, self.path.with_extension("json.bak"))?;
        }
        let temp_path = self.path.with_extension("json.tmp");
        fs::write(&temp_path, serde_json::to_string_pretty(snapshot)?)?;
        fs::rename(&temp_path, &self.path)?;
        Ok(())
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

/// Cross-process lock on a `JsonFileBackend`, released on drop.
#[derive(Debug)]
pub struct StoreLock {
    path: PathBuf,
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), error = %e, "failed to release store lock");
        }
    }
}

/// Durable, atomically updatable collection of agents and work items.
///
/// # Example
///
/// ```ignore
/// let store = CoordinationStore::in_memory();
/// store.insert_work(WorkItem::new(WorkId::new(), "analysis", Priority::High)).await?;
/// let snapshot = store.snapshot().await?;
/// ```
pub struct CoordinationStore {
    state: Mutex<StoreState>,
    backend: Arc<dyn StateBackend>,
    lock_wait: Duration,
}

impl CoordinationStore {
    /// Open a store, restoring the backend's last snapshot.
    pub fn open(backend: Arc<dyn StateBackend>) -> Result<Self> {
        let state = backend
            .load()?
            .map(StoreState::from_snapshot)
            .unwrap_or_default();
        debug!(
            backend = %backend.describe(),
            agents = state.agents.len(),
            work_items = state.work.len(),
            "coordination store opened"
        );
        Ok(Self {
            state: Mutex::new(state),
            backend,
            lock_wait: DEFAULT_LOCK_WAIT,
        })
    }

    /// A store with no persistence.
    pub fn in_memory() -> Self {
        Self {
            state: Mutex::new(StoreState::default()),
            backend: Arc::new(MemoryBackend),
            lock_wait: DEFAULT_LOCK_WAIT,
        }
    }

    pub fn with_lock_wait(mut self, lock_wait: Duration) -> Self {
        self.lock_wait = lock_wait;
        self
    }

    pub fn lock_wait(&self) -> Duration {
        self.lock_wait
    }

    /// Run a read-modify-write transaction.
    ///
    /// The closure sees a private copy of the state. If it returns `Ok`, the
    /// copy is persisted and becomes the live state; if it returns `Err`,
    /// nothing changes and the error is handed back as the inner result.
    ///
    /// # Errors
    ///
    /// `StoreError::Busy` if the lock is not acquired within the bounded
    /// wait, `StoreError::Unavailable` if the backend rejects the snapshot
    /// (the mutation is rolled back).
    pub async fn transact<T, E, F>(
        &self,
        f: F,
    ) -> std::result::Result<std::result::Result<T, E>, StoreError>
    where
        F: FnOnce(&mut StoreState) -> std::result::Result<T, E>,
    {
        let mut guard = tokio::time::timeout(self.lock_wait, self.state.lock())
            .await
            .map_err(|_| StoreError::Busy(self.lock_wait))?;

        let mut next = guard.clone();
        let value = match f(&mut next) {
            Ok(value) => value,
            Err(rejected) => return Ok(Err(rejected)),
        };
        next.version += 1;

        let snapshot = next.to_snapshot();
        let backend = Arc::clone(&self.backend);
        if let Err(e) = blocking(move || backend.persist(&snapshot)).await {
            error!(error = %e, backend = %self.backend.describe(), "failed to persist store");
            return Err(StoreError::Unavailable(e.to_string()));
        }

        *guard = next;
        Ok(Ok(value))
    }

    /// Run a read-only closure against the live state.
    pub async fn read<T, F>(&self, f: F) -> std::result::Result<T, StoreError>
    where
        F: FnOnce(&StoreState) -> T,
    {
        let guard = tokio::time::timeout(self.lock_wait, self.state.lock())
            .await
            .map_err(|_| StoreError::Busy(self.lock_wait))?;
        Ok(f(&guard))
    }

    /// Full-collection snapshot for read-only consumers.
    pub async fn snapshot(&self) -> std::result::Result<StoreSnapshot, StoreError> {
        self.read(StoreState::to_snapshot).await
    }

    pub async fn get_work(&self, id: &WorkId) -> std::result::Result<Option<WorkItem>, StoreError> {
        self.read(|s| s.work(id).cloned()).await
    }

    pub async fn get_agent(&self, id: &AgentId) -> std::result::Result<Option<Agent>, StoreError> {
        self.read(|s| s.agent(id).cloned()).await
    }

    /// Insert a new work item; returns false if the id already exists.
    pub async fn insert_work(&self, item: WorkItem) -> std::result::Result<bool, StoreError> {
        self.transact(|s| Ok::<_, ()>(s.insert_work(item)))
            .await
            .map(|r| r.unwrap_or(false))
    }

    pub async fn upsert_agent(&self, agent: Agent) -> std::result::Result<(), StoreError> {
        self.transact(|s| {
            s.upsert_agent(agent);
            Ok::<_, ()>(())
        })
        .await
        .map(|_| ())
    }

    pub async fn remove_agent(&self, id: &AgentId) -> std::result::Result<Option<Agent>, StoreError> {
        self.transact(|s| Ok::<_, ()>(s.remove_agent(id)))
            .await
            .map(|r| r.unwrap_or(None))
    }

    /// Atomically mutate one work item. Returns `None` if it does not exist.
    pub async fn update_work<T, F>(
        &self,
        id: &WorkId,
        f: F,
    ) -> std::result::Result<Option<T>, StoreError>
    where
        F: FnOnce(&mut WorkItem) -> T,
    {
        self.transact(|s| s.work_mut(id).map(f).ok_or(()))
            .await
            .map(|r| r.ok())
    }

    /// Atomically mutate one agent. Returns `None` if it does not exist.
    pub async fn update_agent<T, F>(
        &self,
        id: &AgentId,
        f: F,
    ) -> std::result::Result<Option<T>, StoreError>
    where
        F: FnOnce(&mut Agent) -> T,
    {
        self.transact(|s| s.agent_mut(id).map(f).ok_or(()))
            .await
            .map(|r| r.ok())
    }
}
