//! Work-claim coordination.
//!
//! - `model`: typed agent and work-item records
//! - `store`: the single-writer store and its persistence backends
//! - `coordinator`: claim, progress, complete, fail and release
//! - `reaper`: liveness-based recovery of abandoned claims

pub mod coordinator;
pub mod model;
pub mod reaper;
pub mod store;

pub use coordinator::{ClaimError, Claimed, CoordinatorConfig, ReleaseReason, WorkClaimCoordinator};
pub use model::{Agent, AgentStatus, Priority, WorkItem, WorkState};
pub use reaper::{ReapReport, ReapedItem, Reaper, ReaperConfig};
pub use crate::actors::ReaperActor;
pub use store::{
    CoordinationStore, JsonFileBackend, MemoryBackend, StateBackend, StoreError, StoreLock,
    StoreSnapshot, StoreState,
};
