//! Timer-driven background tasks.
//!
//! Each actor is an independent tokio task that talks to the rest of the
//! system via message passing. Actors handle:
//! - Releasing abandoned claims (ReaperActor)
//! - Periodic health reports (MetricsActor)
//! - Agent liveness leases (HeartbeatActor)

pub mod heartbeat;
pub mod metrics;
pub mod reaper;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub use heartbeat::HeartbeatActor;
pub use metrics::MetricsActor;
pub use reaper::ReaperActor;

/// Handle to a running actor, used for graceful shutdown.
pub struct ActorHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl ActorHandle {
    /// Create a new actor handle with a cancellation token.
    pub fn new(cancel: CancellationToken, task: JoinHandle<()>) -> Self {
        Self { cancel, task }
    }

    /// Signal the actor to shut down gracefully.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Check if shutdown has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Signal shutdown and wait for the task to exit.
    pub async fn stop(self) {
        self.cancel.cancel();
        let _ = self.task.await;
    }
}

impl std::fmt::Debug for ActorHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActorHandle")
            .field("cancelled", &self.cancel.is_cancelled())
            .field("finished", &self.task.is_finished())
            .finish()
    }
}
