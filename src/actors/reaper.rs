//! Reaper actor: runs a reaper scan on a fixed interval.

use chrono::Utc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::coordination::{ReapReport, Reaper};

use super::ActorHandle;

const REAPER_INTERVAL: Duration = Duration::from_secs(30);

/// Actor that periodically releases claims held by dead or stalled agents.
pub struct ReaperActor {
    reaper: Reaper,
    reports: Option<mpsc::UnboundedSender<ReapReport>>,
    interval: Duration,
}

impl ReaperActor {
    pub fn new(reaper: Reaper) -> Self {
        Self {
            reaper,
            reports: None,
            interval: REAPER_INTERVAL,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Publish every non-empty report on `tx`.
    pub fn with_reports(mut self, tx: mpsc::UnboundedSender<ReapReport>) -> Self {
        self.reports = Some(tx);
        self
    }

    pub fn spawn(self) -> ActorHandle {
        self.spawn_with(CancellationToken::new())
    }

    /// Spawn under an existing token, typically a child of a parent scope.
    pub fn spawn_with(self, cancel: CancellationToken) -> ActorHandle {
        let cancel_clone = cancel.clone();

        debug!(interval_ms = self.interval.as_millis() as u64, "ReaperActor::spawn");

        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.interval);

            loop {
                tokio::select! {
                    _ = cancel_clone.cancelled() => {
                        debug!("ReaperActor cancelled");
                        break;
                    }
                    _ = interval.tick() => {
                        match self.reaper.scan(Utc::now()).await {
                            Ok(report) if report.is_empty() => {}
                            Ok(report) => {
                                info!(
                                    expired_agents = report.expired_agents.len(),
                                    released = report.released.len(),
                                    "reaper cycle reclaimed work"
                                );
                                if let Some(tx) = &self.reports {
                                    let _ = tx.send(report);
                                }
                            }
                            Err(e) => error!(error = %e, "reaper scan failed"),
                        }
                    }
                }
            }
        });

        ActorHandle::new(cancel, task)
    }
}
