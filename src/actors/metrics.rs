//! Metrics actor: periodic health reports.

use chrono::Utc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::coordination::WorkClaimCoordinator;
use crate::health::{HealthAggregator, HealthReport};
use crate::telemetry::TraceSpan;
use crate::workflow::WorkflowEvent;

use super::ActorHandle;

const METRICS_INTERVAL: Duration = Duration::from_secs(60);

/// Actor that drains the span and event streams into a `HealthAggregator`
/// and reports on a fixed interval.
pub struct MetricsActor {
    coordinator: WorkClaimCoordinator,
    aggregator: HealthAggregator,
    spans: mpsc::UnboundedReceiver<TraceSpan>,
    events: Option<mpsc::UnboundedReceiver<WorkflowEvent>>,
    reports: Option<mpsc::UnboundedSender<HealthReport>>,
    interval: Duration,
}

impl MetricsActor {
    pub fn new(
        coordinator: WorkClaimCoordinator,
        aggregator: HealthAggregator,
        spans: mpsc::UnboundedReceiver<TraceSpan>,
    ) -> Self {
        Self {
            coordinator,
            aggregator,
            spans,
            events: None,
            reports: None,
            interval: METRICS_INTERVAL,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_events(mut self, events: mpsc::UnboundedReceiver<WorkflowEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn with_reports(mut self, tx: mpsc::UnboundedSender<HealthReport>) -> Self {
        self.reports = Some(tx);
        self
    }

    pub fn spawn(self) -> ActorHandle {
        self.spawn_with(CancellationToken::new())
    }

    pub fn spawn_with(mut self, cancel: CancellationToken) -> ActorHandle {
        let cancel_clone = cancel.clone();

        debug!(interval_ms = self.interval.as_millis() as u64, "MetricsActor::spawn");

        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.interval);
            // The first tick fires immediately; skip it so the first report
            // covers a full interval.
            interval.tick().await;

            loop {
                tokio::select! {
                    _ = cancel_clone.cancelled() => {
                        debug!("MetricsActor cancelled");
                        break;
                    }
                    _ = interval.tick() => {
                        self.drain();
                        let snapshot = match self.coordinator.snapshot().await {
                            Ok(snapshot) => snapshot,
                            Err(e) => {
                                error!(error = %e, "metrics snapshot failed");
                                continue;
                            }
                        };
                        let report = self.aggregator.report(&snapshot, Utc::now());
                        info!(
                            status = %report.status,
                            score = report.score,
                            conflict_rate = report.conflict_rate,
                            error_rate = report.error_rate,
                            completed_per_minute = report.completed_per_minute,
                            "health report"
                        );
                        if let Some(tx) = &self.reports {
                            let _ = tx.send(report);
                        }
                    }
                }
            }
        });

        ActorHandle::new(cancel, task)
    }

    fn drain(&mut self) {
        while let Ok(span) = self.spans.try_recv() {
            self.aggregator.observe_span(&span);
        }
        if let Some(events) = &mut self.events {
            while let Ok(event) = events.try_recv() {
                self.aggregator.observe_event(&event);
            }
        }
    }
}
