//! Per-run state with transition validation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::id::{RunId, WorkId};

/// Lifecycle of a workflow run.
///
/// ```text
/// running -> completed
/// running -> failed
/// running -> compensating -> failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Running,
    Completed,
    Compensating,
    Failed,
}

impl RunState {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunState::Completed | RunState::Failed)
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunState::Running => write!(f, "running"),
            RunState::Completed => write!(f, "completed"),
            RunState::Compensating => write!(f, "compensating"),
            RunState::Failed => write!(f, "failed"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StepState {
    #[default]
    Pending,
    Running,
    Succeeded,
    Failed,
    Compensated,
}

impl std::fmt::Display for StepState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StepState::Pending => write!(f, "pending"),
            StepState::Running => write!(f, "running"),
            StepState::Succeeded => write!(f, "succeeded"),
            StepState::Failed => write!(f, "failed"),
            StepState::Compensated => write!(f, "compensated"),
        }
    }
}

/// Outcome of one step within a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepResult {
    pub name: String,
    pub state: StepState,
    pub attempt_count: u32,
    pub error: Option<String>,
}

impl StepResult {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            state: StepState::Pending,
            attempt_count: 0,
            error: None,
        }
    }
}

/// A record of a run state transition with timestamp.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunHistoryEntry {
    pub state: RunState,
    pub entered_at: DateTime<Utc>,
}

/// One execution of a workflow against a claimed work item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRun {
    pub id: RunId,
    pub work_item_id: WorkId,
    pub workflow: String,
    pub state: RunState,
    /// Step results in declaration order.
    pub steps: Vec<StepResult>,
    history: Vec<RunHistoryEntry>,
}

impl WorkflowRun {
    pub fn new<'a>(
        work_item_id: WorkId,
        workflow: &str,
        step_names: impl IntoIterator<Item = &'a str>,
    ) -> Self {
        Self {
            id: RunId::new(),
            work_item_id,
            workflow: workflow.to_string(),
            state: RunState::Running,
            steps: step_names.into_iter().map(StepResult::new).collect(),
            history: vec![RunHistoryEntry {
                state: RunState::Running,
                entered_at: Utc::now(),
            }],
        }
    }

    pub fn can_transition(&self, target: RunState) -> bool {
        matches!(
            (self.state, target),
            (RunState::Running, RunState::Completed)
                | (RunState::Running, RunState::Failed)
                | (RunState::Running, RunState::Compensating)
                | (RunState::Compensating, RunState::Failed)
        )
    }

    /// Move the run to `target`, recording the transition.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidRunTransition` for a transition the run
    /// lifecycle does not allow.
    pub fn transition(&mut self, target: RunState) -> Result<()> {
        if !self.can_transition(target) {
            return Err(Error::InvalidRunTransition {
                from: self.state.to_string(),
                to: target.to_string(),
            });
        }
        self.state = target;
        self.history.push(RunHistoryEntry {
            state: target,
            entered_at: Utc::now(),
        });
        Ok(())
    }

    pub fn history(&self) -> &[RunHistoryEntry] {
        &self.history
    }

    pub fn step(&self, name: &str) -> Option<&StepResult> {
        self.steps.iter().find(|s| s.name == name)
    }

    pub fn step_mut(&mut self, name: &str) -> Option<&mut StepResult> {
        self.steps.iter_mut().find(|s| s.name == name)
    }

    pub fn steps_in(&self, state: StepState) -> impl Iterator<Item = &StepResult> {
        self.steps.iter().filter(move |s| s.state == state)
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run() -> WorkflowRun {
        WorkflowRun::new(WorkId::new(), "analysis", ["fetch", "analyze"])
    }

    #[test]
    fn test_new_run_is_running_with_pending_steps() {
        let run = run();
        assert_eq!(run.state, RunState::Running);
        assert_eq!(run.history().len(), 1);
        assert_eq!(run.steps.len(), 2);
        assert!(run.steps.iter().all(|s| s.state == StepState::Pending));
    }

    #[test]
    fn test_success_path() {
        let mut run = run();
        run.transition(RunState::Completed).unwrap();
        assert!(run.is_terminal());
        assert_eq!(run.history().len(), 2);
    }

    #[test]
    fn test_compensation_path_ends_failed() {
        let mut run = run();
        run.transition(RunState::Compensating).unwrap();
        assert!(!run.can_transition(RunState::Completed));
        run.transition(RunState::Failed).unwrap();
        let states: Vec<RunState> = run.history().iter().map(|h| h.state).collect();
        assert_eq!(
            states,
            vec![RunState::Running, RunState::Compensating, RunState::Failed]
        );
    }

    #[test]
    fn test_terminal_runs_do_not_move() {
        let mut run = run();
        run.transition(RunState::Failed).unwrap();
        let err = run.transition(RunState::Running).unwrap_err();
        assert!(matches!(err, Error::InvalidRunTransition { .. }));
        assert_eq!(
            err.to_string(),
            "Invalid run transition from failed to running"
        );
    }

    #[test]
    fn test_step_lookup() {
        let mut run = run();
        run.step_mut("analyze").unwrap().state = StepState::Succeeded;
        assert_eq!(run.step("analyze").unwrap().state, StepState::Succeeded);
        assert!(run.step("missing").is_none());
        assert_eq!(run.steps_in(StepState::Pending).count(), 1);
    }
}
