use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

use crate::domain::AgentState;
use crate::error::{OrchestratorError, Result};

/// Hot-swap state machine states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SwapStatus {
    Initiating,
    CapturingState,
    Pausing,
    TransferringState,
    Verifying,
    Completed,
    Failed,
    /// Old agent resumed after a failure past the pause
    RolledBack,
}

impl SwapStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SwapStatus::Initiating => "initiating",
            SwapStatus::CapturingState => "capturing_state",
            SwapStatus::Pausing => "pausing",
            SwapStatus::TransferringState => "transferring_state",
            SwapStatus::Verifying => "verifying",
            SwapStatus::Completed => "completed",
            SwapStatus::Failed => "failed",
            SwapStatus::RolledBack => "rolled_back",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SwapStatus::Completed | SwapStatus::Failed | SwapStatus::RolledBack
        )
    }

    /// Check if this state can transition to another state
    pub fn can_transition_to(&self, target: SwapStatus) -> bool {
        use SwapStatus::*;

        match (self, target) {
            // Terminal states never change
            (Completed | Failed | RolledBack, _) => false,

            // Any live state may fail
            (_, Failed) => true,

            (Initiating, CapturingState) => true,

            (CapturingState, Pausing) => true,

            // The old agent is paused from here on, so rollback becomes possible
            (Pausing, Verifying) => true,
            (Pausing, TransferringState) => true,
            (Pausing, RolledBack) => true,

            (Verifying, TransferringState) => true,
            (Verifying, RolledBack) => true,

            (TransferringState, Completed) => true,
            (TransferringState, RolledBack) => true,

            _ => false,
        }
    }
}

impl fmt::Display for SwapStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Running,
    Completed,
    Failed,
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepStatus::Running => write!(f, "running"),
            StepStatus::Completed => write!(f, "completed"),
            StepStatus::Failed => write!(f, "failed"),
        }
    }
}

/// One recorded protocol step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwapStep {
    pub name: String,
    pub status: StepStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration: Option<Duration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SwapStep {
    fn start(name: &str) -> Self {
        Self {
            name: name.to_string(),
            status: StepStatus::Running,
            started_at: Utc::now(),
            completed_at: None,
            duration: None,
            error: None,
        }
    }

    pub fn complete(&mut self) {
        self.finish(StepStatus::Completed);
    }

    pub fn fail(&mut self, error: &str) {
        self.error = Some(error.to_string());
        self.finish(StepStatus::Failed);
    }

    pub fn is_running(&self) -> bool {
        self.status == StepStatus::Running
    }

    fn finish(&mut self, status: StepStatus) {
        let now = Utc::now();
        self.status = status;
        self.completed_at = Some(now);
        self.duration = Some(elapsed(self.started_at, now));
    }
}

/// Elapsed time between two instants; never zero for a finished record
fn elapsed(start: DateTime<Utc>, end: DateTime<Utc>) -> Duration {
    (end - start)
        .to_std()
        .unwrap_or_default()
        .max(Duration::from_nanos(1))
}

/// Audit record of one hot-swap attempt.
///
/// Steps are append-only and the status only moves forward; once terminal
/// the session no longer changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwapSession {
    pub id: String,
    pub old_agent_name: String,
    pub new_agent_name: String,
    pub status: SwapStatus,
    pub state_snapshot: Option<AgentState>,
    pub steps: Vec<SwapStep>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration: Option<Duration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SwapSession {
    pub fn new(old_agent_name: &str, new_agent_name: &str) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            old_agent_name: old_agent_name.to_string(),
            new_agent_name: new_agent_name.to_string(),
            status: SwapStatus::Initiating,
            state_snapshot: None,
            steps: Vec::new(),
            started_at: Utc::now(),
            completed_at: None,
            duration: None,
            error: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Start a step; returns its index for `complete_step` / `fail_step`
    pub fn add_step(&mut self, name: &str) -> usize {
        self.steps.push(SwapStep::start(name));
        self.steps.len() - 1
    }

    pub fn complete_step(&mut self, index: usize) {
        if let Some(step) = self.steps.get_mut(index) {
            step.complete();
        }
    }

    pub fn fail_step(&mut self, index: usize, error: &str) {
        if let Some(step) = self.steps.get_mut(index) {
            step.fail(error);
        }
    }

    pub fn step(&self, name: &str) -> Option<&SwapStep> {
        self.steps.iter().find(|s| s.name == name)
    }

    /// Move to `next`, rejecting backwards or post-terminal moves
    pub fn transition(&mut self, next: SwapStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(OrchestratorError::InvalidStateTransition {
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        debug!("Swap {} state: {} -> {}", self.id, self.status, next);
        self.status = next;
        Ok(())
    }

    pub fn complete(&mut self) -> Result<()> {
        self.transition(SwapStatus::Completed)?;
        self.finish();
        Ok(())
    }

    /// Record `error` and end the session as `Failed`
    pub fn fail(&mut self, error: &dyn fmt::Display) {
        self.end_with(SwapStatus::Failed, error);
    }

    /// Record `error` and end the session as `RolledBack`
    pub fn roll_back(&mut self, error: &dyn fmt::Display) {
        self.end_with(SwapStatus::RolledBack, error);
    }

    fn end_with(&mut self, status: SwapStatus, error: &dyn fmt::Display) {
        if self.is_terminal() {
            debug!(
                "Swap {} already {}, ignoring {} ({})",
                self.id, self.status, status, error
            );
            return;
        }
        let message = error.to_string();
        for step in self.steps.iter_mut().filter(|s| s.is_running()) {
            step.fail(&message);
        }
        // Every live state may fail; a rollback that is not allowed from here degrades to a failure.
        let status = if self.status.can_transition_to(status) {
            status
        } else {
            SwapStatus::Failed
        };
        self.status = status;
        self.error = Some(message);
        self.finish();
    }

    fn finish(&mut self) {
        let now = Utc::now();
        self.completed_at = Some(now);
        self.duration = Some(elapsed(self.started_at, now));
    }
}

/// Broadcast notifications about swap progress
#[derive(Debug, Clone, PartialEq)]
pub enum SwapEvent {
    Started {
        session_id: String,
        old_agent: String,
        new_agent: String,
    },
    StepCompleted {
        session_id: String,
        step: String,
    },
    Completed {
        session_id: String,
        duration: Duration,
    },
    Failed {
        session_id: String,
        error: String,
    },
    RolledBack {
        session_id: String,
        error: String,
    },
}
