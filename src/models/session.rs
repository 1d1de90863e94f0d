//! Session state model and lifecycle helpers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::step::{StepStatus, TaskStep};
use crate::{AppError, Result};

/// Lifecycle status for a task session.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Loading context and planning.
    Starting,
    /// Executing steps.
    Running,
    /// All steps done and the final response synthesized.
    Completed,
    /// A step or the planning phase failed.
    Failed,
    /// Externally crashed; waits for a restore.
    Crashed,
}

impl SessionStatus {
    /// Stable lowercase name used in logs and the API.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Crashed => "crashed",
        }
    }

    /// Whether a restore may move this status back to `running`.
    #[must_use]
    pub fn is_restorable(self) -> bool {
        matches!(self, Self::Crashed | Self::Failed)
    }
}

/// The complete resumable state of one task run.
///
/// This is exactly what a checkpoint captures.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct SessionState {
    /// Unique identifier assigned at start.
    pub session_id: String,
    /// User whose context drives the run.
    pub user_id: String,
    /// Immutable task text.
    pub task_description: String,
    /// Current lifecycle status.
    pub status: SessionStatus,
    /// Planned steps in execution order.
    pub steps: Vec<TaskStep>,
    /// Index of the next step to run; equals `steps.len()` when done.
    pub current_step_index: usize,
    /// Fixed once planning completes.
    pub total_steps: usize,
    /// Context blob returned by the context collaborator.
    pub context: Option<serde_json::Value>,
    /// Conflict summary from the context collaborator, stored verbatim.
    pub conflict_info: Option<serde_json::Value>,
    /// Synthesized answer; set only on completion.
    pub final_response: Option<String>,
    /// Failure reason when the session failed outside a step.
    pub error: Option<String>,
    /// Number of checkpoints written for this session.
    pub checkpoint_count: u32,
    /// Time of the last successful checkpoint.
    pub last_checkpoint_at: Option<DateTime<Utc>>,
    /// Checkpoint attempts that failed since the last success.
    pub consecutive_checkpoint_failures: u32,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last mutation timestamp.
    pub updated_at: DateTime<Utc>,
}

/// Compact listing row for a session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct SessionSummary {
    /// Session identifier.
    pub session_id: String,
    /// Task text.
    pub task_description: String,
    /// Current lifecycle status.
    pub status: SessionStatus,
    /// Index of the next step to run.
    pub current_step_index: usize,
    /// Planned step count.
    pub total_steps: usize,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
}

impl SessionState {
    /// Construct a new `starting` session with a generated identifier.
    #[must_use]
    pub fn new(task_description: String, user_id: String) -> Self {
        let now = Utc::now();
        Self {
            session_id: Uuid::new_v4().to_string(),
            user_id,
            task_description,
            status: SessionStatus::Starting,
            steps: Vec::new(),
            current_step_index: 0,
            total_steps: 0,
            context: None,
            conflict_info: None,
            final_response: None,
            error: None,
            checkpoint_count: 0,
            last_checkpoint_at: None,
            consecutive_checkpoint_failures: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Determine whether a lifecycle transition is permitted.
    #[must_use]
    pub fn can_transition_to(&self, next: SessionStatus) -> bool {
        matches!(
            (self.status, next),
            (
                SessionStatus::Starting,
                SessionStatus::Running | SessionStatus::Completed | SessionStatus::Failed
            ) | (
                SessionStatus::Running,
                SessionStatus::Completed | SessionStatus::Failed | SessionStatus::Crashed
            ) | (
                SessionStatus::Crashed | SessionStatus::Failed,
                SessionStatus::Running
            )
        )
    }

    /// Apply a lifecycle transition, bumping `updated_at`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvalidState` if the transition is not permitted.
    pub fn transition_to(&mut self, next: SessionStatus) -> Result<()> {
        if !self.can_transition_to(next) {
            return Err(AppError::InvalidState(format!(
                "session {} cannot move from {} to {}",
                self.session_id,
                self.status.as_str(),
                next.as_str()
            )));
        }
        self.status = next;
        self.touch();
        Ok(())
    }

    /// Record the finalized plan.
    pub fn set_plan(&mut self, descriptions: Vec<String>) {
        self.steps = descriptions
            .into_iter()
            .zip(1_u32..)
            .map(|(description, number)| TaskStep::new(number, description))
            .collect();
        self.total_steps = self.steps.len();
        self.current_step_index = 0;
        self.touch();
    }

    /// The step that the next `RunStep` call would execute.
    #[must_use]
    pub fn current_step(&self) -> Option<&TaskStep> {
        self.steps.get(self.current_step_index)
    }

    /// Whether every planned step has been executed.
    #[must_use]
    pub fn all_steps_done(&self) -> bool {
        self.current_step_index >= self.total_steps
    }

    /// Results of all finished steps before the current index, in order.
    #[must_use]
    pub fn prior_results(&self) -> Vec<serde_json::Value> {
        self.steps
            .iter()
            .take(self.current_step_index)
            .filter_map(|step| step.result.clone())
            .collect()
    }

    /// Whether any step is mid-execution.
    #[must_use]
    pub fn has_step_in_progress(&self) -> bool {
        self.steps
            .iter()
            .any(|step| step.status == StepStatus::InProgress)
    }

    /// Check that this state can be resumed at `step_number`.
    ///
    /// Every step before the index must be finished and none may be in
    /// progress.
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvalidState` describing the first violation.
    pub fn check_resumable_at(&self, step_number: usize) -> Result<()> {
        if step_number > self.total_steps || self.total_steps != self.steps.len() {
            return Err(AppError::InvalidState(format!(
                "step index {step_number} outside plan of {} steps",
                self.total_steps
            )));
        }
        if self.current_step_index != step_number {
            return Err(AppError::InvalidState(format!(
                "captured index {} does not match checkpoint step {step_number}",
                self.current_step_index
            )));
        }
        if let Some(step) = self.steps[..step_number]
            .iter()
            .find(|step| !step.status.is_finished())
        {
            return Err(AppError::InvalidState(format!(
                "step {} before resume point is {:?}",
                step.step_number, step.status
            )));
        }
        if self.has_step_in_progress() {
            return Err(AppError::InvalidState(
                "captured state has a step in progress".into(),
            ));
        }
        Ok(())
    }

    /// Listing row for this session.
    #[must_use]
    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            session_id: self.session_id.clone(),
            task_description: self.task_description.clone(),
            status: self.status,
            current_step_index: self.current_step_index,
            total_steps: self.total_steps,
            created_at: self.created_at,
        }
    }

    /// Bump `updated_at`.
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}
