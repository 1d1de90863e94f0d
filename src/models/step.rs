//! Task step model and its status lifecycle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{AppError, Result};

/// Lifecycle status for a single planned step.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// Planned, not yet started.
    Pending,
    /// Currently executing.
    InProgress,
    /// Finished successfully.
    Completed,
    /// Finished with a collaborator error.
    Failed,
}

impl StepStatus {
    /// Whether the step has reached a terminal status.
    #[must_use]
    pub fn is_finished(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// One planned unit of work within a session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct TaskStep {
    /// 1-based execution order, unique within the session.
    pub step_number: u32,
    /// Free-text instruction produced by planning.
    pub description: String,
    /// Current lifecycle status.
    pub status: StepStatus,
    /// Opaque payload; present only once the step is finished.
    pub result: Option<serde_json::Value>,
    /// When the step entered `in_progress`.
    pub started_at: Option<DateTime<Utc>>,
    /// When the step finished.
    pub completed_at: Option<DateTime<Utc>>,
}

impl TaskStep {
    /// Construct a pending step.
    #[must_use]
    pub fn new(step_number: u32, description: String) -> Self {
        Self {
            step_number,
            description,
            status: StepStatus::Pending,
            result: None,
            started_at: None,
            completed_at: None,
        }
    }

    /// Determine whether a lifecycle transition is permitted.
    #[must_use]
    pub fn can_transition_to(&self, next: StepStatus) -> bool {
        matches!(
            (self.status, next),
            (StepStatus::Pending, StepStatus::InProgress)
                | (
                    StepStatus::InProgress,
                    StepStatus::Completed | StepStatus::Failed
                )
        )
    }

    /// Move the step to `in_progress` and stamp `started_at`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvalidState` unless the step is `pending`.
    pub fn start(&mut self) -> Result<()> {
        self.transition(StepStatus::InProgress)?;
        self.started_at = Some(Utc::now());
        Ok(())
    }

    /// Finish the step as `completed` with the given result.
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvalidState` unless the step is `in_progress`.
    pub fn complete(&mut self, result: serde_json::Value) -> Result<()> {
        self.finish(StepStatus::Completed, result)
    }

    /// Finish the step as `failed`, capturing the error in `result`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvalidState` unless the step is `in_progress`.
    pub fn fail(&mut self, error: &str) -> Result<()> {
        self.finish(
            StepStatus::Failed,
            serde_json::json!({ "error": error }),
        )
    }

    fn finish(&mut self, status: StepStatus, result: serde_json::Value) -> Result<()> {
        self.transition(status)?;
        self.result = Some(result);
        self.completed_at = Some(Utc::now());
        Ok(())
    }

    fn transition(&mut self, next: StepStatus) -> Result<()> {
        if !self.can_transition_to(next) {
            return Err(AppError::InvalidState(format!(
                "step {} cannot move from {:?} to {next:?}",
                self.step_number, self.status
            )));
        }
        self.status = next;
        Ok(())
    }
}
