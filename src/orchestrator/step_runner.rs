//! Execution of exactly one task step.
//!
//! [`run_step`] is split into [`begin_step`], [`execute_current`], and
//! [`finish_step`] so the worker can publish the `in_progress` state
//! before awaiting the collaborator, and abandon the await on crash
//! without touching `steps` again.

use tracing::{info, warn};

use crate::collaborator::{Collaborator, StepResult};
use crate::models::session::{SessionState, SessionStatus};
use crate::models::step::StepStatus;
use crate::{AppError, Result};

/// How a step finished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    /// Step completed; execution may continue.
    Completed {
        /// 1-based number of the step.
        step_number: u32,
    },
    /// Step failed; the session must move to `failed`.
    Failed {
        /// 1-based number of the step.
        step_number: u32,
        /// Collaborator error text, also stored in the step's `result`.
        error: String,
    },
}

/// Mark the current step `in_progress`.
///
/// Returns the index of the started step.
///
/// # Errors
///
/// Returns `AppError::InvalidState` if the session is not `running`, no
/// step remains, or the current step is not `pending`.
pub fn begin_step(state: &mut SessionState) -> Result<usize> {
    if state.status != SessionStatus::Running {
        return Err(AppError::InvalidState(format!(
            "session {} is {}, not running",
            state.session_id,
            state.status.as_str()
        )));
    }

    let index = state.current_step_index;
    let step = state.steps.get_mut(index).ok_or_else(|| {
        AppError::InvalidState(format!(
            "no step at index {index} (plan has {})",
            state.total_steps
        ))
    })?;

    if step.status != StepStatus::Pending {
        return Err(AppError::InvalidState(format!(
            "step {} is {:?}, not pending",
            step.step_number, step.status
        )));
    }

    step.start()?;
    state.touch();
    Ok(index)
}

/// Ask the collaborator to execute the step at the current index.
///
/// Does not mutate state, so the returned future can be dropped safely.
///
/// # Errors
///
/// Returns `AppError::InvalidState` if there is no current step, or the
/// collaborator's error.
pub async fn execute_current(
    state: &SessionState,
    collaborator: &dyn Collaborator,
) -> Result<StepResult> {
    let step = state.current_step().ok_or_else(|| {
        AppError::InvalidState(format!(
            "no step at index {}",
            state.current_step_index
        ))
    })?;
    let context = state.context.clone().unwrap_or(serde_json::Value::Null);
    let prior = state.prior_results();

    collaborator
        .execute_step(&step.description, &context, &prior)
        .await
}

/// Record the collaborator outcome on the step at `index` and advance.
///
/// # Errors
///
/// Returns `AppError::InvalidState` if `index` is not the current,
/// in-progress step.
pub fn finish_step(
    state: &mut SessionState,
    index: usize,
    outcome: Result<StepResult>,
) -> Result<StepOutcome> {
    if index != state.current_step_index {
        return Err(AppError::InvalidState(format!(
            "finishing step index {index} but current index is {}",
            state.current_step_index
        )));
    }
    let step = state
        .steps
        .get_mut(index)
        .ok_or_else(|| AppError::InvalidState(format!("no step at index {index}")))?;
    let step_number = step.step_number;

    let result = match outcome {
        Ok(result) => {
            step.complete(result.output)?;
            if let Some(conflict) = result.conflict {
                state.conflict_info = Some(conflict);
            }
            info!(session_id = %state.session_id, step_number, "step completed");
            StepOutcome::Completed { step_number }
        }
        Err(err) => {
            let error = err.to_string();
            step.fail(&error)?;
            warn!(session_id = %state.session_id, step_number, %error, "step failed");
            StepOutcome::Failed { step_number, error }
        }
    };

    state.current_step_index += 1;
    state.touch();
    Ok(result)
}

/// Execute exactly one step: begin, call the collaborator, finish.
///
/// A collaborator error is not an `Err` here; it marks the step `failed`
/// and is reported as [`StepOutcome::Failed`].
///
/// # Errors
///
/// Returns `AppError::InvalidState` if the preconditions do not hold.
pub async fn run_step(
    state: &mut SessionState,
    collaborator: &dyn Collaborator,
) -> Result<StepOutcome> {
    let index = begin_step(state)?;
    let outcome = execute_current(state, collaborator).await;
    finish_step(state, index, outcome)
}
