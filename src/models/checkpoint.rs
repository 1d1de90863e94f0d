//! Checkpoint record model for session state snapshots.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use super::session::SessionState;
use super::step::StepStatus;
use crate::{AppError, Result};

/// Metadata describing one snapshot, plus the captured session state.
///
/// Immutable once written.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct CheckpointRecord {
    /// Timestamp-prefixed unique identifier; sorts by creation time.
    pub checkpoint_id: String,
    /// Owning session identifier.
    pub session_id: String,
    /// Index of the next step to run when this checkpoint was taken.
    pub step_number: usize,
    /// Planned step count at capture time.
    pub total_steps: usize,
    /// Task text of the owning session.
    pub task_description: String,
    /// Opaque handle returned by the snapshot backend.
    pub snapshot_ref: String,
    /// SHA-256 hex digest of the serialized `session_state`.
    pub state_hash: String,
    /// Serialized session state at capture time.
    pub session_state: serde_json::Value,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
}

impl CheckpointRecord {
    /// Capture `state` together with the backend's snapshot reference.
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvalidState` if a step is in progress, or
    /// `AppError::Db` if the state cannot be serialized.
    pub fn capture(state: &SessionState, snapshot_ref: String) -> Result<Self> {
        if state.has_step_in_progress() {
            return Err(AppError::InvalidState(
                "cannot checkpoint while a step is in progress".into(),
            ));
        }

        let session_state = serde_json::to_value(state)?;
        let state_hash = hash_state(&session_state)?;
        let created_at = Utc::now();

        Ok(Self {
            checkpoint_id: generate_checkpoint_id(created_at),
            session_id: state.session_id.clone(),
            step_number: state.current_step_index,
            total_steps: state.total_steps,
            task_description: state.task_description.clone(),
            snapshot_ref,
            state_hash,
            session_state,
            created_at,
        })
    }

    /// Recompute the state hash and compare it to the stored digest.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Snapshot` if the captured state was altered.
    pub fn verify_integrity(&self) -> Result<()> {
        let actual = hash_state(&self.session_state)?;
        if actual != self.state_hash {
            return Err(AppError::Snapshot(format!(
                "checkpoint {} state hash mismatch",
                self.checkpoint_id
            )));
        }
        Ok(())
    }

    /// Rebuild the captured session state and check it is resumable at
    /// `step_number`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Snapshot` if integrity fails or the captured state
    /// is inconsistent with the record metadata, or `AppError::InvalidState`
    /// if it captured a failed step. Execution never continues past one.
    pub fn rehydrate(&self) -> Result<SessionState> {
        self.verify_integrity()?;

        let state: SessionState = serde_json::from_value(self.session_state.clone())
            .map_err(|err| AppError::Snapshot(format!("invalid captured state: {err}")))?;

        if state.session_id != self.session_id {
            return Err(AppError::Snapshot(format!(
                "checkpoint {} captured a different session",
                self.checkpoint_id
            )));
        }
        state
            .check_resumable_at(self.step_number)
            .map_err(|err| AppError::Snapshot(format!("checkpoint not resumable: {err}")))?;

        if let Some(step) = state
            .steps
            .iter()
            .find(|step| step.status == StepStatus::Failed)
        {
            return Err(AppError::InvalidState(format!(
                "checkpoint {} captured failed step {}; restore an earlier checkpoint to retry it",
                self.checkpoint_id, step.step_number
            )));
        }

        Ok(state)
    }
}

/// Build a checkpoint identifier of the form `ckpt_YYYYMMDD_HHMMSSmmm_xxxxxxxx`.
#[must_use]
pub fn generate_checkpoint_id(at: DateTime<Utc>) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("ckpt_{}_{}", at.format("%Y%m%d_%H%M%S%3f"), &suffix[..8])
}

/// SHA-256 hex digest of a serialized state value.
///
/// # Errors
///
/// Returns `AppError::Db` if the value cannot be serialized.
pub fn hash_state(state: &serde_json::Value) -> Result<String> {
    let bytes = serde_json::to_vec(state)?;
    Ok(sha256_hex(&bytes))
}

fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}
