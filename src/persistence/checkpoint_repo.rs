//! Checkpoint store backed by `SQLite`.
//!
//! Records are append-mostly and keyed by their globally unique id, so no
//! cross-session locking is needed. `created_at` is stored as fixed-width
//! RFC 3339 text (microseconds, `Z` suffix) so the index sorts it.

use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};

use crate::models::checkpoint::CheckpointRecord;
use crate::{AppError, Result};

use super::db::Database;

/// Repository wrapper around `SQLite` for checkpoint records.
#[derive(Clone)]
pub struct CheckpointRepo {
    db: Arc<Database>,
}

/// Internal row struct for `SQLite` deserialization.
#[derive(sqlx::FromRow)]
struct CheckpointRow {
    id: String,
    session_id: String,
    step_number: i64,
    total_steps: i64,
    task_description: String,
    snapshot_ref: String,
    state_hash: String,
    session_state: String,
    created_at: String,
}

impl CheckpointRow {
    /// Convert a database row into the domain model.
    fn into_record(self) -> Result<CheckpointRecord> {
        let step_number = usize::try_from(self.step_number)
            .map_err(|e| AppError::Db(format!("invalid step_number: {e}")))?;
        let total_steps = usize::try_from(self.total_steps)
            .map_err(|e| AppError::Db(format!("invalid total_steps: {e}")))?;
        let created_at = DateTime::parse_from_rfc3339(&self.created_at)
            .map_err(|e| AppError::Db(format!("invalid created_at: {e}")))?
            .with_timezone(&Utc);
        let session_state = serde_json::from_str(&self.session_state)
            .map_err(|e| AppError::Db(format!("invalid session_state: {e}")))?;

        Ok(CheckpointRecord {
            checkpoint_id: self.id,
            session_id: self.session_id,
            step_number,
            total_steps,
            task_description: self.task_description,
            snapshot_ref: self.snapshot_ref,
            state_hash: self.state_hash,
            session_state,
            created_at,
        })
    }
}

fn timestamp_str(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn to_i64(value: usize, field: &str) -> Result<i64> {
    i64::try_from(value).map_err(|e| AppError::Db(format!("{field} out of range: {e}")))
}

const SELECT_COLUMNS: &str = "SELECT id, session_id, step_number, total_steps, task_description,
     snapshot_ref, state_hash, session_state, created_at FROM checkpoint";

impl CheckpointRepo {
    /// Create a new repository instance.
    #[must_use]
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Insert a new checkpoint record.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the insert fails or the record violates
    /// `step_number <= total_steps`.
    pub async fn create(&self, record: &CheckpointRecord) -> Result<CheckpointRecord> {
        if record.step_number > record.total_steps {
            return Err(AppError::Db(format!(
                "checkpoint step {} exceeds total {}",
                record.step_number, record.total_steps
            )));
        }

        let session_state = serde_json::to_string(&record.session_state)?;

        sqlx::query(
            "INSERT INTO checkpoint (id, session_id, step_number, total_steps,
             task_description, snapshot_ref, state_hash, session_state, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        )
        .bind(&record.checkpoint_id)
        .bind(&record.session_id)
        .bind(to_i64(record.step_number, "step_number")?)
        .bind(to_i64(record.total_steps, "total_steps")?)
        .bind(&record.task_description)
        .bind(&record.snapshot_ref)
        .bind(&record.state_hash)
        .bind(&session_state)
        .bind(timestamp_str(record.created_at))
        .execute(self.db.as_ref())
        .await?;

        Ok(record.clone())
    }

    /// Retrieve a checkpoint by identifier.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if the checkpoint does not exist.
    pub async fn get_by_id(&self, id: &str) -> Result<CheckpointRecord> {
        let row: Option<CheckpointRow> =
            sqlx::query_as(&format!("{SELECT_COLUMNS} WHERE id = ?1"))
                .bind(id)
                .fetch_optional(self.db.as_ref())
                .await?;
        row.ok_or_else(|| AppError::NotFound(format!("checkpoint {id} not found")))?
            .into_record()
    }

    /// Most recent checkpoint across all sessions.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn latest(&self) -> Result<Option<CheckpointRecord>> {
        let row: Option<CheckpointRow> = sqlx::query_as(&format!(
            "{SELECT_COLUMNS} ORDER BY created_at DESC, id DESC LIMIT 1"
        ))
        .fetch_optional(self.db.as_ref())
        .await?;
        row.map(CheckpointRow::into_record).transpose()
    }

    /// List up to `limit` checkpoints, newest first.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn list(&self, limit: u32) -> Result<Vec<CheckpointRecord>> {
        let rows: Vec<CheckpointRow> = sqlx::query_as(&format!(
            "{SELECT_COLUMNS} ORDER BY created_at DESC, id DESC LIMIT ?1"
        ))
        .bind(i64::from(limit))
        .fetch_all(self.db.as_ref())
        .await?;
        rows.into_iter().map(CheckpointRow::into_record).collect()
    }

    /// List all checkpoints for a session, oldest first.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn list_for_session(&self, session_id: &str) -> Result<Vec<CheckpointRecord>> {
        let rows: Vec<CheckpointRow> = sqlx::query_as(&format!(
            "{SELECT_COLUMNS} WHERE session_id = ?1 ORDER BY created_at ASC, id ASC"
        ))
        .bind(session_id)
        .fetch_all(self.db.as_ref())
        .await?;
        rows.into_iter().map(CheckpointRow::into_record).collect()
    }

    /// Count all stored checkpoints.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn count(&self) -> Result<u64> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM checkpoint")
            .fetch_one(self.db.as_ref())
            .await?;
        u64::try_from(row.0).map_err(|e| AppError::Db(format!("invalid count: {e}")))
    }

    /// Delete one checkpoint. Returns `true` if a row was removed.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the delete fails.
    pub async fn delete(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM checkpoint WHERE id = ?1")
            .bind(id)
            .execute(self.db.as_ref())
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Delete all checkpoints for a given session.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the delete fails.
    pub async fn delete_for_session(&self, session_id: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM checkpoint WHERE session_id = ?1")
            .bind(session_id)
            .execute(self.db.as_ref())
            .await?;
        Ok(result.rows_affected())
    }

    /// Delete a session's checkpoints created after `record`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the delete fails.
    pub async fn delete_newer_than(&self, record: &CheckpointRecord) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM checkpoint WHERE session_id = ?1
             AND (created_at > ?2 OR (created_at = ?2 AND id > ?3))",
        )
        .bind(&record.session_id)
        .bind(timestamp_str(record.created_at))
        .bind(&record.checkpoint_id)
        .execute(self.db.as_ref())
        .await?;
        Ok(result.rows_affected())
    }

    /// Delete checkpoints created before `cutoff`, keeping each session's newest.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the delete fails.
    pub async fn purge_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM checkpoint WHERE created_at < ?1
             AND id NOT IN (
                 SELECT c.id FROM checkpoint c
                 WHERE c.created_at = (
                     SELECT MAX(n.created_at) FROM checkpoint n
                     WHERE n.session_id = c.session_id
                 )
             )",
        )
        .bind(timestamp_str(cutoff))
        .execute(self.db.as_ref())
        .await?;
        Ok(result.rows_affected())
    }
}
