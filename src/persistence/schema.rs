//! `SQLite` schema bootstrap logic.
//!
//! All definitions use `IF NOT EXISTS` so the bootstrap is safe to re-run
//! on every startup.

use sqlx::SqlitePool;

use crate::Result;

/// Apply all table and index definitions to the connected database.
///
/// # Errors
///
/// Returns `AppError::Db` if any DDL statement fails.
pub async fn bootstrap_schema(pool: &SqlitePool) -> Result<()> {
    let ddl = r"
CREATE TABLE IF NOT EXISTS checkpoint (
    id               TEXT PRIMARY KEY NOT NULL,
    session_id       TEXT NOT NULL,
    step_number      INTEGER NOT NULL CHECK(step_number >= 0),
    total_steps      INTEGER NOT NULL CHECK(total_steps >= 0),
    task_description TEXT NOT NULL,
    snapshot_ref     TEXT NOT NULL,
    state_hash       TEXT NOT NULL,
    session_state    TEXT NOT NULL,
    created_at       TEXT NOT NULL,
    CHECK(step_number <= total_steps)
);

CREATE INDEX IF NOT EXISTS idx_checkpoint_session ON checkpoint(session_id);
CREATE INDEX IF NOT EXISTS idx_checkpoint_created ON checkpoint(created_at);
";

    sqlx::raw_sql(ddl).execute(pool).await?;
    Ok(())
}
