//! Integration tests for checkpoint retention.
//!
//! Validates:
//! - Checkpoints older than the cutoff are purged
//! - The newest checkpoint of every session survives the purge
//! - A file-backed database keeps checkpoints across reconnects

use std::sync::Arc;

use chrono::{Duration, Utc};
use phoenix_engine::models::checkpoint::CheckpointRecord;
use phoenix_engine::models::session::SessionState;
use phoenix_engine::persistence::checkpoint_repo::CheckpointRepo;
use phoenix_engine::persistence::{db, retention};

/// A record for `state` backdated by `age_days`.
fn aged_record(state: &SessionState, age_days: i64) -> CheckpointRecord {
    let mut record = CheckpointRecord::capture(state, format!("snap-{age_days}")).unwrap();
    record.created_at = Utc::now() - Duration::days(age_days);
    record
}

#[tokio::test]
async fn purge_removes_old_checkpoints_but_keeps_newest_per_session() {
    let db = Arc::new(db::connect_memory().await.unwrap());
    let repo = CheckpointRepo::new(db);

    let busy = SessionState::new("1. a".into(), "u1".into());
    let idle = SessionState::new("1. b".into(), "u2".into());

    repo.create(&aged_record(&busy, 40)).await.unwrap();
    repo.create(&aged_record(&busy, 35)).await.unwrap();
    let recent = repo.create(&aged_record(&busy, 1)).await.unwrap();
    repo.create(&aged_record(&idle, 60)).await.unwrap();
    let idle_newest = repo.create(&aged_record(&idle, 50)).await.unwrap();

    let removed = retention::purge(&repo, 30).await.unwrap();
    assert_eq!(removed, 3);

    let busy_left = repo.list_for_session(&busy.session_id).await.unwrap();
    assert_eq!(busy_left.len(), 1);
    assert_eq!(busy_left[0].checkpoint_id, recent.checkpoint_id);

    let idle_left = repo.list_for_session(&idle.session_id).await.unwrap();
    assert_eq!(idle_left.len(), 1);
    assert_eq!(idle_left[0].checkpoint_id, idle_newest.checkpoint_id);
}

#[tokio::test]
async fn purge_with_nothing_expired_removes_nothing() {
    let db = Arc::new(db::connect_memory().await.unwrap());
    let repo = CheckpointRepo::new(db);
    let state = SessionState::new("1. a".into(), "u1".into());

    repo.create(&aged_record(&state, 2)).await.unwrap();
    repo.create(&aged_record(&state, 1)).await.unwrap();

    assert_eq!(retention::purge(&repo, 30).await.unwrap(), 0);
    assert_eq!(repo.count().await.unwrap(), 2);
}

#[tokio::test]
async fn file_backed_store_survives_reconnect() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("phoenix.db");
    let state = SessionState::new("1. persist me".into(), "u1".into());

    let written = {
        let db = Arc::new(db::connect(&path).await.unwrap());
        let repo = CheckpointRepo::new(Arc::clone(&db));
        let record = repo.create(&aged_record(&state, 0)).await.unwrap();
        db.close().await;
        record
    };

    let db = Arc::new(db::connect(&path).await.unwrap());
    let repo = CheckpointRepo::new(db);
    let read = repo.get_by_id(&written.checkpoint_id).await.unwrap();
    assert_eq!(read.session_id, state.session_id);
    assert_eq!(read.state_hash, written.state_hash);
    read.verify_integrity().unwrap();
}
