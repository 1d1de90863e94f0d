//! In-process snapshot backend that only logs the commands it would run.
//!
//! Used for development, demos, and tests. Failures can be injected per
//! operation to exercise the engine's best-effort checkpoint path, and
//! `create` can be slowed down to stand in for a real freeze.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use tracing::{info, warn};
use uuid::Uuid;

use super::{BackendFuture, SnapshotBackend};
use crate::AppError;

/// Logging snapshot backend with optional failure injection.
#[derive(Debug, Default)]
pub struct SimulatedSnapshotBackend {
    fail_create: AtomicBool,
    fail_restore: AtomicBool,
    fail_discard: AtomicBool,
    create_delay_ms: AtomicU64,
    created: AtomicU64,
    restored: Mutex<Vec<String>>,
    discarded: Mutex<Vec<String>>,
}

impl SimulatedSnapshotBackend {
    /// Construct a backend where every operation succeeds.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent `create` calls fail (or succeed again).
    pub fn set_fail_create(&self, fail: bool) {
        self.fail_create.store(fail, Ordering::SeqCst);
    }

    /// Make subsequent `restore` calls fail (or succeed again).
    pub fn set_fail_restore(&self, fail: bool) {
        self.fail_restore.store(fail, Ordering::SeqCst);
    }

    /// Make subsequent `discard` calls fail (or succeed again).
    pub fn set_fail_discard(&self, fail: bool) {
        self.fail_discard.store(fail, Ordering::SeqCst);
    }

    /// Delay every subsequent `create` by `delay` before it completes.
    pub fn set_create_delay(&self, delay: Duration) {
        let millis = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self.create_delay_ms.store(millis, Ordering::SeqCst);
    }

    /// Number of snapshots successfully created.
    #[must_use]
    pub fn created_count(&self) -> u64 {
        self.created.load(Ordering::SeqCst)
    }

    /// Snapshot references restored so far, in call order.
    #[must_use]
    pub fn restored_refs(&self) -> Vec<String> {
        self.restored
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    /// Container identifiers discarded so far, in call order.
    #[must_use]
    pub fn discarded_containers(&self) -> Vec<String> {
        self.discarded
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }
}

impl SnapshotBackend for SimulatedSnapshotBackend {
    fn create(&self, container_id: &str) -> BackendFuture<'_, String> {
        let container_id = container_id.to_owned();
        Box::pin(async move {
            let delay_ms = self.create_delay_ms.load(Ordering::SeqCst);
            if delay_ms > 0 {
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            }
            if self.fail_create.load(Ordering::SeqCst) {
                warn!(container_id, "simulated snapshot create failure");
                return Err(AppError::Snapshot("snapshot backend unavailable".into()));
            }
            let snapshot_ref = format!("snap_{}", &Uuid::new_v4().simple().to_string()[..12]);
            info!(container_id, snapshot_ref, "would run: mmcloud checkpoint");
            self.created.fetch_add(1, Ordering::SeqCst);
            Ok(snapshot_ref)
        })
    }

    fn restore(&self, snapshot_ref: &str) -> BackendFuture<'_, ()> {
        let snapshot_ref = snapshot_ref.to_owned();
        Box::pin(async move {
            if self.fail_restore.load(Ordering::SeqCst) {
                warn!(snapshot_ref, "simulated snapshot restore failure");
                return Err(AppError::Snapshot(format!(
                    "cannot restore snapshot {snapshot_ref}"
                )));
            }
            info!(snapshot_ref, "would run: mmcloud restore");
            self.restored
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .push(snapshot_ref);
            Ok(())
        })
    }

    fn discard(&self, container_id: &str) -> BackendFuture<'_, ()> {
        let container_id = container_id.to_owned();
        Box::pin(async move {
            if self.fail_discard.load(Ordering::SeqCst) {
                warn!(container_id, "simulated discard failure");
                return Err(AppError::Snapshot(format!(
                    "cannot discard container {container_id}"
                )));
            }
            warn!(container_id, "would run: docker kill");
            self.discarded
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .push(container_id);
            Ok(())
        })
    }
}
