//! Snapshot backend abstraction.
//!
//! The [`SnapshotBackend`] trait isolates the engine from whatever
//! physically freezes and restores a process image. The engine only ever
//! sees an opaque snapshot reference string.

pub mod http;
pub mod simulated;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{SnapshotBackendKind, SnapshotConfig};
use crate::Result;

pub use http::HttpSnapshotBackend;
pub use simulated::SimulatedSnapshotBackend;

/// Boxed future returned by backend operations.
pub type BackendFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// External mechanism that freezes, restores, and discards a process image.
pub trait SnapshotBackend: Send + Sync {
    /// Freeze the container and return an opaque snapshot reference.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Snapshot`](crate::AppError::Snapshot) if the
    /// backend is unavailable or rejects the request.
    fn create(&self, container_id: &str) -> BackendFuture<'_, String>;

    /// Rehydrate the process image behind `snapshot_ref`.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Snapshot`](crate::AppError::Snapshot) if the
    /// snapshot cannot be restored.
    fn restore(&self, snapshot_ref: &str) -> BackendFuture<'_, ()>;

    /// Discard the live process representation of the container.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Snapshot`](crate::AppError::Snapshot) if the
    /// backend cannot be reached.
    fn discard(&self, container_id: &str) -> BackendFuture<'_, ()>;
}

/// Construct the backend selected in configuration.
///
/// # Errors
///
/// Returns `AppError::Config` if the `http` backend is selected without an
/// endpoint, or its client cannot be built.
pub fn from_config(config: &SnapshotConfig) -> Result<Arc<dyn SnapshotBackend>> {
    match config.backend {
        SnapshotBackendKind::Simulated => Ok(Arc::new(SimulatedSnapshotBackend::new())),
        SnapshotBackendKind::Http => {
            let endpoint = config.endpoint.clone().ok_or_else(|| {
                crate::AppError::Config("snapshot.endpoint is required for http".into())
            })?;
            let backend = HttpSnapshotBackend::new(
                endpoint,
                config.api_key.clone(),
                config.project_id.clone(),
                Duration::from_secs(config.timeout_seconds),
            )?;
            Ok(Arc::new(backend))
        }
    }
}
