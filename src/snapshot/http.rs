//! Snapshot backend that talks to a remote memory-checkpoint service.

use std::time::Duration;

use serde::Deserialize;
use tracing::{info, info_span, Instrument};

use super::{BackendFuture, SnapshotBackend};
use crate::{AppError, Result};

/// HTTP client for a container checkpoint API.
///
/// Endpoints (relative to `endpoint`): `POST /checkpoint`, `POST /restore`,
/// `POST /discard`, all authenticated with a bearer token.
#[derive(Debug, Clone)]
pub struct HttpSnapshotBackend {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    project_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CheckpointResponse {
    snapshot_id: Option<String>,
}

impl HttpSnapshotBackend {
    /// Build a backend with a per-request `timeout`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the HTTP client cannot be built.
    pub fn new(
        endpoint: String,
        api_key: String,
        project_id: Option<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| AppError::Config(format!("failed to build http client: {err}")))?;
        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_owned(),
            api_key,
            project_id,
        })
    }

    async fn post(&self, path: &str, body: serde_json::Value) -> Result<reqwest::Response> {
        let response = self
            .client
            .post(format!("{}/{path}", self.endpoint))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?
            .error_for_status()?;
        Ok(response)
    }
}

impl SnapshotBackend for HttpSnapshotBackend {
    fn create(&self, container_id: &str) -> BackendFuture<'_, String> {
        let container_id = container_id.to_owned();
        let span = info_span!("snapshot_create", container_id);
        Box::pin(
            async move {
                let checkpoint_name = format!(
                    "{container_id}-{}",
                    chrono::Utc::now().format("%Y%m%d%H%M%S%3f")
                );
                let response = self
                    .post(
                        "checkpoint",
                        serde_json::json!({
                            "container_id": container_id,
                            "checkpoint_name": checkpoint_name,
                            "project_id": self.project_id,
                        }),
                    )
                    .await?;
                let body: CheckpointResponse = response.json().await?;
                let snapshot_id = body.snapshot_id.ok_or_else(|| {
                    AppError::Snapshot("checkpoint response missing snapshot_id".into())
                })?;
                info!(snapshot_id, "remote snapshot created");
                Ok(snapshot_id)
            }
            .instrument(span),
        )
    }

    fn restore(&self, snapshot_ref: &str) -> BackendFuture<'_, ()> {
        let snapshot_ref = snapshot_ref.to_owned();
        let span = info_span!("snapshot_restore", snapshot_ref);
        Box::pin(
            async move {
                self.post(
                    "restore",
                    serde_json::json!({
                        "snapshot_id": snapshot_ref,
                        "project_id": self.project_id,
                    }),
                )
                .await?;
                info!("remote snapshot restored");
                Ok(())
            }
            .instrument(span),
        )
    }

    fn discard(&self, container_id: &str) -> BackendFuture<'_, ()> {
        let container_id = container_id.to_owned();
        let span = info_span!("snapshot_discard", container_id);
        Box::pin(
            async move {
                self.post(
                    "discard",
                    serde_json::json!({
                        "container_id": container_id,
                        "project_id": self.project_id,
                    }),
                )
                .await?;
                info!("remote container discarded");
                Ok(())
            }
            .instrument(span),
        )
    }
}
