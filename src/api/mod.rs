//! Thin HTTP surface over the [`TaskOrchestrator`].
//!
//! Every handler delegates to one orchestrator operation and maps
//! [`AppError`] to a status code with a `{"error": "..."}` body.

pub mod routes;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::orchestrator::TaskOrchestrator;
use crate::{AppError, Result};

/// State shared by all handlers.
#[derive(Clone)]
pub struct ApiState {
    /// Engine the handlers drive.
    pub orchestrator: Arc<TaskOrchestrator>,
    /// Page size when a checkpoint listing omits `limit`.
    pub default_list_limit: u32,
}

impl AppError {
    /// HTTP status code for this error kind.
    #[must_use]
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::InvalidState(_) | Self::RestoreConflict(_) => StatusCode::CONFLICT,
            Self::Snapshot(_) | Self::Collaborator(_) => StatusCode::BAD_GATEWAY,
            Self::Config(_) | Self::Db(_) | Self::Io(_) | Self::Http(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = Json(serde_json::json!({ "error": self.to_string() }));
        (self.status_code(), body).into_response()
    }
}

/// Build the API router.
pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(routes::health))
        .route("/api/agent/start", post(routes::start))
        .route("/api/agent/status/{session_id}", get(routes::status))
        .route("/api/agent/sessions", get(routes::sessions))
        .route("/api/agent/session/{session_id}", delete(routes::delete_session))
        .route(
            "/api/checkpoints",
            post(routes::create_checkpoint).get(routes::list_checkpoints),
        )
        .route(
            "/api/checkpoints/{checkpoint_id}",
            get(routes::get_checkpoint).delete(routes::delete_checkpoint),
        )
        .route("/api/restore", post(routes::restore))
        .route("/api/simulate-crash", post(routes::simulate_crash))
        .route("/api/demo-status", get(routes::demo_status))
        .with_state(state)
}

/// Serve the API on an already-bound listener until `ct` is cancelled.
///
/// # Errors
///
/// Returns `AppError::Http` if the server fails.
pub async fn serve(listener: TcpListener, state: ApiState, ct: CancellationToken) -> Result<()> {
    let addr = listener
        .local_addr()
        .map_err(|err| AppError::Http(format!("listener has no address: {err}")))?;
    info!(%addr, "starting HTTP API");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { ct.cancelled().await })
        .await
        .map_err(|err| AppError::Http(format!("http server error: {err}")))?;

    info!("HTTP API shut down");
    Ok(())
}

/// Bind `127.0.0.1:port` and serve the API until `ct` is cancelled.
///
/// # Errors
///
/// Returns `AppError::Http` if the port cannot be bound or the server fails.
pub async fn serve_on_port(port: u16, state: ApiState, ct: CancellationToken) -> Result<()> {
    let bind = SocketAddr::from(([127, 0, 0, 1], port));
    let listener = TcpListener::bind(bind)
        .await
        .map_err(|err| AppError::Http(format!("failed to bind {bind}: {err}")))?;
    serve(listener, state, ct).await
}
