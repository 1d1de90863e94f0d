//! Error types shared across the engine.

use std::fmt::{Display, Formatter};

/// Shared engine result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Engine error enumeration covering all domain failure modes.
#[derive(Debug)]
pub enum AppError {
    /// Malformed start request; no session is created.
    Validation(String),
    /// Requested session or checkpoint does not exist.
    NotFound(String),
    /// Context, planning, step execution, or synthesis call failed.
    Collaborator(String),
    /// Snapshot backend create/restore/discard failure.
    Snapshot(String),
    /// Restore attempted while the session is still active.
    RestoreConflict(String),
    /// Session or step is not in a status that permits the operation.
    InvalidState(String),
    /// Configuration parsing or validation failure.
    Config(String),
    /// Persistence failure when interacting with `SQLite`.
    Db(String),
    /// File-system or I/O operation failure.
    Io(String),
    /// HTTP surface failure (bind, serve).
    Http(String),
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Validation(msg) => write!(f, "validation: {msg}"),
            Self::NotFound(msg) => write!(f, "not found: {msg}"),
            Self::Collaborator(msg) => write!(f, "collaborator: {msg}"),
            Self::Snapshot(msg) => write!(f, "snapshot: {msg}"),
            Self::RestoreConflict(msg) => write!(f, "restore conflict: {msg}"),
            Self::InvalidState(msg) => write!(f, "invalid state: {msg}"),
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::Db(msg) => write!(f, "db: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
            Self::Http(msg) => write!(f, "http: {msg}"),
        }
    }
}

impl std::error::Error for AppError {}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid config: {err}"))
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        Self::Db(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::Db(format!("serialization: {err}"))
    }
}

impl From<reqwest::Error> for AppError {
    fn from(err: reqwest::Error) -> Self {
        Self::Snapshot(err.to_string())
    }
}
