#![forbid(unsafe_code)]

pub mod api;
pub mod collaborator;
pub mod config;
pub mod errors;
pub mod models;
pub mod orchestrator;
pub mod persistence;
pub mod snapshot;

pub use config::GlobalConfig;
pub use errors::{AppError, Result};
