#![forbid(unsafe_code)]

//! `phoenix-ctl` — command-line companion for `phoenix-engine`.
//!
//! Sends one HTTP request to a running server and prints the JSON reply.

use clap::{Parser, Subcommand};
use reqwest::Method;

#[derive(Debug, Parser)]
#[command(
    name = "phoenix-ctl",
    about = "Command-line client for phoenix-engine",
    version,
    long_about = None
)]
struct Cli {
    /// Base URL of the phoenix-engine API.
    #[arg(long, default_value = "http://127.0.0.1:8787")]
    url: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start a new task session.
    Start {
        /// Task text, optionally carrying a numbered plan.
        task: String,
        /// User whose context is loaded.
        #[arg(long, default_value = "demo_user")]
        user: String,
    },

    /// Show the full state of one session.
    Status {
        /// Session ID.
        session_id: String,
    },

    /// List sessions.
    List,

    /// Take a checkpoint of a session now.
    Checkpoint {
        /// Session ID.
        session_id: String,
    },

    /// List checkpoints, newest first.
    Checkpoints {
        /// Maximum number of checkpoints.
        #[arg(long)]
        limit: Option<u32>,
    },

    /// Restore a checkpoint (the newest when omitted).
    Restore {
        /// Checkpoint ID.
        checkpoint_id: Option<String>,
    },

    /// Crash a running session.
    Crash {
        /// Session ID.
        session_id: String,
        /// Seconds to wait before crashing.
        #[arg(long, default_value_t = 0.0)]
        delay: f64,
    },

    /// Delete a checkpoint.
    DeleteCheckpoint {
        /// Checkpoint ID.
        checkpoint_id: String,
    },
}

impl Command {
    /// HTTP method, path, and optional JSON body for this command.
    fn request(&self) -> (Method, String, Option<serde_json::Value>) {
        match self {
            Self::Start { task, user } => (
                Method::POST,
                "/api/agent/start".into(),
                Some(serde_json::json!({ "task": task, "user_id": user })),
            ),
            Self::Status { session_id } => {
                (Method::GET, format!("/api/agent/status/{session_id}"), None)
            }
            Self::List => (Method::GET, "/api/agent/sessions".into(), None),
            Self::Checkpoint { session_id } => (
                Method::POST,
                "/api/checkpoints".into(),
                Some(serde_json::json!({ "session_id": session_id })),
            ),
            Self::Checkpoints { limit } => {
                let path = match limit {
                    Some(limit) => format!("/api/checkpoints?limit={limit}"),
                    None => "/api/checkpoints".into(),
                };
                (Method::GET, path, None)
            }
            Self::Restore { checkpoint_id } => (
                Method::POST,
                "/api/restore".into(),
                Some(serde_json::json!({ "checkpoint_id": checkpoint_id })),
            ),
            Self::Crash { session_id, delay } => (
                Method::POST,
                "/api/simulate-crash".into(),
                Some(serde_json::json!({ "session_id": session_id, "delay_seconds": delay })),
            ),
            Self::DeleteCheckpoint { checkpoint_id } => (
                Method::DELETE,
                format!("/api/checkpoints/{checkpoint_id}"),
                None,
            ),
        }
    }
}

fn main() {
    let args = Cli::parse();
    let (method, path, body) = args.command.request();
    let url = format!("{}{path}", args.url.trim_end_matches('/'));

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("Failed to start runtime: {err}");
            std::process::exit(1);
        }
    };

    match runtime.block_on(send(method, &url, body)) {
        Ok((status, response)) if status.is_success() => {
            println!(
                "{}",
                serde_json::to_string_pretty(&response).unwrap_or_default()
            );
        }
        Ok((status, response)) => {
            let err_msg = response
                .get("error")
                .and_then(|v| v.as_str())
                .unwrap_or("unknown error");
            eprintln!("Error ({status}): {err_msg}");
            std::process::exit(1);
        }
        Err(err) => {
            eprintln!("Failed to reach server: {err}");
            eprintln!("Is phoenix-engine serving on {}?", args.url);
            std::process::exit(1);
        }
    }
}

/// Send one request and decode the JSON reply.
async fn send(
    method: Method,
    url: &str,
    body: Option<serde_json::Value>,
) -> Result<(reqwest::StatusCode, serde_json::Value), reqwest::Error> {
    let client = reqwest::Client::new();
    let mut request = client.request(method, url);
    if let Some(body) = body {
        request = request.json(&body);
    }
    let response = request.send().await?;
    let status = response.status();
    let value = response.json::<serde_json::Value>().await?;
    Ok((status, value))
}
