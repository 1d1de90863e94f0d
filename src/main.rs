#![forbid(unsafe_code)]

//! `phoenix-engine` — checkpointed task execution server.
//!
//! Bootstraps configuration, the checkpoint store, the snapshot backend,
//! and the task orchestrator, then serves the HTTP API. The `demo`
//! subcommand runs a crash-and-restore walkthrough in-process.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

use phoenix_engine::api::{self, ApiState};
use phoenix_engine::collaborator::{Collaborator, ScriptedCollaborator};
use phoenix_engine::config::GlobalConfig;
use phoenix_engine::models::session::{SessionState, SessionStatus};
use phoenix_engine::orchestrator::{
    CheckpointManager, InMemorySessionRegistry, TaskOrchestrator,
};
use phoenix_engine::persistence::checkpoint_repo::CheckpointRepo;
use phoenix_engine::persistence::{db, retention};
use phoenix_engine::snapshot::{self, SnapshotBackend};
use phoenix_engine::{AppError, Result};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "phoenix-engine", about = "Checkpointed task execution engine", version, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file. Defaults apply when omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Serve the HTTP API (default).
    Serve {
        /// Override the configured HTTP port.
        #[arg(long)]
        port: Option<u16>,
    },
    /// Run a crash-and-restore walkthrough against an in-memory store.
    Demo {
        /// Task text; must contain a numbered plan.
        #[arg(long)]
        task: Option<String>,
        /// Crash after this many steps have completed.
        #[arg(long, default_value_t = 3)]
        crash_after: usize,
    },
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;
    info!("phoenix-engine bootstrap");

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(args))
}

async fn run(args: Cli) -> Result<()> {
    let mut config = match &args.config {
        Some(path) => GlobalConfig::load_from_path(path)?,
        None => GlobalConfig::default(),
    };

    match args.command.unwrap_or(Command::Serve { port: None }) {
        Command::Serve { port } => {
            if let Some(port) = port {
                config.http_port = port;
            }
            config.load_credentials().await?;
            info!("configuration loaded");
            serve(config).await
        }
        Command::Demo { task, crash_after } => demo(config, task, crash_after).await,
    }
}

async fn serve(config: GlobalConfig) -> Result<()> {
    let db = Arc::new(db::connect(&config.db_path).await?);
    info!(db_path = %config.db_path.display(), "database connected");
    let repo = CheckpointRepo::new(db);

    let backend = snapshot::from_config(&config.snapshot)?;
    let collaborator: Arc<dyn Collaborator> =
        Arc::new(ScriptedCollaborator::from_config(&config.collaborator));
    let orchestrator = Arc::new(build_orchestrator(&config, repo.clone(), backend, collaborator));

    let ct = CancellationToken::new();
    let retention_handle = (config.retention_days > 0).then(|| {
        info!(retention_days = config.retention_days, "retention service started");
        retention::spawn_retention_task(repo.clone(), config.retention_days, ct.clone())
    });

    let state = ApiState {
        orchestrator: Arc::clone(&orchestrator),
        default_list_limit: config.checkpoint.list_limit,
    };
    let http_ct = ct.clone();
    let port = config.http_port;
    let http_handle = tokio::spawn(async move {
        if let Err(err) = api::serve_on_port(port, state, http_ct).await {
            error!(%err, "http api failed");
        }
    });

    info!(port, "phoenix-engine ready");
    shutdown_signal().await;
    info!("shutdown signal received");
    ct.cancel();

    orchestrator.shutdown().await;
    let _ = http_handle.await;
    if let Some(handle) = retention_handle {
        let _ = handle.await;
    }
    info!("phoenix-engine shut down");
    Ok(())
}

fn build_orchestrator(
    config: &GlobalConfig,
    repo: CheckpointRepo,
    backend: Arc<dyn SnapshotBackend>,
    collaborator: Arc<dyn Collaborator>,
) -> TaskOrchestrator {
    let checkpoints = CheckpointManager::new(
        repo,
        backend,
        config.snapshot.clone(),
        config.checkpoint.clone(),
    );
    TaskOrchestrator::new(
        Arc::new(InMemorySessionRegistry::new()),
        checkpoints,
        collaborator,
    )
}

const DEMO_TASK: &str = "Plan a weekend trip to Lisbon:
1. Check the weather forecast
2. Book a hotel near Alfama
3. Reserve a table for dinner
4. Buy tram passes
5. Draft the itinerary";

async fn demo(mut config: GlobalConfig, task: Option<String>, crash_after: usize) -> Result<()> {
    config.checkpoint.interval_seconds = 0;
    let db = Arc::new(db::connect_memory().await?);
    let repo = CheckpointRepo::new(db);

    let scripted = Arc::new(
        ScriptedCollaborator::from_config(&config.collaborator)
            .with_step_delay(Duration::from_millis(config.collaborator.step_delay_ms.max(200))),
    );
    scripted.allow_steps(crash_after);
    let backend = snapshot::from_config(&config.snapshot)?;
    let collaborator: Arc<dyn Collaborator> = scripted.clone();
    let orchestrator = build_orchestrator(&config, repo, backend, collaborator);

    let task = task.unwrap_or_else(|| DEMO_TASK.to_owned());
    let session_id = orchestrator.start(&task, "demo_user").await?;
    println!("started session {session_id}");

    // Wait until the gated step has begun, so its predecessor's checkpoint exists.
    let state = wait_for(&orchestrator, &session_id, |s| {
        let gated = s.current_step_index >= crash_after && s.has_step_in_progress();
        gated || !matches!(s.status, SessionStatus::Starting | SessionStatus::Running)
    })
    .await?;
    println!(
        "progress: {}/{} steps, {} checkpoint(s)",
        state.current_step_index, state.total_steps, state.checkpoint_count
    );

    if state.status == SessionStatus::Running {
        let crashed = orchestrator.simulate_crash(&session_id).await?;
        println!(
            "crashed at step index {} (status {})",
            crashed.current_step_index,
            crashed.status.as_str()
        );

        let outcome = orchestrator.restore(None).await?;
        println!(
            "restored {} from {}: resuming at step {}/{}",
            outcome.session_id,
            outcome.checkpoint_id,
            outcome.resumed_step_number,
            outcome.total_steps
        );
    }

    scripted.allow_all_steps();
    let done = wait_for(&orchestrator, &session_id, |s| {
        matches!(s.status, SessionStatus::Completed | SessionStatus::Failed)
    })
    .await?;
    println!("final status: {}", done.status.as_str());
    if let Some(response) = &done.final_response {
        println!("{response}");
    }

    orchestrator.shutdown().await;
    Ok(())
}

async fn wait_for(
    orchestrator: &TaskOrchestrator,
    session_id: &str,
    done: impl Fn(&SessionState) -> bool,
) -> Result<SessionState> {
    let poll = async {
        loop {
            let state = orchestrator.get_status(session_id).await?;
            if done(&state) {
                return Ok::<_, AppError>(state);
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    };
    tokio::time::timeout(Duration::from_secs(120), poll)
        .await
        .map_err(|_| AppError::InvalidState("demo timed out waiting for the session".into()))?
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(err) => {
                tracing::warn!(%err, "failed to register SIGTERM handler, using ctrl-c only");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = ctrl_c.await {
            tracing::error!(%err, "ctrl-c signal handler failed");
        }
    }
}

fn init_tracing(log_format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt().with_env_filter(env_filter);

    match log_format {
        LogFormat::Text => subscriber
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
    }

    Ok(())
}
