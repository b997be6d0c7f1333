//! Macropilot CLI
//!
//! Runs macro scripts against the configured runtime:
//!   macropilot run <script> [--session <id>] [--retrain-threshold N]
//!   macropilot sessions
//!
//! Exit codes: 0 on full completion, 2 on compile error, 1 on an
//! unrecovered step failure, 3 when a run pauses on the fail-safe.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use macropilot::{
    compile, Collaborators, CompileOptions, RuntimeConfig, RuntimeContext, Runner, SessionStatus,
    VariableRegistry,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "macropilot")]
#[command(about = "Macro execution runtime for desktop UI automation")]
struct Cli {
    /// Path to a runtime config JSON file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Override the session state directory.
    #[arg(long, global = true)]
    state_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile and execute a macro script.
    Run {
        /// The script file to run.
        script: PathBuf,

        /// Resume an existing session instead of starting a new one.
        #[arg(long)]
        session: Option<String>,

        /// Override the learning retrain threshold.
        #[arg(long)]
        retrain_threshold: Option<u64>,

        /// JSON file of macro variable definitions ({name, body} array).
        #[arg(long)]
        variables: Option<PathBuf>,

        /// Run the session retention sweep before executing.
        #[arg(long)]
        sweep: bool,
    },
    /// List resumable sessions.
    Sessions,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => RuntimeConfig::load(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => RuntimeConfig::default(),
    };
    if let Some(dir) = &cli.state_dir {
        config.state_dir = dir.clone();
    }

    match cli.command {
        Commands::Run {
            script,
            session,
            retrain_threshold,
            variables,
            sweep,
        } => {
            if let Some(threshold) = retrain_threshold {
                config.retrain_threshold = threshold;
            }
            run_script(config, script, session, variables, sweep).await
        }
        Commands::Sessions => list_sessions(config),
    }
}

async fn run_script(
    config: RuntimeConfig,
    script: PathBuf,
    session: Option<String>,
    variables: Option<PathBuf>,
    sweep: bool,
) -> Result<()> {
    let script_text = std::fs::read_to_string(&script)
        .with_context(|| format!("failed to read script {}", script.display()))?;

    let registry = match &variables {
        Some(path) => VariableRegistry::load(path)
            .map_err(|e| anyhow::anyhow!("failed to load variable definitions: {e}"))?,
        None => VariableRegistry::default(),
    };

    let token = CancellationToken::new();
    let ctrl_c_token = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("fail-safe abort requested");
            ctrl_c_token.cancel();
        }
    });

    let compile_opts = CompileOptions {
        default_timeout: config.default_timeout(),
        ..Default::default()
    };
    let ctx = Arc::new(
        RuntimeContext::new(config, Collaborators::disconnected())?.with_cancellation(token),
    );

    if sweep {
        let max_age = chrono::Duration::days(ctx.config.session_max_age_days);
        let removed = ctx.sessions.sweep_expired(max_age)?;
        tracing::info!(removed, "retention sweep finished");
    }

    let steps = match compile(&script_text, &registry, &ctx.catalog, &compile_opts) {
        Ok(steps) => steps,
        Err(e) => {
            eprintln!("compile error: {e}");
            std::process::exit(2);
        }
    };

    let session_id = match session {
        Some(id) => {
            let existing = ctx
                .sessions
                .get_session(&id)
                .with_context(|| format!("no session '{id}'"))?;
            anyhow::ensure!(
                existing.is_resumable(),
                "session '{id}' is not resumable ({:?})",
                existing.status
            );
            id
        }
        None => ctx
            .sessions
            .create_session(&script.display().to_string(), steps.len())?,
    };

    let runner = Runner::new(ctx);
    match runner.run(&steps, &session_id).await {
        Ok(outcome) => {
            println!(
                "session {}: {:?} after {} step(s)",
                outcome.session_id, outcome.status, outcome.executed_steps
            );
            if outcome.status != SessionStatus::Completed {
                std::process::exit(3);
            }
            Ok(())
        }
        Err(e) => {
            eprintln!("run failed: {e}");
            eprintln!("session {session_id} can be inspected or resumed with --session");
            std::process::exit(1);
        }
    }
}

fn list_sessions(config: RuntimeConfig) -> Result<()> {
    let ctx = RuntimeContext::new(config, Collaborators::disconnected())?;
    let sessions = ctx.sessions.list_resumable();
    if sessions.is_empty() {
        println!("no resumable sessions");
        return Ok(());
    }
    for s in sessions {
        println!(
            "{}  {:?}  {} pending  {}  {}",
            s.session_id,
            s.status,
            s.pending_step_indices.len(),
            s.updated_at.format("%Y-%m-%d %H:%M:%S"),
            s.source_ref
        );
    }
    Ok(())
}
