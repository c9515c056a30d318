//! civis orchestrator daemon.
//!
//! Starts a build session, launches one worker command per module with the
//! session's discovery variables in its environment, waits for them and
//! prints the session summary as JSON.

use anyhow::{Context, Result, bail};
use civis_common::logging::{LogConfig, init_logging};
use civisd::{BuildSession, SessionConfig, SessionSummary};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::{Child, Command};
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "civisd")]
#[command(author, version, about = "civis - build session orchestrator")]
struct Cli {
    /// Path to the session configuration (TOML)
    #[arg(short, long, env = "CIVIS_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a command once per module inside one build session
    Run {
        /// Project name (defaults to the repository directory name)
        #[arg(long)]
        project_name: Option<String>,

        /// Module to run, as NAME or NAME=OUTPUT_DIR; repeatable
        #[arg(short, long = "module", value_name = "NAME[=DIR]", required = true)]
        modules: Vec<String>,

        /// Write the summary JSON to this file instead of stdout
        #[arg(long)]
        summary: Option<PathBuf>,

        /// Worker command, launched once per module
        #[arg(last = true, required = true)]
        command: Vec<String>,
    },
}

fn parse_module(spec: &str) -> (String, Vec<PathBuf>) {
    match spec.split_once('=') {
        Some((name, dir)) => (name.to_string(), vec![PathBuf::from(dir)]),
        None => (spec.to_string(), Vec::new()),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut log_config = LogConfig::from_env("info").with_stderr();
    if cli.verbose {
        log_config = log_config.with_level("debug");
    }
    init_logging(&log_config)?;

    let mut config = SessionConfig::load(cli.config.as_deref())?;
    for error in config.apply_env() {
        warn!("Ignoring environment override: {}", error);
    }

    match cli.command {
        Commands::Run {
            project_name,
            modules,
            summary,
            command,
        } => run(config, project_name, modules, summary, command).await,
    }
}

async fn run(
    config: SessionConfig,
    project_name: Option<String>,
    modules: Vec<String>,
    summary_path: Option<PathBuf>,
    command: Vec<String>,
) -> Result<()> {
    let Some((program, args)) = command.split_first() else {
        bail!("no worker command given");
    };
    let options = config.session_options(project_name, command.join(" "))?;
    let session = BuildSession::start(
        options,
        config.settings_provider(),
        config.repo_index_provider(),
    )
    .await
    .context("starting build session")?;

    let mut children = Vec::new();
    if let Err(error) = launch_workers(&session, program, args, &modules, &mut children) {
        warn!("Aborting session after launch failure: {:#}", error);
        for (name, child) in &mut children {
            if let Err(e) = child.kill().await {
                warn!(module = %name, "Failed to stop worker: {}", e);
            }
        }
        if let Some(summary) = session.end().await {
            emit_summary(&summary, summary_path.as_deref())?;
        }
        return Err(error);
    }

    let mut failed = 0usize;
    for (name, mut child) in children {
        let status = child
            .wait()
            .await
            .with_context(|| format!("waiting for worker of module {name}"))?;
        if !status.success() {
            warn!(module = %name, %status, "Worker exited unsuccessfully");
            failed += 1;
        }
    }

    let Some(summary) = session.end().await else {
        bail!("session {} was already ended", session.id());
    };
    emit_summary(&summary, summary_path.as_deref())?;

    if failed > 0 {
        bail!("{failed} worker(s) failed");
    }
    Ok(())
}

/// Start one worker per module. Children spawned before a failure stay in `children`.
fn launch_workers(
    session: &BuildSession,
    program: &str,
    args: &[String],
    modules: &[String],
    children: &mut Vec<(String, Child)>,
) -> Result<()> {
    for spec in modules {
        let (name, output_dirs) = parse_module(spec);
        let module = session
            .module_start(&name, output_dirs)
            .with_context(|| format!("starting module {name}"))?;
        let child = Command::new(program)
            .args(args)
            .envs(module.child_env())
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("spawning worker for module {name}"))?;
        info!(module = %name, pid = ?child.id(), "Worker started");
        children.push((name, child));
    }
    Ok(())
}

fn emit_summary(summary: &SessionSummary, path: Option<&Path>) -> Result<()> {
    let json = serde_json::to_string_pretty(summary)?;
    match path {
        Some(path) => {
            std::fs::write(path, json).with_context(|| format!("writing {}", path.display()))?;
            info!(?path, "Wrote session summary");
        }
        None => println!("{json}"),
    }
    Ok(())
}
