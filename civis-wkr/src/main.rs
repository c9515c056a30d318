//! civis worker agent CLI.

use anyhow::{Context, Result, bail};
use civis_common::logging::{LogConfig, init_logging};
use civis_common::types::ModuleExecutionSettings;
use civis_wkr::{
    TestEventsHandler, WorkerConfig, WorkerEvent, module_parent, request_repo_index,
    request_settings,
};
use clap::{Parser, Subcommand};
use std::io::BufRead;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "civis-wkr")]
#[command(author, version, about = "civis worker agent")]
struct Cli {
    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the execution settings the session computed for this module
    Settings,
    /// Print the repository source index
    RepoIndex,
    /// Feed a JSONL script of test events through the events handler
    Replay {
        /// Event script; `-` reads stdin
        events: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut log_config = LogConfig::from_env("info").with_stderr();
    if cli.verbose {
        log_config = log_config.with_level("debug");
    }
    init_logging(&log_config)?;

    let config = WorkerConfig::from_env()?;
    let client = config.client()?;

    match cli.command {
        Commands::Settings => {
            let Some(client) = client else {
                bail!("no build session advertised in the environment");
            };
            let settings = request_settings(&client, &config.identity, &config.module_name)?;
            println!("{}", serde_json::to_string_pretty(&settings)?);
        }
        Commands::RepoIndex => {
            let Some(client) = client else {
                bail!("no build session advertised in the environment");
            };
            let index = request_repo_index(&client)?;
            println!("{}", serde_json::to_string_pretty(&index)?);
        }
        Commands::Replay { events } => {
            let settings = match &client {
                Some(client) => {
                    match request_settings(client, &config.identity, &config.module_name) {
                        Ok(settings) => settings,
                        Err(e) => {
                            warn!("Running with default settings: {}", e);
                            ModuleExecutionSettings::default()
                        }
                    }
                }
                None => ModuleExecutionSettings::default(),
            };
            let handler =
                TestEventsHandler::new(config.module_descriptor(), settings, module_parent(client));
            let replayed = replay(&handler, &events)?;
            handler.finish_module();
            info!(module = %config.module_name, events = replayed, "Replay finished");
        }
    }
    Ok(())
}

fn replay(handler: &TestEventsHandler, path: &Path) -> Result<usize> {
    let reader: Box<dyn BufRead> = if path.as_os_str() == "-" {
        Box::new(std::io::stdin().lock())
    } else {
        let file = std::fs::File::open(path).with_context(|| format!("opening {}", path.display()))?;
        Box::new(std::io::BufReader::new(file))
    };
    let mut count = 0;
    for (number, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let event: WorkerEvent = serde_json::from_str(&line)
            .with_context(|| format!("{}:{}: invalid event", path.display(), number + 1))?;
        handler.apply(event);
        count += 1;
    }
    Ok(count)
}
