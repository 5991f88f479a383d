//! Cadence CLI tool.

use cadence_scheduler::IntegratorOptions;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

mod commands;
mod store;

#[derive(Parser)]
#[command(name = "cadence")]
#[command(about = "Cadence CI orchestrator", long_about = None)]
struct Cli {
    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run every scheduled project until interrupted
    Run {
        /// Path to the project configuration
        #[arg(long, env = "CADENCE_CONFIG", default_value = "cadence.kdl")]
        config: PathBuf,
        /// Reload the configuration when the file changes
        #[arg(long)]
        watch: bool,
        /// Longest wait between schedule polls, in milliseconds
        #[arg(long, default_value = "1000")]
        poll_ms: u64,
        /// Seconds an aborted build gets to stop before it is abandoned
        #[arg(long, default_value = "10")]
        abort_grace_secs: u64,
    },
    /// Run one forced integration of a project and wait for it
    Build {
        /// Project name
        project: String,
        /// Path to the project configuration
        #[arg(long, env = "CADENCE_CONFIG", default_value = "cadence.kdl")]
        config: PathBuf,
    },
    /// Validate a project configuration
    Validate {
        /// Path to the configuration file
        #[arg(default_value = "cadence.kdl")]
        path: PathBuf,
    },
    /// List configured projects and their schedules
    Status {
        /// Path to the project configuration
        #[arg(long, env = "CADENCE_CONFIG", default_value = "cadence.kdl")]
        config: PathBuf,
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match cli.command {
        Commands::Run {
            config,
            watch,
            poll_ms,
            abort_grace_secs,
        } => {
            let options = IntegratorOptions {
                poll_interval: Duration::from_millis(poll_ms),
                abort_grace: Duration::from_secs(abort_grace_secs),
            };
            commands::run::run(&config, watch, options).await?;
        }
        Commands::Build { project, config } => {
            commands::build(&config, &project).await?;
        }
        Commands::Validate { path } => {
            commands::validate(&path)?;
        }
        Commands::Status { config, json } => {
            commands::status(&config, json).await?;
        }
    }

    Ok(())
}
