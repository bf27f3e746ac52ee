//! stagegate CLI tool.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser)]
#[command(name = "stagegate")]
#[command(about = "Staged promotion pipelines with security gates", long_about = None)]
struct Cli {
    /// Directory holding deployed snapshots, approvals and the last run
    #[arg(
        long,
        env = "STAGEGATE_STATE_DIR",
        default_value = ".stagegate",
        global = true
    )]
    state_dir: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a pipeline definition
    Validate {
        /// Path to the pipeline definition
        #[arg(default_value = "stagegate.kdl")]
        path: String,
    },
    /// Print the validated plan as JSON
    Plan {
        /// Path to the pipeline definition
        #[arg(default_value = "stagegate.kdl")]
        path: String,
    },
    /// Promote the pipeline through its stages using the local deployer
    Run {
        /// Path to the pipeline definition
        #[arg(default_value = "stagegate.kdl")]
        path: String,
        /// Execute script units instead of only recording them
        #[arg(long)]
        run_scripts: bool,
        /// Ignore the last blocked run and start from the first stage
        #[arg(long)]
        fresh: bool,
    },
    /// Approve a stage at its current content digest
    Approve {
        /// Path to the pipeline definition
        path: String,
        /// Stage to approve
        stage: String,
        /// Who approved
        #[arg(long, env = "USER")]
        by: Option<String>,
    },
    /// List deployed unit snapshots
    Status,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Validate { path } => {
            commands::validate(&path)?;
        }
        Commands::Plan { path } => {
            commands::plan(&path)?;
        }
        Commands::Run {
            path,
            run_scripts,
            fresh,
        } => {
            commands::run::run_local(&path, &cli.state_dir, run_scripts, fresh).await?;
        }
        Commands::Approve { path, stage, by } => {
            commands::approve(&path, &cli.state_dir, &stage, by)?;
        }
        Commands::Status => {
            commands::status(&cli.state_dir).await?;
        }
    }

    Ok(())
}
