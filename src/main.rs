use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use phaseflow::config::Config;
use std::path::PathBuf;

mod cmd;

#[derive(Parser)]
#[command(name = "phaseflow")]
#[command(version, about = "Resumable, auditable phase workflow orchestrator")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    /// Path to the flow definition file. Defaults to .phaseflow/flows.json
    #[arg(long, global = true)]
    pub flows: Option<PathBuf>,

    /// Emit log lines as JSON
    #[arg(long, global = true)]
    pub log_json: bool,

    /// Print command results as JSON
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create a session for a flow
    Start {
        /// Flow key in the definition file
        flow: String,
    },
    /// Drive the current phase one step
    Next,
    /// Submit output for a phase and evaluate its gates
    Done {
        /// Phase id (must be the current phase)
        phase: String,
        /// File holding the phase output. Reads stdin when omitted
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Release a waiting or escalated phase and run it again
    Resume,
    /// Show the session and per-phase state
    Status,
    /// Print the session event log
    Events {
        /// Only events of this type (e.g. state_transition)
        #[arg(long = "type")]
        event_type: Option<String>,
    },
    /// Show effective configuration and validation warnings
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };
    let config = Config::new(project_dir, cli.flows.clone())?;

    let log_dir = config
        .settings
        .orchestrator
        .log_to_file
        .then_some(config.log_dir.as_path());
    let _guard = phaseflow::telemetry::init_tracing(cli.log_json, cli.verbose, log_dir);

    match &cli.command {
        Commands::Start { flow } => cmd::cmd_start(&config, flow, cli.json)?,
        Commands::Next => cmd::cmd_next(&config, cli.json).await?,
        Commands::Done { phase, output } => {
            cmd::cmd_done(&config, phase, output.as_deref(), cli.json).await?
        }
        Commands::Resume => cmd::cmd_resume(&config, cli.json).await?,
        Commands::Status => cmd::cmd_status(&config, cli.json)?,
        Commands::Events { event_type } => {
            cmd::cmd_events(&config, event_type.as_deref(), cli.json)?
        }
        Commands::Config => cmd::cmd_config(&config)?,
    }

    Ok(())
}
