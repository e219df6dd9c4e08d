use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use forge_studio::telemetry::{LogFormat, init_tracing};

mod cmd;

#[derive(Parser)]
#[command(name = "studio")]
#[command(version, about = "Prompt-to-app studio: durable agent runs inside managed sandboxes")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    /// Log output format: pretty, json
    #[arg(long, global = true, default_value = "pretty")]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the HTTP API, webhook endpoint and idle sweeper
    Serve {
        /// Address to bind (overrides server.host)
        #[arg(long)]
        host: Option<String>,

        /// Port to serve on (overrides server.port)
        #[arg(short, long)]
        port: Option<u16>,

        /// Enable dev mode (CORS permissive for a local frontend)
        #[arg(long)]
        dev: bool,

        /// Do not run the idle sweep in this process
        #[arg(long)]
        no_sweep: bool,
    },
    /// Run one workflow for a message and wait for the result
    Run {
        #[arg(long)]
        project: String,

        #[arg(short, long)]
        message: String,

        /// Agent model override
        #[arg(long)]
        model: Option<String>,

        /// Replay canned agent responses from a JSON file instead of calling Claude
        #[arg(long)]
        replay: Option<PathBuf>,
    },
    /// Pause idle sandboxes and expire old ones
    Sweep {
        /// Run a single pass and exit
        #[arg(long)]
        once: bool,
    },
    /// Show the action ledger of a project
    Actions {
        #[arg(long)]
        project: String,

        /// Print raw JSON records
        #[arg(long)]
        json: bool,
    },
    /// Inspect or control a project's sandbox
    Sandbox {
        #[command(subcommand)]
        command: SandboxCommands,
    },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum SandboxCommands {
    /// Show the tracked sandbox record
    Status {
        #[arg(long)]
        project: String,
    },
    /// Reconnect to the sandbox, creating one if needed
    Wake {
        #[arg(long)]
        project: String,
    },
    /// Kill the sandbox at the provider
    Kill {
        #[arg(long)]
        project: String,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show current configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
    /// Initialize a default studio.toml file
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    init_tracing(cli.log_format, cli.verbose)?;

    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    match &cli.command {
        Commands::Serve {
            host,
            port,
            dev,
            no_sweep,
        } => {
            cmd::cmd_serve(&project_dir, host.clone(), *port, *dev, !*no_sweep).await?;
        }
        Commands::Run {
            project,
            message,
            model,
            replay,
        } => {
            cmd::cmd_run(&project_dir, project, message, model.clone(), replay.as_deref()).await?;
        }
        Commands::Sweep { once } => cmd::cmd_sweep(&project_dir, *once).await?,
        Commands::Actions { project, json } => cmd::cmd_actions(&project_dir, project, *json).await?,
        Commands::Sandbox { command } => cmd::cmd_sandbox(&project_dir, command.clone()).await?,
        Commands::Config { command } => cmd::cmd_config(&project_dir, command.clone())?,
    }

    Ok(())
}
