//! Warden CLI - launcher and control client for the Warden daemon
//!
//! `warden daemon` runs the orchestrator for a project; every other
//! subcommand sends one request over the project's control socket.

mod commands;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use warden_core::{discover_project_root, Config};

use commands::{ClaimArgs, CompleteArgs, DaemonArgs, ExecArgs, LogsArgs, StatusArgs, WatchArgs};

/// Warden: orchestration daemon for AI agent workflows
#[derive(Parser, Debug)]
#[command(name = "warden")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Agent executable (overrides config and env)
    #[arg(long, global = true, env = "WARDEN_AGENT_COMMAND")]
    agent_command: Option<String>,

    /// Model to use (overrides config and env)
    #[arg(long, global = true, env = "WARDEN_MODEL")]
    model: Option<String>,

    /// Project directory (defaults to the enclosing git work tree)
    #[arg(short = 'C', long, global = true)]
    project: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Show version information
    Version,

    /// Run the orchestration daemon in the foreground
    #[command(visible_alias = "d")]
    Daemon(DaemonArgs),

    /// Check that the daemon is reachable
    Ping,

    /// Show workflow, task and agent status
    #[command(visible_alias = "st")]
    Status(StatusArgs),

    /// Print the raw workflow state
    State,

    /// Claim the next task for a worker
    Claim(ClaimArgs),

    /// Mark a task completed
    Complete(CompleteArgs),

    /// Send a heartbeat for a worker
    Heartbeat {
        /// Worker id
        worker_id: String,
    },

    /// Show recent trajectory events
    Logs(LogsArgs),

    /// Drop all workflow state and start the plan over
    Reset,

    /// Ask the daemon to stop
    Shutdown,

    /// Run a command on the daemon's host
    Exec(ExecArgs),

    /// Stream events published by the daemon
    Watch(WatchArgs),

    /// Show current configuration
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize tracing; RUST_LOG wins over --verbose
    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .init();

    let cwd = match &cli.project {
        Some(dir) => dir.clone(),
        None => std::env::current_dir()?,
    };
    let project_root = discover_project_root(&cwd);

    // Load configuration with overrides
    let config = Config::load_with_overrides(Some(&project_root), cli.agent_command.clone(), cli.model.clone())?;

    if cli.verbose {
        tracing::debug!(
            project_root = %project_root.display(),
            agent_command = %config.agent.command,
            model = ?config.agent.model,
            "Configuration loaded"
        );
    }

    let client = commands::client(&project_root);

    match cli.command {
        Some(Commands::Version) => {
            println!("warden {}", env!("CARGO_PKG_VERSION"));
        }
        Some(Commands::Daemon(args)) => {
            args.execute(&project_root, config).await?;
        }
        Some(Commands::Ping) => commands::ping(&client).await?,
        Some(Commands::Status(args)) => args.execute(&client).await?,
        Some(Commands::State) => commands::state(&client).await?,
        Some(Commands::Claim(args)) => args.execute(&client).await?,
        Some(Commands::Complete(args)) => args.execute(&client).await?,
        Some(Commands::Heartbeat { worker_id }) => commands::heartbeat(&client, worker_id).await?,
        Some(Commands::Logs(args)) => args.execute(&client).await?,
        Some(Commands::Reset) => commands::reset(&client).await?,
        Some(Commands::Shutdown) => commands::shutdown(&client).await?,
        Some(Commands::Exec(args)) => {
            let code = args.execute(&client).await?;
            if code != 0 {
                std::process::exit(code);
            }
        }
        Some(Commands::Watch(args)) => args.execute(&client).await?,
        Some(Commands::Config) => {
            println!("Warden Configuration");
            println!("====================");
            println!();
            println!("Project root: {}", project_root.display());
            println!("Socket: {}", client.path().display());
            println!();
            println!("Agent Settings:");
            println!("  command: {}", config.agent.command);
            println!("  model: {}", config.agent.model.as_deref().unwrap_or("(default)"));
            println!();
            println!("Daemon Settings:");
            println!("  tick_interval: {:?}", config.daemon.tick_interval);
            println!("  stop_grace_period: {:?}", config.daemon.stop_grace_period);
            println!("  heartbeat_interval: {:?}", config.daemon.heartbeat_interval);
            println!("  state_dir: {}", config.daemon.state_dir.display());
            println!();
            if let Some(path) = Config::default_config_path() {
                println!("Config file: {}", path.display());
                if path.exists() {
                    println!("  (exists)");
                } else {
                    println!("  (not found - using defaults)");
                }
            }
        }
        None => {
            println!("Warden - orchestration daemon for AI agent workflows");
            println!();
            println!("Use --help for usage information");
        }
    }

    Ok(())
}
