//! Drover - unattended agent-loop sessions with a crash-safe shared registry.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use colored::Colorize;

use drover::config::StoreConfig;
use drover::lifecycle::{self, StartSettings};
use drover::prd::FilePrd;
use drover::process::SignalProbe;
use drover::store::{SessionStatus, StateStore};
use drover::{DroverError, SessionView};

#[derive(Parser)]
#[command(name = "drover")]
#[command(version = "0.1.0")]
#[command(about = "Run unattended agent loops against a task file", long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a named loop session
    Start {
        /// Session name (defaults to the directory name)
        name: Option<String>,

        /// Project directory the loop operates in
        #[arg(short, long, default_value = ".")]
        dir: PathBuf,

        /// Task file, relative to the project directory
        #[arg(short, long, default_value = "PRD.md")]
        task_file: String,

        /// Maximum iterations
        #[arg(short, long, default_value = "50")]
        max_iterations: u32,

        /// Token the agent must echo to signal completion
        #[arg(long, default_value = "COMPLETE")]
        completion_marker: String,

        /// Backend adapter to use
        #[arg(short, long, default_value = "claude")]
        backend: String,

        /// Model override passed to the backend
        #[arg(long)]
        model: Option<String>,

        /// Backend variant (opaque passthrough)
        #[arg(long)]
        variant: Option<String>,

        /// Webhook URL notified by external tooling (opaque passthrough)
        #[arg(long)]
        webhook: Option<String>,

        /// Run in the foreground instead of a detached worker
        #[arg(short, long)]
        foreground: bool,
    },

    /// Resume stale or stopped sessions
    Resume {
        /// Session name; resumes all resumable sessions when omitted
        name: Option<String>,
    },

    /// Stop a running session
    Stop {
        /// Session name
        name: Option<String>,

        /// Stop all running sessions
        #[arg(short, long, conflicts_with = "name")]
        all: bool,

        /// Also remove stale sessions from the registry
        #[arg(long)]
        prune: bool,
    },

    /// Show all sessions
    Status {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Serve the HTTP status endpoint
    Serve {
        /// Port to listen on (127.0.0.1 only)
        #[arg(short, long, default_value = "7455")]
        port: u16,

        /// Bearer token required on every request
        #[arg(long, env = "DROVER_STATUS_TOKEN")]
        token: Option<String>,
    },

    /// Internal worker entry point for detached loops
    #[command(hide = true)]
    RunLoop {
        /// Session name to drive
        #[arg(long)]
        name: String,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        "drover=debug,info"
    } else {
        "drover=info,warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match run(cli).await {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("{} {e}", "Error:".red().bold());
            std::process::exit(e.exit_code());
        }
    }
}

async fn run(cli: Cli) -> drover::Result<i32> {
    let config = StoreConfig::from_env()?;
    let store = StateStore::new(config, Arc::new(SignalProbe));

    match cli.command {
        Commands::Start {
            name,
            dir,
            task_file,
            max_iterations,
            completion_marker,
            backend,
            model,
            variant,
            webhook,
            foreground,
        } => {
            let name = match name {
                Some(name) => name,
                None => default_session_name(&dir)?,
            };
            let settings = StartSettings {
                name: name.clone(),
                dir,
                task_file,
                max_iterations,
                completion_marker,
                backend,
                model,
                variant,
                webhook,
                foreground,
            };
            let status = lifecycle::start(&store, &SignalProbe, settings).await?;
            if status.is_terminal() {
                // Foreground run already drove the loop to its end state.
                println!(
                    "{} Session '{name}' finished: {status}",
                    "OK".green().bold()
                );
                Ok(exit_code_for(status))
            } else {
                println!("{} Session '{name}' started", "OK".green().bold());
                Ok(0)
            }
        }

        Commands::Resume { name } => {
            let resumed = lifecycle::resume(&store, &SignalProbe, name.as_deref()).await?;
            if resumed.is_empty() {
                println!("No resumable sessions");
            } else {
                println!(
                    "{} Resumed {}: {}",
                    "OK".green().bold(),
                    resumed.len(),
                    resumed.join(", ")
                );
            }
            Ok(0)
        }

        Commands::Stop { name, all, prune } => {
            if name.is_none() && !all && !prune {
                eprintln!(
                    "{} Provide a session name, --all, or --prune",
                    "Error:".red().bold()
                );
                return Ok(1);
            }
            if name.is_some() || all {
                let stopped = lifecycle::stop(&store, &SignalProbe, name.as_deref())?;
                if stopped.is_empty() {
                    println!("No running sessions to stop");
                } else {
                    println!("{} Stopped: {}", "OK".green().bold(), stopped.join(", "));
                }
            }
            if prune {
                let pruned = lifecycle::prune(&store)?;
                if !pruned.is_empty() {
                    println!("Pruned stale sessions: {}", pruned.join(", "));
                }
            }
            Ok(0)
        }

        Commands::Status { json } => {
            let views = lifecycle::status(&store, &FilePrd)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&views)?);
            } else {
                print_status_table(&views);
            }
            Ok(0)
        }

        Commands::Serve { port, token } => {
            drover::server::serve(Arc::new(store), port, token).await?;
            Ok(0)
        }

        Commands::RunLoop { name } => {
            let status = lifecycle::run_recorded_loop(&store, &name).await?;
            Ok(exit_code_for(status))
        }
    }
}

/// Session name derived from the project directory's basename.
fn default_session_name(dir: &PathBuf) -> drover::Result<String> {
    let canonical = dir.canonicalize().unwrap_or_else(|_| dir.clone());
    canonical
        .file_name()
        .map(|s| s.to_string_lossy().to_string())
        .ok_or_else(|| DroverError::InvalidConfig {
            field: "name".to_string(),
            reason: "could not derive a session name from the directory".to_string(),
        })
}

/// Exit code for a loop that ran to a terminal status in the foreground.
fn exit_code_for(status: SessionStatus) -> i32 {
    match status {
        // Budget exhaustion is an expected outcome, not an error.
        SessionStatus::Complete | SessionStatus::MaxIterationsReached => 0,
        SessionStatus::Failed => 1,
        _ => 0,
    }
}

fn print_status_table(views: &[SessionView]) {
    if views.is_empty() {
        println!("No sessions");
        return;
    }
    println!(
        "{:<20} {:<22} {:>5} {:>10} {:>9} {:>8}",
        "NAME", "STATUS", "ITER", "MAX", "REMAINING", "PID"
    );
    for view in views {
        let record = &view.record;
        let status = match record.status {
            SessionStatus::Running => record.status.to_string().green().to_string(),
            SessionStatus::Complete => record.status.to_string().blue().to_string(),
            SessionStatus::Failed => record.status.to_string().red().to_string(),
            SessionStatus::Stale => record.status.to_string().yellow().to_string(),
            _ => record.status.to_string(),
        };
        println!(
            "{:<20} {:<22} {:>5} {:>10} {:>9} {:>8}",
            record.name,
            status,
            record.iteration,
            record.max_iterations,
            view.remaining.map_or("-".to_string(), |n| n.to_string()),
            record.pid.map_or("-".to_string(), |p| p.to_string()),
        );
    }
}
