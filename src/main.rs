//! Claude Fleet - supervise long-lived Claude Code workers.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use claude_fleet::config::{ConfigLoader, FleetConfig};
use claude_fleet::display;
use claude_fleet::supervisor::{SpawnRequest, Supervisor};

/// How long to keep printing events after shutdown.
const EVENT_FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Parser)]
#[command(
    name = "claude-fleet",
    about = "Supervise a fleet of long-lived Claude Code workers",
    version
)]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Spawn workers and relay messages to them from stdin.
    ///
    /// Input lines: `@handle message` sends a message, `/list` shows the
    /// workers, `/dismiss handle` and `/restart handle` manage one worker,
    /// `/quit` shuts everything down.
    Run {
        /// Worker handle to spawn (repeatable).
        #[arg(long = "handle", required = true)]
        handles: Vec<String>,
        /// Team name for the spawned workers.
        #[arg(long)]
        team: Option<String>,
        /// Working directory for the spawned workers.
        #[arg(long)]
        dir: Option<PathBuf>,
        /// Message sent to every worker once it has started.
        #[arg(short, long)]
        message: Option<String>,
        /// Path to a config file.
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Override the maximum number of workers.
        #[arg(long)]
        max_workers: Option<usize>,
        /// Do not restart unhealthy workers.
        #[arg(long)]
        no_auto_restart: bool,
        /// Print every protocol record.
        #[arg(long)]
        raw: bool,
    },
    /// Print the effective configuration as TOML.
    Config {
        /// Path to a config file.
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

/// A line typed on stdin while running.
#[derive(Debug, PartialEq, Eq)]
enum InputCommand {
    Send { handle: String, message: String },
    List,
    Dismiss(String),
    Restart(String),
    Quit,
    Invalid(String),
    Empty,
}

fn parse_input(line: &str) -> InputCommand {
    let line = line.trim();
    if line.is_empty() {
        return InputCommand::Empty;
    }
    if let Some(rest) = line.strip_prefix('@') {
        return match rest.split_once(char::is_whitespace) {
            Some((handle, message)) if !handle.is_empty() && !message.trim().is_empty() => {
                InputCommand::Send {
                    handle: handle.to_string(),
                    message: message.trim().to_string(),
                }
            }
            _ => InputCommand::Invalid("usage: @handle message".to_string()),
        };
    }
    let mut parts = line.split_whitespace();
    match (parts.next(), parts.next()) {
        (Some("/list"), None) => InputCommand::List,
        (Some("/quit"), None) => InputCommand::Quit,
        (Some("/dismiss"), Some(handle)) => InputCommand::Dismiss(handle.to_string()),
        (Some("/restart"), Some(handle)) => InputCommand::Restart(handle.to_string()),
        _ => InputCommand::Invalid(format!("unknown command: {line}")),
    }
}

fn init_tracing(verbosity: u8) {
    let level = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
}

fn load_config(path: Option<PathBuf>) -> FleetConfig {
    let loader = path.map_or_else(ConfigLoader::new, ConfigLoader::with_path);
    match loader.load() {
        Ok(config) => config,
        Err(e) => {
            display::print_error(&e.to_string());
            std::process::exit(1);
        }
    }
}

/// Returns false when the user asked to quit.
async fn handle_input(supervisor: &Supervisor, line: &str) -> bool {
    match parse_input(line) {
        InputCommand::Empty => {}
        InputCommand::Send { handle, message } => {
            if !supervisor.send(&handle, &message) {
                display::print_error(&format!("no live worker named {handle}"));
            }
        }
        InputCommand::List => {
            display::print_workers(&supervisor.list(), &supervisor.health_counts());
        }
        InputCommand::Dismiss(handle) => {
            if !supervisor.dismiss(&handle).await {
                display::print_error(&format!("no live worker named {handle}"));
            }
        }
        InputCommand::Restart(handle) => {
            if let Err(e) = supervisor.restart(&handle).await {
                display::print_error(&e.to_string());
            }
        }
        InputCommand::Invalid(reason) => display::print_error(&reason),
        InputCommand::Quit => return false,
    }
    true
}

async fn run(
    handles: Vec<String>,
    team: Option<String>,
    dir: Option<PathBuf>,
    message: Option<String>,
    config: FleetConfig,
    raw: bool,
) {
    let supervisor = Supervisor::new(config);

    let mut events = supervisor.subscribe();
    let printer = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => display::print_event(&event, raw),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Event printer lagged");
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    for handle in handles {
        let mut request = SpawnRequest::new(handle.clone());
        request.team_name.clone_from(&team);
        request.working_directory.clone_from(&dir);
        request.initial_message.clone_from(&message);
        if let Err(e) = supervisor.spawn(request) {
            display::print_error(&format!("{handle}: {e}"));
        }
    }

    if supervisor.live_count() == 0 {
        display::print_error("no workers started");
        std::process::exit(1);
    }

    supervisor.start_health_monitor();
    tracing::info!(workers = supervisor.live_count(), "Fleet running");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    tracing::warn!(error = %e, "Failed to listen for Ctrl-C");
                }
                break;
            }
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    if !handle_input(&supervisor, &line).await {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to read stdin");
                    break;
                }
            },
        }
    }

    supervisor.shutdown().await;
    drop(supervisor);
    if tokio::time::timeout(EVENT_FLUSH_TIMEOUT, printer).await.is_err() {
        tracing::debug!("Event printer still running at exit");
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Commands::Run {
            handles,
            team,
            dir,
            message,
            config,
            max_workers,
            no_auto_restart,
            raw,
        } => {
            let mut config = load_config(config);
            if let Some(max) = max_workers {
                config.max_workers = max;
            }
            if no_auto_restart {
                config.auto_restart = false;
            }
            if let Err(reason) = config.validate() {
                display::print_error(&reason);
                std::process::exit(1);
            }
            run(handles, team, dir, message, config, raw).await;
        }
        Commands::Config { config } => {
            let config = load_config(config);
            match toml::to_string_pretty(&config) {
                Ok(text) => print!("{text}"),
                Err(e) => {
                    display::print_error(&e.to_string());
                    std::process::exit(1);
                }
            }
        }
    }
}
