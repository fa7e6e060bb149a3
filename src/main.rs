// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use std::process::{Command, Stdio};
use std::sync::atomic::Ordering;
use std::time::Duration;

use stablehand::{
    DeleteOutcome, HttpTransport, ManagerConfig, ModelRecord, Prober, ProcessPull, ProgressEvent,
    PullOrchestrator, PullResult, PullSource, RegistryClient, ServiceStatus,
};

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// How long `serve` and `doctor --wait` poll for the daemon by default.
const DEFAULT_WAIT_SECS: u64 = 15;

/// Interval between readiness probes.
const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Exit codes following sysexits.h conventions
mod exit_codes {
    /// Success - operation completed successfully
    pub const SUCCESS: i32 = 0;
    /// General error - unspecified error
    pub const ERROR: i32 = 1;
    /// Service unavailable - the daemon is not running
    pub const SERVICE_UNAVAILABLE: i32 = 69;
}

/// stablehand - model lifecycle manager for Ollama-compatible daemons.
#[derive(Parser)]
#[command(name = "stablehand")]
#[command(version = VERSION)]
#[command(about = "Model lifecycle manager for Ollama-compatible daemons. Probe, list, pull, done.")]
#[command(long_about = "stablehand - model lifecycle manager\n\n\
    Ensure the default model:  stablehand\n\
    List installed models:     stablehand list\n\
    Pull a model:              stablehand pull qwen3:0.6b\n\
    Pick one interactively:    stablehand select\n\
    Check the daemon:          stablehand doctor")]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Daemon base URL (overrides config file and OLLAMA_HOST)
    #[arg(long, global = true)]
    host: Option<String>,

    /// Verbose mode: detailed output for debugging (repeat for more)
    #[arg(short = 'v', long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// List installed models
    ///
    /// Examples:
    ///   stablehand list
    ///   stablehand ls
    #[command(alias = "ls")]
    List,

    /// Show details for one model
    ///
    /// Examples:
    ///   stablehand show qwen3:0.6b
    Show {
        /// Model identifier (family:tag)
        name: String,
    },

    /// Pull a model, streaming progress
    ///
    /// Examples:
    ///   stablehand pull qwen3:0.6b
    ///   stablehand pull llama3:8b --cli
    Pull {
        /// Model identifier (family:tag)
        name: String,
        /// Pull through the external CLI instead of the daemon API
        #[arg(long)]
        cli: bool,
    },

    /// Delete an installed model
    ///
    /// Examples:
    ///   stablehand delete qwen3:0.6b
    #[command(alias = "rm")]
    Delete {
        /// Model identifier (family:tag)
        name: String,
    },

    /// Pick a model interactively and pull it
    Select,

    /// Check daemon reachability
    ///
    /// Examples:
    ///   stablehand doctor
    ///   stablehand doctor --wait 30
    Doctor {
        /// Wait up to this many seconds for the daemon to come up
        #[arg(long, value_name = "SECS")]
        wait: Option<u64>,
    },

    /// Start the daemon in the background and wait until it is ready
    Serve,
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match run(cli) {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("{} {:#}", "[X]".red(), e);
            std::process::exit(exit_codes::ERROR);
        }
    }
}

fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => tracing::Level::WARN,
        1 => tracing::Level::INFO,
        _ => tracing::Level::DEBUG,
    };
    let _ = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .try_init();
}

fn run(cli: Cli) -> Result<i32> {
    let mut config = ManagerConfig::load();
    if let Some(host) = cli.host {
        config.host = host;
    }

    let transport = HttpTransport::new(&config.host, config.connect_timeout())
        .context("failed to build HTTP client")?;
    let registry = RegistryClient::new(transport, &config);

    match cli.command {
        None => ensure_default(registry, &config),
        Some(Commands::List) => cmd_list(&registry),
        Some(Commands::Show { name }) => cmd_show(&registry, &name),
        Some(Commands::Pull { name, cli }) => cmd_pull(registry, &config, &name, cli),
        Some(Commands::Delete { name }) => cmd_delete(&registry, &name),
        Some(Commands::Select) => cmd_select(registry, &config),
        Some(Commands::Doctor { wait }) => cmd_doctor(&registry, wait),
        Some(Commands::Serve) => cmd_serve(&registry, &config),
    }
}

/// Default action: make sure the configured default model is installed.
fn ensure_default(registry: RegistryClient<HttpTransport>, config: &ManagerConfig) -> Result<i32> {
    let prober = Prober::new(&registry);
    if prober.probe() == ServiceStatus::Unreachable {
        eprintln!("{} Cannot reach the daemon at {}", "[X]".red(), config.host);
        eprintln!("    Start it with: {}", "stablehand serve".cyan());
        return Ok(exit_codes::SERVICE_UNAVAILABLE);
    }

    println!("Installed models:");
    let models = registry.list().context("failed to list models")?;
    if models.is_empty() {
        println!("  (none)");
    }
    for model in &models {
        println!("  - {}", model.name);
    }
    println!();

    let default = &config.default_model;
    if models.iter().any(|m| &m.name == default) {
        println!("{} Default model {} already installed", "[OK]".green(), default.bold());
        return Ok(exit_codes::SUCCESS);
    }

    println!("Default model {} not found. Pulling now...", default.bold());
    pull_with_bar(registry, config, default, PullSource::Http)
}

fn cmd_list(registry: &RegistryClient<HttpTransport>) -> Result<i32> {
    let models = registry.list().context("failed to list models")?;
    if models.is_empty() {
        println!("No models installed");
        return Ok(exit_codes::SUCCESS);
    }

    for model in &models {
        println!("{}", format_record(model));
    }
    Ok(exit_codes::SUCCESS)
}

fn cmd_show(registry: &RegistryClient<HttpTransport>, name: &str) -> Result<i32> {
    match registry.show(name).context("show failed")? {
        Some(model) => {
            println!("{}", model.name.bold());
            if let Some(size) = model.size {
                println!("  size:     {}", format_size(size));
            }
            if let Some(digest) = &model.digest {
                println!("  digest:   {}", digest);
            }
            if let Some(modified) = model.modified_at {
                println!("  modified: {}", modified.format("%Y-%m-%d %H:%M:%S UTC"));
            }
            Ok(exit_codes::SUCCESS)
        }
        None => {
            println!("{} Model {} is not installed", "[!]".yellow(), name.bold());
            Ok(exit_codes::ERROR)
        }
    }
}

fn cmd_pull(
    registry: RegistryClient<HttpTransport>,
    config: &ManagerConfig,
    name: &str,
    via_cli: bool,
) -> Result<i32> {
    let source = if via_cli {
        PullSource::Process(ProcessPull::new(&config.pull_tool))
    } else {
        PullSource::Http
    };
    pull_with_bar(registry, config, name, source)
}

fn cmd_delete(registry: &RegistryClient<HttpTransport>, name: &str) -> Result<i32> {
    match registry.delete(name).context("delete failed")? {
        DeleteOutcome::Deleted => {
            println!("{} Deleted {}", "[OK]".green(), name.bold());
            Ok(exit_codes::SUCCESS)
        }
        DeleteOutcome::NotFound => {
            println!("{} Model {} is not installed", "[!]".yellow(), name.bold());
            Ok(exit_codes::ERROR)
        }
    }
}

fn cmd_select(registry: RegistryClient<HttpTransport>, config: &ManagerConfig) -> Result<i32> {
    const CUSTOM: &str = "Enter a custom model name...";

    let mut options: Vec<String> = config.known_models.clone();
    options.push(CUSTOM.to_string());

    let choice = inquire::Select::new("Select a model to download:", options)
        .prompt()
        .context("selection cancelled")?;

    let name = if choice == CUSTOM {
        inquire::Text::new("Model name (e.g. llama3:8b):")
            .prompt()
            .context("input cancelled")?
    } else {
        choice
    };
    let name = name.trim().to_string();
    if name.is_empty() {
        bail!("no model name given");
    }

    let confirmed = inquire::Confirm::new(&format!("Download {}?", name))
        .with_default(true)
        .prompt()
        .unwrap_or(false);
    if !confirmed {
        println!("{} Download cancelled", "[!]".yellow());
        return Ok(exit_codes::SUCCESS);
    }

    pull_with_bar(registry, config, &name, PullSource::Http)
}

fn cmd_doctor(registry: &RegistryClient<HttpTransport>, wait: Option<u64>) -> Result<i32> {
    let prober = Prober::new(registry);
    let status = match wait {
        Some(secs) => prober.wait_until_ready(Duration::from_secs(secs), POLL_INTERVAL),
        None => prober.probe(),
    };

    match status {
        ServiceStatus::Reachable => {
            println!("{} Daemon: reachable", "[OK]".green());
            Ok(exit_codes::SUCCESS)
        }
        ServiceStatus::Unreachable => {
            println!("{} Daemon: not reachable", "[X]".red());
            println!("    Start it with: {}", "stablehand serve".cyan());
            Ok(exit_codes::SERVICE_UNAVAILABLE)
        }
    }
}

/// Spawn the daemon detached and wait for it to come up. Fire-and-forget
/// glue around the core: the prober does the actual readiness work.
fn cmd_serve(registry: &RegistryClient<HttpTransport>, config: &ManagerConfig) -> Result<i32> {
    let prober = Prober::new(registry);
    if prober.probe() == ServiceStatus::Reachable {
        println!("{} Daemon already running", "[OK]".green());
        return Ok(exit_codes::SUCCESS);
    }

    println!("Starting {} in the background...", config.pull_tool);
    spawn_daemon(&config.pull_tool).context("failed to start the daemon")?;

    let spinner = spinner("Waiting for the daemon to come up...");
    let status = prober.wait_until_ready(Duration::from_secs(DEFAULT_WAIT_SECS), POLL_INTERVAL);
    spinner.finish_and_clear();

    match status {
        ServiceStatus::Reachable => {
            println!("{} Daemon is up at {}", "[OK]".green(), config.host);
            Ok(exit_codes::SUCCESS)
        }
        ServiceStatus::Unreachable => {
            eprintln!("{} Daemon did not come up within {}s", "[X]".red(), DEFAULT_WAIT_SECS);
            Ok(exit_codes::SERVICE_UNAVAILABLE)
        }
    }
}

#[cfg(target_os = "windows")]
fn spawn_daemon(tool: &str) -> std::io::Result<()> {
    use std::os::windows::process::CommandExt;
    const CREATE_NO_WINDOW: u32 = 0x08000000;
    const DETACHED_PROCESS: u32 = 0x00000008;

    Command::new(tool)
        .arg("serve")
        .creation_flags(CREATE_NO_WINDOW | DETACHED_PROCESS)
        .spawn()
        .map(|_| ())
}

#[cfg(not(target_os = "windows"))]
fn spawn_daemon(tool: &str) -> std::io::Result<()> {
    Command::new(tool)
        .arg("serve")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .map(|_| ())
}

/// Run a pull with a progress bar wired to the event stream. Ctrl+C flips
/// the orchestrator's cancellation flag so the transfer ends as Cancelled
/// instead of being torn down mid-write.
fn pull_with_bar(
    registry: RegistryClient<HttpTransport>,
    config: &ManagerConfig,
    name: &str,
    source: PullSource,
) -> Result<i32> {
    let orchestrator = PullOrchestrator::new(registry, source);

    let cancel = orchestrator.cancel_flag();
    let _ = ctrlc::set_handler(move || cancel.store(true, Ordering::SeqCst));

    let bar = ProgressBar::new(100);
    bar.set_style(
        ProgressStyle::default_bar()
            .template("{bar:30.cyan/blue} {percent:>3}% {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar()),
    );

    // The latest event is authoritative for display. Distinct digests are
    // distinct layers; the bar tracks whichever one is currently moving.
    let mut current_digest: Option<String> = None;
    let render = |event: &ProgressEvent| {
        if event.digest != current_digest {
            current_digest = event.digest.clone();
            bar.set_position(0);
        }
        if let Some(pct) = event.percentage() {
            bar.set_position(pct as u64);
        }
        bar.set_message(event.status.clone());
        Ok(())
    };

    let result = orchestrator.ensure(name, render, Some(config.pull_timeout()));
    bar.finish_and_clear();

    match result {
        PullResult::Success => {
            println!("{} Model {} is ready", "[OK]".green(), name.bold());
            Ok(exit_codes::SUCCESS)
        }
        PullResult::Cancelled => {
            println!("{} Pull of {} cancelled", "[!]".yellow(), name.bold());
            Ok(exit_codes::ERROR)
        }
        PullResult::Failure(cause) => {
            eprintln!("{} Failed to pull {}: {}", "[X]".red(), name.bold(), cause);
            Ok(exit_codes::ERROR)
        }
    }
}

/// Create a spinner with consistent styling.
fn spinner(message: &str) -> ProgressBar {
    let spinner = ProgressBar::new_spinner();
    spinner.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.cyan} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    spinner.set_message(message.to_string());
    spinner.enable_steady_tick(Duration::from_millis(80));
    spinner
}

fn format_record(model: &ModelRecord) -> String {
    let size = model
        .size
        .map(format_size)
        .unwrap_or_else(|| "-".to_string());
    let modified = model
        .modified_at
        .map(|t| t.format("%Y-%m-%d").to_string())
        .unwrap_or_else(|| "-".to_string());
    format!("{:<28} {:>10}  {}", model.name, size, modified)
}

fn format_size(bytes: u64) -> String {
    if bytes >= 1_073_741_824 {
        format!("{:.1} GB", bytes as f64 / 1_073_741_824.0)
    } else if bytes >= 1_048_576 {
        format!("{:.1} MB", bytes as f64 / 1_048_576.0)
    } else if bytes >= 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else {
        format!("{} B", bytes)
    }
}
