//! `pilot-drive` – PILOT Drive head-unit backend
//!
//! This binary is the single entry point for the vehicle head unit.  It:
//!
//! 1. With `--install` runs the setup wizard and exits (`--default` answers
//!    every prompt with its default).
//! 2. Otherwise loads `pilot-drive.toml` and `settings.json`, starts every
//!    configured Service and serves the UI over WebSocket and HTTP until
//!    SIGINT, SIGTERM or SIGQUIT.
//! 3. With the hidden `--worker <tag>` hosts a single Service for a parent
//!    supervisor.

mod app;
mod config;
mod installer;
mod telemetry;

use std::io;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::Parser;
use colored::Colorize;
use pilot_services::SettingsStore;
use pilot_services::settings::LoggingSettings;
use pilot_types::PilotError;

#[derive(Debug, Parser)]
#[command(name = "pilot-drive", version, about = "PILOT Drive head-unit backend")]
struct Cli {
    /// Run the setup wizard.
    #[arg(short, long)]
    install: bool,

    /// Accept every installer default without prompting.
    #[arg(short, long, requires = "install")]
    default: bool,

    /// Application config file.
    #[arg(long, env = "PILOT_CONFIG", value_name = "PATH")]
    config: Option<PathBuf>,

    #[arg(long, hide = true, value_name = "TAG", conflicts_with = "install")]
    worker: Option<String>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let config_path = config::config_path(cli.config.as_deref());

    // ── Worker process ────────────────────────────────────────────────────
    if let Some(tag) = cli.worker.as_deref() {
        return report(run_worker(tag, &config_path));
    }

    if !is_root() {
        eprintln!(
            "{} pilot-drive needs root privileges to reach the vehicle hardware; re-run with sudo.",
            "error:".red().bold()
        );
        return ExitCode::FAILURE;
    }

    // ── Installer ─────────────────────────────────────────────────────────
    if cli.install {
        let mut stdin = io::stdin().lock();
        let answers = if cli.default {
            installer::Answers::Defaults
        } else {
            installer::Answers::Interactive(&mut stdin)
        };
        return match installer::run(&config_path, answers, &mut io::stdout()) {
            Ok(installed) => {
                let mut start = String::from("pilot-drive");
                if cli.config.is_some() {
                    start.push_str(&format!(" --config {}", installed.config_path.display()));
                }
                println!("  Edit {} for further options.", installed.settings_path.display());
                println!("  Start the server with {}\n", start.bold());
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("{}: {e}", "Install failed".red());
                ExitCode::FAILURE
            }
        };
    }

    print_banner();
    report(run_server(&config_path, cli.config.is_some()))
}

fn run_server(config_path: &Path, explicit: bool) -> Result<(), PilotError> {
    let cfg = config::load_from(config_path)?;
    let settings = SettingsStore::open(&cfg.settings_path)?;
    let _telemetry = telemetry::init_server(&logging_settings(&settings))?;
    tracing::info!(
        config = %config_path.display(),
        ws_port = cfg.ws_port,
        static_port = cfg.static_port,
        version = pilot_services::VERSION,
        "pilot-drive starting"
    );
    app::run_server(&cfg, settings, explicit.then_some(config_path))
}

fn run_worker(tag: &str, config_path: &Path) -> Result<(), PilotError> {
    let cfg = config::load_from(config_path)?;
    let settings = SettingsStore::open(&cfg.settings_path)?;
    let _telemetry = telemetry::init_worker(&logging_settings(&settings))?;
    app::run_worker(tag, settings)
}

fn logging_settings(settings: &SettingsStore) -> LoggingSettings {
    settings.logging().unwrap_or_else(|e| {
        eprintln!("[pilot-drive] invalid logging settings ({e}), using defaults");
        LoggingSettings::default()
    })
}

fn report(result: Result<(), PilotError>) -> ExitCode {
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}: {e}", "error".red().bold());
            ExitCode::FAILURE
        }
    }
}

#[cfg(unix)]
fn is_root() -> bool {
    // SAFETY: geteuid has no preconditions and cannot fail.
    unsafe { libc::geteuid() == 0 }
}

#[cfg(not(unix))]
fn is_root() -> bool {
    true
}

// ─────────────────────────────────────────────────────────────────────────────
// Banner
// ─────────────────────────────────────────────────────────────────────────────

fn print_banner() {
    println!();
    println!("{}", r#"    ____  ______    ____  ______"#.bold().cyan());
    println!("{}", r#"   / __ \/  _/ /   / __ \/_  __/"#.bold().cyan());
    println!("{}", r#"  / /_/ // // /   / / / / / /   "#.bold().cyan());
    println!("{}", r#" / ____// // /___/ /_/ / / /    "#.bold().cyan());
    println!("{}", r#"/_/   /___/_____/\____/ /_/     "#.bold().cyan());
    println!();
    println!("  {} {}",
        "PILOT Drive".bold(),
        format!("v{}", env!("CARGO_PKG_VERSION")).dimmed()
    );
    println!("  Vehicle head-unit backend");
    println!();
}
