#![forbid(unsafe_code)]

//! `gui-launcher` runs the GUI bridge against a frontend dev server or
//! production build.
//!
//! Modes can be chained (`gui-launcher install build run`); steps that
//! depend on others install or build first when their output is missing.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

use gui_launcher::bridge::HttpBridge;
use gui_launcher::config::LauncherConfig;
use gui_launcher::mode::Mode;
use gui_launcher::orchestrator::session::Session;
use gui_launcher::{AppError, Result};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(
    name = "gui-launcher",
    about = "Launch the GUI bridge with the frontend dev server or production build",
    long_about = "Launch the GUI bridge with the frontend dev server or production build.\n\n\
                  Modes can be chained and run in order. Modes that depend on others \
                  install or build first when their output is missing.",
    version
)]
struct Cli {
    /// Modes to run in order (default: build-then-launch).
    #[arg(value_enum)]
    modes: Vec<Mode>,

    /// Path to a TOML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the frontend project directory.
    #[arg(long)]
    project_dir: Option<PathBuf>,

    /// Do not open the bridge URL in a browser.
    #[arg(long)]
    no_browser: bool,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

fn main() -> ExitCode {
    let args = Cli::parse();
    if let Err(err) = init_tracing(args.log_format) {
        eprintln!("{err}");
        return ExitCode::FAILURE;
    }

    let code = match launch(args) {
        Ok(code) => code,
        Err(err) => {
            error!(%err, "launcher failed");
            err.exit_code()
        }
    };

    ExitCode::from(u8::try_from(code).unwrap_or(1))
}

fn launch(args: Cli) -> Result<i32> {
    let mut config = LauncherConfig::load(args.config.as_deref())?;
    if let Some(dir) = args.project_dir {
        config.frontend.dir = dir;
    }
    if args.no_browser {
        config.bridge.open_browser = false;
    }
    info!(frontend = %config.frontend.dir.display(), "configuration loaded");

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(config, args.modes))
}

async fn run(config: LauncherConfig, modes: Vec<Mode>) -> Result<i32> {
    let bridge = Arc::new(HttpBridge::new(&config.bridge));
    let mut session = Session::new(Arc::new(config), bridge);
    session.run(&modes).await
}

fn init_tracing(log_format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt().with_env_filter(env_filter);

    match log_format {
        LogFormat::Text => subscriber
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
    }

    Ok(())
}
