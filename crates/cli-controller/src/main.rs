//! CLI entry point for the transcode job controller
//!
//! Loads configuration, runs startup checks, recovers persisted jobs and
//! serves the control API until SIGINT or SIGTERM.

use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use transcode_controller::{
    create_api_router, run_api_server, run_startup_checks, shutdown_signal, Config, Controller,
    FfmpegLauncher,
};

/// Transcode job controller - HLS packaging for live channels and uploads
#[derive(Parser, Debug)]
#[command(name = "transcode-controller")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to a TOML configuration file. Environment variables only when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Skip startup checks (encoder availability). For testing only.
    #[arg(long, default_value = "false")]
    skip_checks: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let args = Args::parse();

    let config = match &args.config {
        Some(path) => match Config::load(path) {
            Ok(config) => {
                info!(path = %path.display(), "configuration loaded");
                config
            }
            Err(e) => {
                error!(path = %path.display(), error = %e, "failed to load configuration");
                return ExitCode::FAILURE;
            }
        },
        None => Config::from_env(),
    };

    if args.skip_checks {
        warn!("skipping startup checks (--skip-checks enabled)");
    } else if let Err(e) = run_startup_checks(&config) {
        error!(error = %e, "startup checks failed");
        return ExitCode::FAILURE;
    }

    let launcher = Arc::new(FfmpegLauncher::new(&config.encoder.program));
    let controller = match Controller::start(&config, launcher).await {
        Ok(controller) => controller,
        Err(e) => {
            error!(error = %e, "failed to start controller");
            return ExitCode::FAILURE;
        }
    };

    let listener = match TcpListener::bind(config.server.bind.as_str()).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(bind = %config.server.bind, error = %e, "failed to bind API listener");
            return ExitCode::FAILURE;
        }
    };
    info!(
        bind = %config.server.bind,
        auth = config.token().is_some(),
        "job controller listening"
    );

    let router = create_api_router(controller, config.token());
    let grace = Duration::from_secs(config.server.shutdown_grace_secs);
    if let Err(e) = run_api_server(listener, router, grace, shutdown_signal()).await {
        error!(error = %e, "API server error");
        return ExitCode::FAILURE;
    }

    info!("job controller stopped");
    ExitCode::SUCCESS
}
