//! Token Gateway - authenticating reverse proxy for protected upstreams
//!
//! Mints audience-scoped identity tokens from a service-account credential
//! and injects them into proxied requests.

use std::{process::ExitCode, sync::Arc};

use clap::Parser;
use tracing::{error, info};

use token_gateway::{
    cli::Cli,
    config::Config,
    gateway::Gateway,
    setup_tracing,
    token::GoogleSourceFactory,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Configuration problems are reported on stderr; tracing is not up yet.
    let config = match Config::load(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    let level = cli.log_level.as_deref().unwrap_or(&config.logging.level);
    let format = cli.log_format.as_deref().unwrap_or(&config.logging.format);
    if let Err(e) = setup_tracing(level, format) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %cli.config.display(),
        upstreams = config.upstreams.len(),
        "Starting Token Gateway"
    );

    // The --credentials flag carries the GOOGLE_APPLICATION_CREDENTIALS env
    // fallback, so a set variable lands here too.
    let credentials = match cli.credentials.filter(|p| !p.as_os_str().is_empty()) {
        Some(path) => path,
        None => {
            error!("GOOGLE_APPLICATION_CREDENTIALS environment variable not set");
            return ExitCode::FAILURE;
        }
    };
    info!(path = %credentials.display(), "Using credentials file");

    let factory = match GoogleSourceFactory::new(credentials) {
        Ok(factory) => Arc::new(factory),
        Err(e) => {
            error!("Failed to create token source factory: {e}");
            return ExitCode::FAILURE;
        }
    };

    let gateway = match Gateway::new(config, factory) {
        Ok(gateway) => gateway,
        Err(e) => {
            error!("Failed to create gateway: {e}");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = gateway.run().await {
        error!("Gateway error: {e}");
        return ExitCode::FAILURE;
    }

    info!("Gateway shutdown complete");
    ExitCode::SUCCESS
}
