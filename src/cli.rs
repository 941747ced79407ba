//! Command-line interface definitions for `token-gateway`.
//!
//! Defines the top-level [`Cli`] struct parsed by `clap`.

use std::path::PathBuf;

use clap::Parser;

/// Authenticating reverse proxy for protected upstreams (Cloud Run).
///
/// Clients send plain HTTP requests; the gateway attaches a short-lived
/// audience-scoped identity token minted from a service-account credential
/// and forwards the request to the configured upstream. Tokens are cached
/// per audience and refreshed before expiry.
#[derive(Parser, Debug)]
#[command(name = "token-gateway")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to the gateway configuration file (YAML)
    #[arg(short, long, default_value = "config.yaml", env = "TOKEN_GATEWAY_CONFIG")]
    pub config: PathBuf,

    /// Path to the GCP service account JSON key file
    /// (overrides GOOGLE_APPLICATION_CREDENTIALS)
    #[arg(long, env = "GOOGLE_APPLICATION_CREDENTIALS")]
    pub credentials: Option<PathBuf>,

    /// Minimum log level: trace, debug, info, warn, or error
    /// (overrides the config file)
    #[arg(long, env = "TOKEN_GATEWAY_LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Log output format: "text" for human-readable, "json" for structured
    /// (overrides the config file)
    #[arg(long, env = "TOKEN_GATEWAY_LOG_FORMAT")]
    pub log_format: Option<String>,
}
