//! Token Gateway Library
//!
//! Authenticating reverse proxy that sits between internal clients and
//! protected upstream services (typically Google Cloud Run).
//!
//! # Features
//!
//! - **Token lifecycle**: per-audience identity tokens minted from a
//!   service-account credential, cached, refreshed before expiry, and
//!   reissued after upstream rejection
//! - **Single-flight minting**: at most one in-flight mint per audience,
//!   concurrent readers served from cache
//! - **Routing**: upstream selection via the `X-Target-Upstream` header with
//!   a path allow-list gate
//! - **Production Ready**: health/readiness endpoints, token metrics,
//!   graceful shutdown

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cli;
pub mod config;
pub mod error;
pub mod gateway;
pub mod token;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
pub fn setup_tracing(level: &str, format: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        "json" => {
            subscriber.with(fmt::layer().json()).init();
        }
        _ => {
            subscriber.with(fmt::layer()).init();
        }
    }

    Ok(())
}
