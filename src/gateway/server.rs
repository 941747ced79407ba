//! Gateway server

use std::{net::SocketAddr, sync::Arc};

use tokio::net::TcpListener;
use tokio::signal;
use tracing::info;

use super::router::{AppState, create_router};
use super::upstream::UpstreamTable;
use crate::config::Config;
use crate::token::{SourceFactory, TokenManager};
use crate::{Error, Result};

/// Token gateway server
pub struct Gateway {
    /// Configuration
    config: Config,
    /// Token cache
    tokens: Arc<TokenManager>,
    /// Upstream table
    upstreams: Arc<UpstreamTable>,
}

impl Gateway {
    /// Create a new gateway from validated configuration and a token source
    /// factory
    pub fn new(config: Config, factory: Arc<dyn SourceFactory>) -> Result<Self> {
        let upstreams = Arc::new(UpstreamTable::new(
            &config.upstreams,
            config.server.allowed_paths.clone(),
        )?);
        let tokens = Arc::new(TokenManager::new(
            factory,
            config.token.refresh_before_expiry,
        ));

        for upstream in upstreams.iter() {
            info!(
                upstream = %upstream.config.name,
                url = %upstream.config.url,
                audience = %upstream.config.audience,
                host = upstream.config.host.as_deref().unwrap_or(""),
                "Configured upstream"
            );
        }

        Ok(Self {
            config,
            tokens,
            upstreams,
        })
    }

    /// Run the gateway until SIGINT/SIGTERM
    pub async fn run(self) -> Result<()> {
        let addr = self.config.server.bind_address();

        let state = Arc::new(AppState {
            upstreams: self.upstreams,
            tokens: self.tokens,
        });
        let app = create_router(state);

        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| Error::Config(format!("failed to bind {addr}: {e}")))?;

        info!(
            address = %addr,
            upstreams = self.config.upstreams.len(),
            allowed_paths = self.config.server.allowed_paths.len(),
            "Listening"
        );

        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| Error::Internal(e.to_string()))?;

        info!("Server shutdown completed");
        Ok(())
    }
}

/// Shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received");
}
