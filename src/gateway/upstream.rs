//! Upstream selection and path gating
//!
//! The table is built once at startup: each upstream's base URL is parsed and
//! a dedicated pooled HTTP client is created carrying that upstream's
//! timeout. Requests pick an upstream via the `X-Target-Upstream` header or
//! fall back to the first configured upstream.

use std::{collections::HashMap, sync::Arc, time::Duration};

use axum::http::HeaderMap;
use reqwest::{Client, redirect::Policy};
use tracing::{debug, warn};

use crate::{
    Error, Result,
    config::UpstreamConfig,
};

/// Header selecting a specific upstream by name
pub const TARGET_UPSTREAM_HEADER: &str = "x-target-upstream";

/// Runtime descriptor for one upstream service
#[derive(Debug)]
pub struct Upstream {
    /// Configuration this descriptor was built from
    pub config: UpstreamConfig,
    /// Base URL, parsed at startup
    pub url: url::Url,
    /// Pooled client carrying this upstream's request timeout
    pub client: Client,
}

/// Ordered upstream set with name lookup and the path allow-list
#[derive(Debug)]
pub struct UpstreamTable {
    upstreams: Vec<Arc<Upstream>>,
    by_name: HashMap<String, Arc<Upstream>>,
    allowed_paths: Vec<String>,
}

impl UpstreamTable {
    /// Build the table from validated configuration
    pub fn new(configs: &[UpstreamConfig], allowed_paths: Vec<String>) -> Result<Self> {
        let mut upstreams = Vec::with_capacity(configs.len());
        let mut by_name = HashMap::with_capacity(configs.len());

        for config in configs {
            let url = url::Url::parse(&config.url).map_err(|e| {
                Error::Config(format!("upstream {:?}: invalid url: {e}", config.name))
            })?;

            let client = Client::builder()
                .timeout(Duration::from_secs(config.timeout))
                .pool_max_idle_per_host(10)
                .pool_idle_timeout(Duration::from_secs(90))
                .tcp_keepalive(Duration::from_secs(30))
                .tcp_nodelay(true)
                // Upstream redirects pass through to the client untouched.
                .redirect(Policy::none())
                .build()?;

            let upstream = Arc::new(Upstream {
                config: config.clone(),
                url,
                client,
            });
            by_name.insert(config.name.clone(), upstream.clone());
            upstreams.push(upstream);
        }

        Ok(Self {
            upstreams,
            by_name,
            allowed_paths,
        })
    }

    /// Number of configured upstreams
    pub fn len(&self) -> usize {
        self.upstreams.len()
    }

    /// Whether any upstreams are configured
    pub fn is_empty(&self) -> bool {
        self.upstreams.is_empty()
    }

    /// Iterate upstreams in configuration order
    pub fn iter(&self) -> impl Iterator<Item = &Arc<Upstream>> {
        self.upstreams.iter()
    }

    /// Path gate: true when the allow-list is empty or any pattern matches
    pub fn is_allowed(&self, path: &str) -> bool {
        if self.allowed_paths.is_empty() {
            return true;
        }

        self.allowed_paths
            .iter()
            .any(|pattern| match_path(pattern, path))
    }

    /// Select the upstream for a request: explicit `X-Target-Upstream` header
    /// if the name is known, otherwise the first configured upstream.
    pub fn select(&self, headers: &HeaderMap) -> Option<Arc<Upstream>> {
        if let Some(name) = headers
            .get(TARGET_UPSTREAM_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            if let Some(upstream) = self.by_name.get(name) {
                debug!(upstream = %name, "Upstream selected by header");
                return Some(upstream.clone());
            }
            warn!(upstream = %name, "Unknown upstream in X-Target-Upstream, using default");
        }

        self.upstreams.first().cloned()
    }
}

/// Check whether a path matches a pattern.
///
/// Supports exact matches and wildcard patterns: `/prefix/*` and `/prefix/**`
/// both match the prefix itself and everything under it.
pub fn match_path(pattern: &str, path: &str) -> bool {
    if pattern == path {
        return true;
    }

    let prefix = if let Some(prefix) = pattern.strip_suffix("/**") {
        prefix
    } else if let Some(prefix) = pattern.strip_suffix("/*") {
        prefix
    } else {
        return false;
    };

    path == prefix || path.starts_with(&format!("{prefix}/"))
}
