//! Configuration management

use std::{env, path::Path};

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use regex::Regex;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::{Error, Result};

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Server configuration
    pub server: ServerConfig,
    /// Upstream services, in priority order (the first is the default)
    pub upstreams: Vec<UpstreamConfig>,
    /// Logging configuration
    pub logging: LoggingConfig,
    /// Token management configuration
    pub token: TokenConfig,
}

impl Config {
    /// Load configuration from file and environment
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(Error::Config(format!(
                "Config file not found: {}",
                path.display()
            )));
        }

        let figment = Figment::new()
            .merge(Yaml::file(path))
            .merge(Env::prefixed("TOKEN_GATEWAY_").split("__"));

        let mut config: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;

        config.expand_env_vars();

        // Token caching cannot be disabled; the field is accepted for
        // config-file compatibility only.
        config.token.enable_cache = true;

        config.validate()?;

        Ok(config)
    }

    /// Expand ${VAR} patterns in upstream url, audience, and host values
    fn expand_env_vars(&mut self) {
        let re = Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}").unwrap();

        let expand = |value: &mut String| {
            let expanded = re.replace_all(value, |caps: &regex::Captures| {
                env::var(&caps[1]).unwrap_or_default()
            });
            *value = expanded.into_owned();
        };

        for upstream in &mut self.upstreams {
            expand(&mut upstream.url);
            expand(&mut upstream.audience);
            if let Some(ref mut host) = upstream.host {
                expand(host);
            }
        }
    }

    /// Check that the configuration is complete and consistent
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(Error::Config("invalid port: 0".to_string()));
        }

        if self.upstreams.is_empty() {
            return Err(Error::Config("no upstreams configured".to_string()));
        }

        for (i, upstream) in self.upstreams.iter().enumerate() {
            if upstream.name.is_empty() {
                return Err(Error::Config(format!("upstream[{i}]: name is required")));
            }
            if upstream.url.is_empty() {
                return Err(Error::Config(format!("upstream[{i}]: url is required")));
            }
            if upstream.audience.is_empty() {
                return Err(Error::Config(format!(
                    "upstream[{i}]: audience is required"
                )));
            }
            let url = Url::parse(&upstream.url).map_err(|e| {
                Error::Config(format!("upstream[{i}]: invalid url {:?}: {e}", upstream.url))
            })?;
            if url.scheme() != "http" && url.scheme() != "https" {
                return Err(Error::Config(format!(
                    "upstream[{i}]: unsupported url scheme {:?}",
                    url.scheme()
                )));
            }
        }

        match self.logging.level.as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            other => {
                return Err(Error::Config(format!("invalid log level: {other:?}")));
            }
        }
        match self.logging.format.as_str() {
            "text" | "json" => {}
            other => {
                return Err(Error::Config(format!("invalid log format: {other:?}")));
            }
        }

        Ok(())
    }
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind to
    pub address: String,
    /// Port to listen on
    pub port: u16,
    /// Read timeout in seconds
    pub read_timeout: u64,
    /// Write timeout in seconds
    pub write_timeout: u64,
    /// Idle connection timeout in seconds
    pub idle_timeout: u64,
    /// Allowed path patterns (exact, `/prefix/*`, or `/prefix/**`).
    /// An empty list allows every path.
    pub allowed_paths: Vec<String>,
}

impl ServerConfig {
    /// Full bind address in `address:port` form
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: "0.0.0.0".to_string(),
            port: 8080,
            read_timeout: 30,
            write_timeout: 30,
            idle_timeout: 120,
            allowed_paths: Vec::new(),
        }
    }
}

/// A single upstream service
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    /// Unique name used for routing (`X-Target-Upstream`)
    pub name: String,
    /// Absolute base URL of the upstream
    pub url: String,
    /// Audience string used when minting identity tokens; must match what
    /// the upstream expects
    pub audience: String,
    /// Optional Host header override; the target URL's host is used when empty
    pub host: Option<String>,
    /// Per-request upstream timeout in seconds
    pub timeout: u64,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            url: String::new(),
            audience: String::new(),
            host: None,
            timeout: 30,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Minimum log level: trace, debug, info, warn, or error
    pub level: String,
    /// Output format: "text" or "json"
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
        }
    }
}

/// Token management configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenConfig {
    /// Minutes before expiry at which a still-valid token is refreshed
    pub refresh_before_expiry: u64,
    /// Whether tokens are cached (always true; accepted for compatibility)
    pub enable_cache: bool,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            refresh_before_expiry: 5,
            enable_cache: true,
        }
    }
}
