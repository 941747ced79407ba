//! Error types for the token gateway

use std::io;

use thiserror::Error;

/// Result type alias for the token gateway
pub type Result<T> = std::result::Result<T, Error>;

/// Token gateway errors
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error (fatal at startup)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Credential error: the token source could not be instantiated
    #[error("Credential error: {0}")]
    Credential(String),

    /// Mint error: the identity provider call failed
    #[error("Token mint error: {0}")]
    Mint(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP client error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JWT signing/decoding error
    #[error("JWT error: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}
