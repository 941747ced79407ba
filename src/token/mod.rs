//! Identity token lifecycle: minting, caching, refresh, and invalidation.

pub mod manager;
pub mod source;

pub use manager::{TokenManager, TokenMetadata, TokenState, TokenStats};
pub use source::{GoogleSourceFactory, IdentityToken, SourceFactory, TokenSource};
