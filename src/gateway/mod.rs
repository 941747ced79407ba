//! HTTP server, routing, and the proxy pipeline

pub mod proxy;
pub mod router;
pub mod server;
pub mod upstream;

pub use router::{AppState, create_router};
pub use server::Gateway;
