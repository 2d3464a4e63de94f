//! Management API Module
//!
//! REST control surface for operators: rules, start/stop, manual flush,
//! output verbosity and a live packet event stream.

pub mod api;
pub mod auth;
pub mod handlers;
pub mod server;
pub mod types;

pub use api::ManagementApi;
pub use auth::ApiAuth;
pub use handlers::AppState;
pub use server::ManagementServer;
pub use types::*;
