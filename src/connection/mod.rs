//! Connection Management Module
//! 
//! Owns socket setup: the single-client listener and the retrying upstream connect.

pub mod manager;

pub use manager::{ConnectionManager, RetryPolicy};
