//! Packet Holder Library
//!
//! A transparent TCP relay between one client and one upstream server that
//! withholds client packets matching configurable rules and releases them
//! when later traffic (or an operator) says so.

pub mod config;
pub mod connection;
pub mod controller;
pub mod error;
pub mod holding;
pub mod management;
pub mod metrics;
pub mod relay;
pub mod shutdown;

pub use config::Config;
pub use connection::{ConnectionManager, RetryPolicy};
pub use controller::{PacketHolder, RelayState, RelayStatus, StartMode};
pub use error::{HolderError, HolderResult};
pub use holding::{HoldingRuleSet, ReleaseType};
pub use shutdown::ShutdownCoordinator;

/// Common error type for application glue
pub type Result<T> = anyhow::Result<T>;
