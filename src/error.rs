//! Error Types
//!
//! Structured errors surfaced by the holding engine and lifecycle controller.
//! Application glue (config loading, the binary, the management server) keeps
//! using `anyhow` on top of these.

use std::net::SocketAddr;
use thiserror::Error;

/// Errors raised by rule registration, connection setup and lifecycle calls
#[derive(Debug, Error)]
pub enum HolderError {
    /// Rule index outside of the configured rule slots
    #[error("Invalid rule index {index} (rule slots: {slots})")]
    InvalidRuleIndex { index: usize, slots: usize },

    /// Hold or release pattern failed to compile
    #[error("Invalid pattern '{pattern}': {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    /// Listening socket could not be created or bound
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// Accepting the single client connection failed
    #[error("Failed to accept client on {addr}: {source}")]
    Accept {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// Upstream actively rejected the connection (not retried)
    #[error("Upstream {addr} refused the connection after {attempts} attempt(s): {source}")]
    UpstreamRefused {
        addr: SocketAddr,
        attempts: u32,
        #[source]
        source: std::io::Error,
    },

    /// Every connect attempt timed out
    #[error("Upstream {addr} unreachable after {attempts} attempt(s)")]
    UpstreamExhausted { addr: SocketAddr, attempts: u32 },

    /// `start()` called while a relay run is in progress
    #[error("Packet holder is already running")]
    AlreadyRunning,

    /// `stop()` or a relay-only operation called while idle
    #[error("Packet holder is not running")]
    NotRunning,

    /// Rules can only change while the relay is idle
    #[error("Rules cannot be changed while the relay is running")]
    RulesLocked,

    /// Startup interrupted by `stop()`
    #[error("Startup cancelled")]
    Cancelled,

    /// Any other socket error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl HolderError {
    /// True for errors caused by caller misuse rather than the network
    pub fn is_lifecycle_misuse(&self) -> bool {
        matches!(
            self,
            HolderError::AlreadyRunning | HolderError::NotRunning | HolderError::RulesLocked
        )
    }

    /// True for configuration errors rejected at registration time
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            HolderError::InvalidRuleIndex { .. } | HolderError::InvalidPattern { .. }
        )
    }
}

/// Result alias for holder operations
pub type HolderResult<T> = std::result::Result<T, HolderError>;
