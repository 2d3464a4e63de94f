//! Configuration Types

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

use crate::holding::ReleaseType;

/// Bytes read from a socket per packet
pub const PACKET_MAX_SIZE: usize = 65536;
/// Upstream connect attempts before giving up
pub const DEFAULT_RETRY_COUNT: u32 = 100;
/// Pause between upstream connect attempts
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(3);
/// Time allowed for a single upstream connect attempt
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Main configuration structure
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub relay: RelayConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub rules: Vec<RuleConfig>,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub monitoring: MonitoringConfig,
}

/// Relay endpoints and output behaviour
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RelayConfig {
    pub bind_addr: SocketAddr,
    pub upstream_addr: SocketAddr,
    #[serde(default)]
    pub only_held_output: bool,
    /// Number of indexed rule slots; defaults to the number of configured rules
    #[serde(default)]
    pub rule_slots: Option<usize>,
}

/// Upstream connection retry budget
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct UpstreamConfig {
    pub retry_count: u32,
    #[serde(with = "humantime_serde")]
    pub retry_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    /// Also retry when the upstream actively refuses the connection
    #[serde(default)]
    pub retry_on_refused: bool,
}

/// Holding rule as written in the configuration file
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct RuleConfig {
    pub hold_keyword: String,
    #[serde(default)]
    pub release_type: ReleaseType,
    #[serde(default)]
    pub release_keyword: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

/// Monitoring configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MonitoringConfig {
    pub log_level: String,
    #[serde(default)]
    pub management_api: ManagementApiConfig,
}

/// Management API configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ManagementApiConfig {
    pub enabled: bool,
    pub bind_addr: SocketAddr,
    #[serde(default)]
    pub auth: crate::management::types::ApiAuthConfig,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            retry_count: DEFAULT_RETRY_COUNT,
            retry_interval: DEFAULT_RETRY_INTERVAL,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            retry_on_refused: false,
        }
    }
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            management_api: ManagementApiConfig::default(),
        }
    }
}

impl Default for ManagementApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 8090)),
            auth: crate::management::types::ApiAuthConfig::default(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            relay: RelayConfig {
                bind_addr: SocketAddr::from(([127, 0, 0, 1], 16000)),
                upstream_addr: SocketAddr::from(([127, 0, 0, 1], 6000)),
                only_held_output: false,
                rule_slots: None,
            },
            upstream: UpstreamConfig::default(),
            rules: vec![],
            keywords: vec![],
            monitoring: MonitoringConfig::default(),
        }
    }
}
