//! Management API Types

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::SystemTime;

use crate::holding::ReleaseType;

/// API response wrapper
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<String>,
    pub timestamp: SystemTime,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            timestamp: SystemTime::now(),
        }
    }

    pub fn error(message: String) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message),
            timestamp: SystemTime::now(),
        }
    }
}

/// Health check response
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: String,
    pub version: String,
    pub uptime_seconds: u64,
    pub checks: HashMap<String, CheckResult>,
}

/// Individual health check result
#[derive(Debug, Serialize, Deserialize)]
pub struct CheckResult {
    pub status: String,
    pub message: Option<String>,
}

/// Body of `POST /start`; missing addresses fall back to the configured ones
#[derive(Debug, Default, Deserialize)]
pub struct StartRequest {
    pub bind_addr: Option<SocketAddr>,
    pub upstream_addr: Option<SocketAddr>,
}

/// Body of `PUT /rules/:index`
#[derive(Debug, Deserialize)]
pub struct RuleUpdateRequest {
    pub hold_keyword: String,
    #[serde(default)]
    pub release_type: ReleaseType,
    #[serde(default)]
    pub release_keyword: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

/// Body of `POST /keywords`
#[derive(Debug, Deserialize)]
pub struct KeywordRequest {
    pub keyword: String,
}

/// Body of `PUT /keywords/holding`
#[derive(Debug, Deserialize)]
pub struct HoldingSwitchRequest {
    pub enabled: bool,
}

/// Body of `PUT /output`
#[derive(Debug, Deserialize)]
pub struct OutputRequest {
    pub only_held: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PendingInfo {
    pub pending: usize,
    /// Milliseconds the oldest held packet has been waiting
    pub oldest_age_ms: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct FlushResult {
    pub released: usize,
}

/// API authentication configuration
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ApiAuthConfig {
    pub enabled: bool,
    pub api_key: Option<String>,
    pub basic_auth: Option<BasicAuthConfig>,
}

/// Basic authentication configuration
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct BasicAuthConfig {
    pub username: String,
    pub password: String,
}

impl Default for ApiAuthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            api_key: Some("default-api-key-change-me".to_string()),
            basic_auth: None,
        }
    }
}

fn default_true() -> bool {
    true
}
