//! Configuration Manager

use super::Config;
use crate::holding::{HoldingRuleSet, ReleaseType, MAX_RULES};
use crate::Result;
use anyhow::{bail, Context};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Manages configuration loading and validation
pub struct ConfigManager;

impl ConfigManager {
    /// Load the layered configuration: defaults, then environment, then `path`
    ///
    /// Keys present in the file win over the environment; keys the file
    /// leaves out keep their environment or default value. A missing file
    /// leaves the environment layer as the result.
    pub fn load(path: &Path) -> Result<Config> {
        let base = Self::apply_env(Config::default())?;
        if !path.exists() {
            base.validate()?;
            return Ok(base);
        }

        tracing::info!("Loading configuration from: {}", path.display());
        let mut merged =
            toml::Value::try_from(&base).context("Failed to prepare environment configuration")?;
        overlay(&mut merged, Self::read_layer(path)?);

        let config: Config = merged
            .try_into()
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        config
            .validate()
            .with_context(|| "Configuration validation failed")?;

        tracing::info!("Configuration loaded and validated successfully");
        Ok(config)
    }

    /// Parse a config file into an untyped tree
    fn read_layer(path: &Path) -> Result<toml::Value> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let layer = if is_yaml(path) {
            serde_yaml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?
        } else {
            toml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?
        };
        Ok(layer)
    }

    /// Load configuration from file
    ///
    /// `.yaml`/`.yml` files are parsed as YAML, everything else as TOML.
    pub fn load_from_file(path: &Path) -> Result<Config> {
        if path.exists() {
            tracing::info!("Loading configuration from: {}", path.display());
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;

            let config: Config = if is_yaml(path) {
                serde_yaml::from_str(&content)
                    .with_context(|| format!("Failed to parse config file: {}", path.display()))?
            } else {
                toml::from_str(&content)
                    .with_context(|| format!("Failed to parse config file: {}", path.display()))?
            };

            config
                .validate()
                .with_context(|| "Configuration validation failed")?;

            tracing::info!("Configuration loaded and validated successfully");
            Ok(config)
        } else {
            tracing::warn!("Configuration file not found at {}, using defaults", path.display());
            let config = Config::default();
            config.validate()?;
            Ok(config)
        }
    }

    /// Load configuration from environment variables
    pub fn load_from_env() -> Result<Config> {
        let config = Self::apply_env(Config::default())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply the `PACKETHOLDER_*` variables that are set to `config`
    fn apply_env(mut config: Config) -> Result<Config> {

        if let Ok(bind_addr) = std::env::var("PACKETHOLDER_BIND_ADDR") {
            config.relay.bind_addr = bind_addr
                .parse::<SocketAddr>()
                .with_context(|| format!("Invalid PACKETHOLDER_BIND_ADDR: {}", bind_addr))?;
        }

        if let Ok(upstream_addr) = std::env::var("PACKETHOLDER_UPSTREAM_ADDR") {
            config.relay.upstream_addr = upstream_addr
                .parse::<SocketAddr>()
                .with_context(|| format!("Invalid PACKETHOLDER_UPSTREAM_ADDR: {}", upstream_addr))?;
        }

        if let Ok(retry_count) = std::env::var("PACKETHOLDER_RETRY_COUNT") {
            config.upstream.retry_count = retry_count
                .parse::<u32>()
                .with_context(|| format!("Invalid PACKETHOLDER_RETRY_COUNT: {}", retry_count))?;
        }

        if let Ok(interval) = std::env::var("PACKETHOLDER_RETRY_INTERVAL") {
            config.upstream.retry_interval = humantime::parse_duration(&interval)
                .with_context(|| format!("Invalid PACKETHOLDER_RETRY_INTERVAL: {}", interval))?;
        }

        if let Ok(log_level) = std::env::var("PACKETHOLDER_LOG_LEVEL") {
            config.monitoring.log_level = log_level;
        }

        Ok(config)
    }
}

fn is_yaml(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|ext| ext.to_str()),
        Some("yaml") | Some("yml")
    )
}

/// Merge `layer` into `base`; tables merge key by key, anything else is replaced
fn overlay(base: &mut toml::Value, layer: toml::Value) {
    match (base, layer) {
        (toml::Value::Table(base), toml::Value::Table(layer)) => {
            for (key, value) in layer {
                match base.get_mut(&key) {
                    Some(existing) => overlay(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, layer) => *base = layer,
    }
}

/// Command-line overrides applied on top of the loaded configuration
#[derive(Debug, Default, Clone)]
pub struct CliOverrides {
    pub bind: Option<String>,
    pub upstream: Option<String>,
    pub hold: Option<String>,
    pub release_type: Option<ReleaseType>,
    pub release_keyword: Option<String>,
    pub keywords: Vec<String>,
    pub only_held: bool,
    pub retry_count: Option<u32>,
    pub retry_interval: Option<Duration>,
    pub log_level: Option<String>,
    pub no_management: bool,
}

impl Config {
    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.validate_relay_config()
            .with_context(|| "Relay configuration validation failed")?;

        self.validate_upstream_config()
            .with_context(|| "Upstream configuration validation failed")?;

        self.validate_rules()
            .with_context(|| "Holding rule validation failed")?;

        self.validate_monitoring_config()
            .with_context(|| "Monitoring configuration validation failed")?;

        Ok(())
    }

    fn validate_relay_config(&self) -> Result<()> {
        if self.relay.bind_addr == self.relay.upstream_addr {
            bail!(
                "bind_addr and upstream_addr must differ (both are {})",
                self.relay.bind_addr
            );
        }

        if let Some(slots) = self.relay.rule_slots {
            if slots == 0 || slots > MAX_RULES {
                bail!("rule_slots must be between 1 and {}", MAX_RULES);
            }
            if slots < self.rules.len() {
                bail!(
                    "rule_slots ({}) is smaller than the number of configured rules ({})",
                    slots,
                    self.rules.len()
                );
            }
        }

        Ok(())
    }

    fn validate_upstream_config(&self) -> Result<()> {
        if self.upstream.retry_count == 0 {
            bail!("retry_count must be greater than 0");
        }

        if self.upstream.connect_timeout.is_zero() {
            bail!("connect_timeout must be greater than 0");
        }

        if self.upstream.retry_interval > Duration::from_secs(3600) {
            bail!("retry_interval cannot exceed 1 hour");
        }

        Ok(())
    }

    fn validate_rules(&self) -> Result<()> {
        if self.rules.len() > MAX_RULES {
            bail!("at most {} rules may be configured", MAX_RULES);
        }

        // Compiling the set reports the first bad pattern
        self.build_rule_set()?;
        Ok(())
    }

    fn validate_monitoring_config(&self) -> Result<()> {
        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.monitoring.log_level.as_str()) {
            bail!(
                "monitoring.log_level must be one of: {}",
                valid_log_levels.join(", ")
            );
        }

        Ok(())
    }

    /// Compile the configured rules and keywords into a rule set
    pub fn build_rule_set(&self) -> Result<HoldingRuleSet> {
        let slots = self.relay.rule_slots.unwrap_or(self.rules.len().max(1));
        let mut rule_set = HoldingRuleSet::with_slots(slots);

        for (index, rule) in self.rules.iter().enumerate() {
            rule_set
                .configure_rule(
                    index,
                    &rule.hold_keyword,
                    rule.release_type,
                    &rule.release_keyword,
                    rule.enabled,
                )
                .with_context(|| format!("Rule {} is invalid", index))?;
        }

        for keyword in &self.keywords {
            rule_set
                .register_keyword(keyword)
                .with_context(|| format!("Keyword '{}' is invalid", keyword))?;
        }

        Ok(rule_set)
    }

    /// Merge with CLI arguments
    pub fn merge_with_cli_args(&mut self, overrides: &CliOverrides) {
        if let Some(bind_str) = overrides.bind.as_deref() {
            if let Ok(addr) = bind_str.parse::<SocketAddr>() {
                self.relay.bind_addr = addr;
                tracing::info!("CLI override: bind address set to {}", addr);
            } else {
                tracing::warn!("Invalid bind address provided: {}", bind_str);
            }
        }

        if let Some(upstream_str) = overrides.upstream.as_deref() {
            if let Ok(addr) = upstream_str.parse::<SocketAddr>() {
                self.relay.upstream_addr = addr;
                tracing::info!("CLI override: upstream address set to {}", addr);
            } else {
                tracing::warn!("Invalid upstream address provided: {}", upstream_str);
            }
        }

        // A rule given on the command line takes the first slot
        if let Some(hold) = overrides.hold.as_deref() {
            let rule = super::RuleConfig {
                hold_keyword: hold.to_string(),
                release_type: overrides.release_type.unwrap_or_default(),
                release_keyword: overrides.release_keyword.clone().unwrap_or_default(),
                enabled: true,
            };
            tracing::info!(
                "CLI override: rule 0 holds '{}' (release: {})",
                rule.hold_keyword,
                rule.release_type
            );
            if self.rules.is_empty() {
                self.rules.push(rule);
            } else {
                self.rules[0] = rule;
            }
        }

        if !overrides.keywords.is_empty() {
            tracing::info!("CLI override: {} hold keyword(s) registered", overrides.keywords.len());
            self.keywords.extend(overrides.keywords.iter().cloned());
        }

        if overrides.only_held {
            self.relay.only_held_output = true;
            tracing::info!("CLI override: only held packets are reported");
        }

        if let Some(retry_count) = overrides.retry_count {
            self.upstream.retry_count = retry_count;
            tracing::info!("CLI override: retry count set to {}", retry_count);
        }

        if let Some(retry_interval) = overrides.retry_interval {
            self.upstream.retry_interval = retry_interval;
            tracing::info!("CLI override: retry interval set to {:?}", retry_interval);
        }

        if let Some(log_level) = overrides.log_level.as_deref() {
            self.monitoring.log_level = log_level.to_string();
        }

        if overrides.no_management {
            self.monitoring.management_api.enabled = false;
            tracing::info!("CLI override: management API disabled");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuleConfig;
    use std::io::Write;
    use tempfile::Builder;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.upstream.retry_count, 100);
        assert_eq!(config.upstream.retry_interval, Duration::from_secs(3));
    }

    #[test]
    fn test_load_toml_file() {
        let mut file = Builder::new().suffix(".toml").tempfile().unwrap();
        write!(
            file,
            r#"
keywords = ["secret"]

[relay]
bind_addr = "127.0.0.1:16001"
upstream_addr = "127.0.0.1:6001"
only_held_output = true

[upstream]
retry_count = 5
retry_interval = "250ms"
connect_timeout = "2s"

[[rules]]
hold_keyword = "333"
release_type = "from_client"
release_keyword = "222"

[monitoring]
log_level = "debug"
"#
        )
        .unwrap();

        let config = ConfigManager::load_from_file(file.path()).unwrap();
        assert_eq!(config.relay.bind_addr.port(), 16001);
        assert!(config.relay.only_held_output);
        assert_eq!(config.upstream.retry_count, 5);
        assert_eq!(config.upstream.retry_interval, Duration::from_millis(250));
        assert_eq!(config.rules.len(), 1);
        assert_eq!(config.rules[0].release_type, ReleaseType::FromClient);
        assert!(config.rules[0].enabled);
        assert_eq!(config.keywords, vec!["secret".to_string()]);

        let rules = config.build_rule_set().unwrap();
        assert_eq!(rules.slot_count(), 1);
        assert_eq!(rules.infos().len(), 2);
    }

    #[test]
    fn test_load_yaml_file() {
        let mut file = Builder::new().suffix(".yaml").tempfile().unwrap();
        write!(
            file,
            r#"
relay:
  bind_addr: "127.0.0.1:16002"
  upstream_addr: "127.0.0.1:6002"
rules:
  - hold_keyword: "^LOGIN"
    release_type: from_server
    release_keyword: "OK"
"#
        )
        .unwrap();

        let config = ConfigManager::load_from_file(file.path()).unwrap();
        assert_eq!(config.relay.upstream_addr.port(), 6002);
        assert_eq!(config.rules[0].release_type, ReleaseType::FromServer);
        assert_eq!(config.upstream, crate::config::UpstreamConfig::default());
    }

    #[test]
    fn test_overlay_merges_tables_and_replaces_arrays() {
        let mut base: toml::Value = toml::from_str(
            r#"
keywords = ["a", "b"]

[upstream]
retry_count = 7
retry_interval = "3s"
"#,
        )
        .unwrap();
        let layer: toml::Value = toml::from_str(
            r#"
keywords = ["c"]

[upstream]
retry_interval = "250ms"
"#,
        )
        .unwrap();

        overlay(&mut base, layer);
        assert_eq!(base["upstream"]["retry_count"].as_integer(), Some(7));
        assert_eq!(base["upstream"]["retry_interval"].as_str(), Some("250ms"));
        assert_eq!(base["keywords"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn test_layered_load_accepts_partial_file() {
        let mut file = Builder::new().suffix(".toml").tempfile().unwrap();
        write!(
            file,
            r#"
[upstream]
retry_count = 2
"#
        )
        .unwrap();

        let config = ConfigManager::load(file.path()).unwrap();
        assert_eq!(config.upstream.retry_count, 2);
        assert_eq!(config.upstream.connect_timeout, crate::config::DEFAULT_CONNECT_TIMEOUT);
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let config = ConfigManager::load_from_file(Path::new("/nonexistent/packetholder.toml"))
            .unwrap();
        assert_eq!(config.relay.bind_addr, Config::default().relay.bind_addr);
    }

    #[test]
    fn test_invalid_pattern_fails_validation() {
        let mut config = Config::default();
        config.rules.push(RuleConfig {
            hold_keyword: "(".to_string(),
            release_type: ReleaseType::None,
            release_keyword: String::new(),
            enabled: true,
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_retry_count_rejected() {
        let mut config = Config::default();
        config.upstream.retry_count = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rule_slots_must_cover_rules() {
        let mut config = Config::default();
        config.rules = vec![
            RuleConfig {
                hold_keyword: "a".to_string(),
                release_type: ReleaseType::None,
                release_keyword: String::new(),
                enabled: true,
            };
            2
        ];
        config.relay.rule_slots = Some(1);
        assert!(config.validate().is_err());

        config.relay.rule_slots = Some(4);
        assert_eq!(config.build_rule_set().unwrap().slot_count(), 4);
    }

    #[test]
    fn test_cli_overrides() {
        let mut config = Config::default();
        config.merge_with_cli_args(&CliOverrides {
            bind: Some("127.0.0.1:17000".to_string()),
            upstream: Some("not-an-address".to_string()),
            hold: Some("333".to_string()),
            release_type: Some(ReleaseType::FromClient),
            release_keyword: Some("222".to_string()),
            keywords: vec!["k1".to_string()],
            only_held: true,
            retry_count: Some(3),
            retry_interval: Some(Duration::ZERO),
            log_level: Some("debug".to_string()),
            no_management: true,
        });

        assert_eq!(config.relay.bind_addr.port(), 17000);
        // Invalid override is ignored
        assert_eq!(config.relay.upstream_addr, Config::default().relay.upstream_addr);
        assert_eq!(config.rules[0].hold_keyword, "333");
        assert_eq!(config.rules[0].release_keyword, "222");
        assert_eq!(config.keywords, vec!["k1".to_string()]);
        assert!(config.relay.only_held_output);
        assert_eq!(config.upstream.retry_count, 3);
        assert_eq!(config.upstream.retry_interval, Duration::ZERO);
        assert!(!config.monitoring.management_api.enabled);
        assert!(config.validate().is_ok());
    }
}
