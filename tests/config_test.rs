//! Configuration loading tests

use packetholder::config::{CliOverrides, ConfigManager};
use packetholder::holding::ReleaseType;
use packetholder::{PacketHolder, RetryPolicy};
use std::io::Write;
use std::time::Duration;
use tempfile::Builder;

#[test]
fn test_yaml_config_builds_holder() {
    let mut file = Builder::new().suffix(".yaml").tempfile().unwrap();
    write!(
        file,
        r#"
relay:
  bind_addr: "127.0.0.1:17000"
  upstream_addr: "127.0.0.1:7000"
  only_held_output: true
  rule_slots: 3
upstream:
  retry_count: 5
  retry_interval: 250ms
  connect_timeout: 1s
rules:
  - hold_keyword: "333"
    release_type: from_client
    release_keyword: "222"
  - hold_keyword: "^LOGIN"
    enabled: false
keywords:
  - secret
"#
    )
    .unwrap();

    let config = ConfigManager::load_from_file(file.path()).unwrap();
    assert_eq!(config.relay.bind_addr.port(), 17000);
    assert_eq!(config.upstream.retry_interval, Duration::from_millis(250));

    let holder = PacketHolder::from_config(&config).unwrap();
    let rules = holder.rules();
    assert_eq!(rules.len(), 4);
    assert_eq!(rules[0].release_type, ReleaseType::FromClient);
    assert!(!rules[1].enabled);
    assert!(!rules[2].enabled);
    assert_eq!(rules[3].hold_keyword, "secret");
    assert!(holder.status().only_held);
    assert_eq!(
        holder.retry_policy(),
        RetryPolicy {
            retry_count: 5,
            retry_interval: Duration::from_millis(250),
            connect_timeout: Duration::from_secs(1),
            retry_on_refused: false,
        }
    );
}

#[test]
fn test_invalid_pattern_rejected_at_load() {
    let mut file = Builder::new().suffix(".toml").tempfile().unwrap();
    write!(
        file,
        r#"
[relay]
bind_addr = "127.0.0.1:17001"
upstream_addr = "127.0.0.1:7001"

[[rules]]
hold_keyword = "(unclosed"
"#
    )
    .unwrap();

    let err = ConfigManager::load_from_file(file.path()).unwrap_err();
    assert!(format!("{:#}", err).contains("(unclosed"));
}

#[test]
fn test_cli_rule_takes_first_slot() {
    let mut config = packetholder::Config::default();
    config.merge_with_cli_args(&CliOverrides {
        hold: Some("PING".to_string()),
        release_type: Some(ReleaseType::FromServer),
        release_keyword: Some("PONG".to_string()),
        keywords: vec!["token".to_string()],
        ..Default::default()
    });
    config.validate().unwrap();

    let holder = PacketHolder::from_config(&config).unwrap();
    let rules = holder.rules();
    assert_eq!(rules.len(), 2);
    assert_eq!(rules[0].hold_keyword, "PING");
    assert_eq!(rules[0].release_type, ReleaseType::FromServer);
    assert_eq!(rules[1].hold_keyword, "token");
}

// The only test in this binary that touches the environment
#[test]
fn test_environment_fills_keys_the_file_omits() {
    std::env::set_var("PACKETHOLDER_RETRY_COUNT", "7");
    std::env::set_var("PACKETHOLDER_LOG_LEVEL", "debug");

    let mut file = Builder::new().suffix(".toml").tempfile().unwrap();
    write!(
        file,
        r#"
[relay]
bind_addr = "127.0.0.1:17002"
upstream_addr = "127.0.0.1:7002"

[monitoring]
log_level = "warn"
"#
    )
    .unwrap();

    let layered = ConfigManager::load(file.path());
    let env_only = ConfigManager::load_from_env();
    let missing_file = ConfigManager::load(std::path::Path::new("/nonexistent/packetholder.toml"));
    std::env::remove_var("PACKETHOLDER_RETRY_COUNT");
    std::env::remove_var("PACKETHOLDER_LOG_LEVEL");

    let layered = layered.unwrap();
    assert_eq!(layered.relay.bind_addr.port(), 17002);
    // Omitted by the file, so the environment applies
    assert_eq!(layered.upstream.retry_count, 7);
    // Set by the file, so it wins over the environment
    assert_eq!(layered.monitoring.log_level, "warn");

    let env_only = env_only.unwrap();
    assert_eq!(env_only.upstream.retry_count, 7);
    assert_eq!(env_only.monitoring.log_level, "debug");

    assert_eq!(missing_file.unwrap().upstream.retry_count, 7);
}
