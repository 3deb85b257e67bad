//! Unit tests for the config module
//!
//! Tests cover:
//! - Loading TOML from disk
//! - Defaults for omitted sections
//! - Validation failures and their exit codes

use std::io::Write;
use std::time::Duration;

use content_sync::channel::ReconnectPolicy;
use content_sync::config::Config;
use content_sync::errors::{get_exit_code, EXIT_CONFIG_ERROR};
use content_sync::reconcile::ReconcilerOptions;

fn write_config(contents: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file
}

#[test]
fn test_load_from_file() {
    let file = write_config(
        r#"
        endpoint = "https://cms.example.com"
        api_key = "secret"
        request_timeout_secs = 30

        [retry]
        max_retries = 5

        [reconnect]
        base_delay_ms = 500
        max_attempts = 8

        [logging]
        filter = "content_sync=info"
        json = true
        "#,
    );
    let config = Config::load(file.path().to_str()).unwrap();
    assert_eq!(config.endpoint, "https://cms.example.com");
    assert_eq!(config.api_key.as_deref(), Some("secret"));
    assert_eq!(config.retry.max_retries, 5);
    assert_eq!(config.retry.base_delay_ms, 500);
    assert!(config.logging.json);
    assert_eq!(
        config.channel_url().unwrap().as_str(),
        "wss://cms.example.com/ws"
    );

    let policy = ReconnectPolicy::from_settings(&config.reconnect);
    assert_eq!(policy.base_delay, Duration::from_millis(500));
    assert_eq!(policy.max_attempts, 8);

    let options = ReconcilerOptions::from_config(&config);
    assert_eq!(options.request_timeout, Some(Duration::from_secs(30)));
    assert_eq!(options.retry.max_retries, 5);
    assert_eq!(options.refetch_delay, Some(Duration::from_millis(1000)));
}

#[test]
fn test_empty_file_uses_defaults() {
    let file = write_config("");
    let config = Config::load(file.path().to_str()).unwrap();
    assert_eq!(config.reconnect.max_attempts, 5);
    assert_eq!(config.reconnect.max_delay_ms, 30000);
    assert_eq!(config.logging.filter, "warn");
}

#[test]
fn test_invalid_endpoint_maps_to_config_exit_code() {
    let file = write_config(r#"endpoint = "not a url""#);
    let err = Config::load(file.path().to_str()).unwrap_err();
    assert_eq!(get_exit_code(&err), EXIT_CONFIG_ERROR);
}

#[test]
fn test_zero_request_timeout_is_rejected() {
    let file = write_config("request_timeout_secs = 0\n");
    let err = Config::load(file.path().to_str()).unwrap_err();
    assert_eq!(get_exit_code(&err), EXIT_CONFIG_ERROR);
}

#[test]
fn test_malformed_toml_is_rejected() {
    let file = write_config("endpoint = ");
    assert!(Config::load(file.path().to_str()).is_err());
}

#[test]
fn test_disabled_refetch() {
    let file = write_config("[refetch]\nenabled = false\n");
    let config = Config::load(file.path().to_str()).unwrap();
    assert_eq!(ReconcilerOptions::from_config(&config).refetch_delay, None);
}
