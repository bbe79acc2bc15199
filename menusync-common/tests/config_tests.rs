//! Configuration resolution tests
//!
//! Covers priority order (env over TOML over defaults), graceful handling of a
//! missing default file, and rejection of malformed input.
//!
//! Note: Uses serial_test to prevent environment variable races. Every test
//! that touches `MENUSYNC_*` variables is marked #[serial].

use menusync_common::config::{ClientConfig, StageTimeouts};
use menusync_common::{Backend, Error};
use serial_test::serial;
use std::env;
use std::io::Write;
use std::time::Duration;

const VARS: &[&str] = &[
    "MENUSYNC_BASE_URL",
    "MENUSYNC_API_VERSION",
    "MENUSYNC_STAGE4_TIMEOUT_MS",
    "MENUSYNC_RECONNECT_ATTEMPTS",
    "MENUSYNC_FALLBACK_ERROR_THRESHOLD",
    "MENUSYNC_DURABLE_ROLLOUT_PERCENT",
    "MENUSYNC_PRIMARY_BACKEND",
    "MENUSYNC_LOG_LEVEL",
];

fn clear_env() {
    for var in VARS {
        env::remove_var(var);
    }
}

fn write_toml(content: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(content.as_bytes()).unwrap();
    file
}

#[test]
#[serial]
fn test_toml_values_override_defaults() {
    clear_env();
    let file = write_toml(
        r#"
        base_url = "http://pipeline.local:9000"
        api_version = "v2"
        reconnect_attempts = 5
        primary_backend = "durable"

        [stage_timeouts]
        stage2_ms = 1000

        [logging]
        level = "debug"
        "#,
    );

    let config = ClientConfig::load(Some(file.path())).unwrap();
    assert_eq!(config.api_root(), "http://pipeline.local:9000/api/v2");
    assert_eq!(config.reconnect_attempts, 5);
    assert_eq!(config.primary_backend, Backend::Durable);
    assert_eq!(config.stage_timeouts.for_stage(2), Duration::from_secs(1));
    assert_eq!(config.stage_timeouts.for_stage(4), Duration::from_secs(300));
    assert_eq!(config.logging.level, "debug");
}

#[test]
#[serial]
fn test_env_overrides_toml() {
    clear_env();
    let file = write_toml(
        r#"
        fallback_error_threshold = 2
        durable_rollout_percent = 10
        "#,
    );
    env::set_var("MENUSYNC_FALLBACK_ERROR_THRESHOLD", "7");
    env::set_var("MENUSYNC_DURABLE_ROLLOUT_PERCENT", "25");
    env::set_var("MENUSYNC_STAGE4_TIMEOUT_MS", "4500");
    env::set_var("MENUSYNC_PRIMARY_BACKEND", "durable");

    let config = ClientConfig::load(Some(file.path())).unwrap();
    clear_env();

    assert_eq!(config.fallback_error_threshold, 7);
    assert_eq!(config.durable_rollout_percent, 25);
    assert_eq!(config.stage_timeouts.stage4_ms, 4500);
    assert_eq!(config.primary_backend, Backend::Durable);
}

#[test]
#[serial]
fn test_unparseable_env_is_ignored() {
    clear_env();
    env::set_var("MENUSYNC_RECONNECT_ATTEMPTS", "lots");

    let mut config = ClientConfig::default();
    config.apply_env();
    clear_env();

    assert_eq!(config.reconnect_attempts, 3);
}

#[test]
#[serial]
fn test_env_value_still_validated() {
    clear_env();
    env::set_var("MENUSYNC_BASE_URL", "localhost:8000");
    let file = write_toml("");

    let result = ClientConfig::load(Some(file.path()));
    clear_env();

    assert!(matches!(result, Err(Error::Config(_))));
}

#[test]
#[serial]
fn test_explicit_missing_file_is_error() {
    clear_env();
    let result = ClientConfig::load(Some(std::path::Path::new(
        "/nonexistent/menusync/config.toml",
    )));
    assert!(matches!(result, Err(Error::Config(_))));
}

#[test]
fn test_uniform_timeouts() {
    let t = StageTimeouts::uniform(250);
    for stage in 0..=6 {
        assert_eq!(t.for_stage(stage), Duration::from_millis(250));
    }
}
