//! Configuration loading from TOML files

use assert_matches::assert_matches;
use coderun_common::{AppConfig, ConfigError, EngineKind};
use coderun_sandbox::ResourceLimits;
use std::io::Write;
use std::time::Duration;

fn write_config(content: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().expect("Failed to create temp file");
    file.write_all(content.as_bytes()).expect("Failed to write config");
    file
}

#[test]
fn test_file_overrides_defaults() {
    let file = write_config(
        r#"
[server]
port = 8081
allowed_origins = ["https://play.example.org"]

[sandbox]
engine = "process"
image = "python:3.12-slim"

[sandbox.limits]
memory_bytes = 268435456
cpu_percent = 25
execution_timeout = "30s"

[session]
initial_output_window = "2s"
idle_timeout = "15m"

[detector]
input_markers = [">>> "]
"#,
    );

    let config = AppConfig::from_file(file.path()).unwrap();
    assert_eq!(config.server.port, 8081);
    assert_eq!(config.server.host, "0.0.0.0");
    assert_eq!(config.sandbox.engine, EngineKind::Process);
    assert_eq!(config.session.initial_output_window, Duration::from_secs(2));
    assert_eq!(config.session.continue_output_window, Duration::from_secs(1));
    assert_eq!(config.session.idle_timeout, Duration::from_secs(15 * 60));
    assert_eq!(config.detector.input_markers, vec![">>> "]);
    assert!(config.detector.completion_markers.contains(&"Result:".to_string()));
    config.validate().unwrap();

    let limits = ResourceLimits::from_config(&config.sandbox.limits);
    assert_eq!(limits.memory_bytes, 256 * 1024 * 1024);
    assert_eq!(limits.memory_swap_bytes, limits.memory_bytes);
    assert_eq!(limits.cpu_quota_us, 25_000);
    assert_eq!(limits.max_duration, Some(Duration::from_secs(30)));
}

#[test]
fn test_zero_timeout_disables_limit() {
    let file = write_config("[sandbox.limits]\nexecution_timeout = \"0s\"\n");
    let config = AppConfig::from_file(file.path()).unwrap();
    assert_eq!(
        ResourceLimits::from_config(&config.sandbox.limits).max_duration,
        None
    );
}

#[test]
fn test_malformed_file_is_parse_error() {
    let file = write_config("[server\nport = ");
    assert_matches!(
        AppConfig::from_file(file.path()),
        Err(ConfigError::Parse(_))
    );
}

#[test]
fn test_missing_file_is_read_error() {
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("absent.toml");
    assert_matches!(
        AppConfig::from_file(&missing),
        Err(ConfigError::Read { .. })
    );
}

#[test]
fn test_environment_overrides() {
    let mut config = AppConfig::default();
    config
        .apply_overrides(|key| match key {
            "PORT" => Some("9000".to_string()),
            "CODERUN_ENGINE" => Some("process".to_string()),
            _ => None,
        })
        .unwrap();
    assert_eq!(config.server.port, 9000);
    assert_eq!(config.sandbox.engine, EngineKind::Process);
    assert_eq!(config.sandbox.image, "python:3.9-slim");
}
