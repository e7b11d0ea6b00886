//! Configuration management for coderun

use crate::error::{ConfigError, ConfigResult};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Environment variable carrying the caller's source code into the sandbox.
pub const SOURCE_ENV_VAR: &str = "CODERUN_SOURCE";

/// Application configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// HTTP listener configuration
    pub server: ServerConfig,
    /// Sandbox engine and resource limits
    pub sandbox: SandboxConfig,
    /// Session timing and buffering
    pub session: SessionConfig,
    /// Prompt marker lists
    pub detector: DetectorConfig,
}

/// HTTP listener configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Origins allowed to call the API from a browser
    pub allowed_origins: Vec<String>,
    /// Optional log file written alongside stderr
    pub log_file: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3001,
            allowed_origins: vec!["http://localhost:3000".to_string()],
            log_file: None,
        }
    }
}

impl ServerConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Which sandbox engine backs the sessions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    /// Container runtime reached through the local Docker socket
    Docker,
    /// Plain child process on the host (development only)
    Process,
}

impl FromStr for EngineKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "docker" => Ok(EngineKind::Docker),
            "process" => Ok(EngineKind::Process),
            other => Err(ConfigError::Invalid(format!(
                "unknown engine '{}', expected docker or process",
                other
            ))),
        }
    }
}

/// Sandbox configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    pub engine: EngineKind,
    /// Base image every sandbox is created from
    pub image: String,
    /// Command run inside the sandbox. The code is read from `CODERUN_SOURCE`.
    pub command: Vec<String>,
    /// Extra `KEY=VALUE` pairs set in the sandbox environment
    pub env: Vec<String>,
    /// Prefix for sandbox names, followed by the session id
    pub name_prefix: String,
    /// Largest accepted source text in bytes
    pub max_code_bytes: usize,
    pub limits: LimitsConfig,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            engine: EngineKind::Docker,
            image: "python:3.9-slim".to_string(),
            command: vec![
                "python".to_string(),
                "-u".to_string(),
                "-c".to_string(),
                format!(
                    "import os;exec(compile(os.environ['{}'],'<main>','exec'))",
                    SOURCE_ENV_VAR
                ),
            ],
            env: vec!["PYTHONUNBUFFERED=1".to_string()],
            name_prefix: "code-runner-".to_string(),
            max_code_bytes: 64 * 1024,
            limits: LimitsConfig::default(),
        }
    }
}

/// Resource limits applied to every sandbox
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Memory ceiling in bytes; swap is capped at the same value
    pub memory_bytes: u64,
    /// CPU share as a percentage of one core
    pub cpu_percent: u32,
    /// CFS scheduling period in microseconds
    pub cpu_period_us: u64,
    /// Hard wall-clock limit per session, `0s` disables it
    #[serde(with = "humantime_serde")]
    pub execution_timeout: Duration,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            memory_bytes: 100 * 1024 * 1024,
            cpu_percent: 50,
            cpu_period_us: 100_000,
            execution_timeout: Duration::from_secs(5 * 60),
        }
    }
}

/// Session timing configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// How long the first request collects output
    #[serde(with = "humantime_serde")]
    pub initial_output_window: Duration,
    /// How long a continuation request collects output
    #[serde(with = "humantime_serde")]
    pub continue_output_window: Duration,
    /// Sessions without activity for longer than this are reaped
    #[serde(with = "humantime_serde")]
    pub idle_timeout: Duration,
    /// Period of the idle sweep
    #[serde(with = "humantime_serde")]
    pub reap_interval: Duration,
    /// Stop grace period after the program ends or fails
    #[serde(with = "humantime_serde")]
    pub stop_grace: Duration,
    /// Stop grace period used by the idle sweep
    #[serde(with = "humantime_serde")]
    pub reap_stop_grace: Duration,
    /// Output bytes buffered between requests before chunks are dropped
    pub max_buffered_output: usize,
    /// Largest frame payload accepted before the stream is treated as raw
    pub max_frame_len: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            initial_output_window: Duration::from_millis(1500),
            continue_output_window: Duration::from_secs(1),
            idle_timeout: Duration::from_secs(10 * 60),
            reap_interval: Duration::from_secs(5 * 60),
            stop_grace: Duration::from_secs(1),
            reap_stop_grace: Duration::from_secs(5),
            max_buffered_output: 1024 * 1024,
            max_frame_len: 16 * 1024 * 1024,
        }
    }
}

/// Marker substrings scanned in program output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    /// The program is blocked waiting for a line of input
    pub input_markers: Vec<String>,
    /// The program produced a result or failed; collection may stop early
    pub completion_markers: Vec<String>,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            input_markers: vec![
                "Enter first number:".to_string(),
                "Enter second number:".to_string(),
                "Enter operation".to_string(),
            ],
            completion_markers: vec![
                "Result:".to_string(),
                "Error:".to_string(),
                "finished".to_string(),
            ],
        }
    }
}

impl AppConfig {
    /// Load configuration from an optional TOML file, then apply environment overrides.
    pub fn load(path: Option<&Path>) -> ConfigResult<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML configuration file
    pub fn from_file(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> ConfigResult<Self> {
        toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Apply `PORT`, `CODERUN_ENGINE` and `CODERUN_IMAGE` overrides.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> ConfigResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(port) = lookup("PORT") {
            self.server.port = port
                .trim()
                .parse()
                .map_err(|_| ConfigError::Invalid(format!("PORT '{}' is not a port", port)))?;
        }
        if let Some(engine) = lookup("CODERUN_ENGINE") {
            self.sandbox.engine = engine.parse()?;
        }
        if let Some(image) = lookup("CODERUN_IMAGE") {
            self.sandbox.image = image;
        }
        Ok(())
    }

    /// Reject configurations the session layer cannot run with
    pub fn validate(&self) -> ConfigResult<()> {
        if self.sandbox.command.is_empty() {
            return Err(ConfigError::Invalid("sandbox.command is empty".to_string()));
        }
        if self.sandbox.image.trim().is_empty() {
            return Err(ConfigError::Invalid("sandbox.image is empty".to_string()));
        }
        if self.sandbox.limits.cpu_percent == 0 || self.sandbox.limits.cpu_period_us == 0 {
            return Err(ConfigError::Invalid(
                "sandbox.limits cpu_percent and cpu_period_us must be positive".to_string(),
            ));
        }
        if self.session.initial_output_window.is_zero()
            || self.session.continue_output_window.is_zero()
        {
            return Err(ConfigError::Invalid(
                "session output windows must be positive".to_string(),
            ));
        }
        if self.session.reap_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "session.reap_interval must be positive".to_string(),
            ));
        }
        if self.detector.input_markers.iter().any(|m| m.is_empty())
            || self.detector.completion_markers.iter().any(|m| m.is_empty())
        {
            return Err(ConfigError::Invalid(
                "detector markers must not be empty strings".to_string(),
            ));
        }
        Ok(())
    }
}
