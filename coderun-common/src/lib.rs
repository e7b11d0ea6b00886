//! Shared configuration and wire types for coderun

pub mod config;
pub mod error;
pub mod protocol;

pub use config::{
    AppConfig, DetectorConfig, EngineKind, LimitsConfig, SandboxConfig, ServerConfig,
    SessionConfig, SOURCE_ENV_VAR,
};
pub use error::{ConfigError, ConfigResult};
pub use protocol::{ErrorResponse, HealthResponse, RunRequest, RunResponse};
