//! JSON bodies exchanged over `POST /run` and `GET /health`

use serde::{Deserialize, Serialize};

/// Body of `POST /run`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunRequest {
    /// Source text; only read when no session id is supplied
    #[serde(default)]
    pub code: String,
    /// One line of input for a running session, without the trailing newline
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<String>,
    /// Session to continue
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_id: Option<String>,
}

impl RunRequest {
    pub fn new(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            ..Self::default()
        }
    }

    pub fn resume(container_id: impl Into<String>, input: impl Into<String>) -> Self {
        Self {
            code: String::new(),
            input: Some(input.into()),
            container_id: Some(container_id.into()),
        }
    }
}

/// Successful reply to `POST /run`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunResponse {
    /// Text the program produced during this request only
    pub output: String,
    pub requires_input: bool,
    /// Present while the session is still live
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_id: Option<String>,
}

/// Error body for every non-2xx reply
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub active_sessions: usize,
}
