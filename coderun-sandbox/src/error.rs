use crate::session::SessionId;
use thiserror::Error;

/// Failures at the sandbox engine boundary
#[derive(Error, Debug)]
pub enum SandboxError {
    #[error("{op} failed for sandbox {sandbox}: {message}")]
    Operation {
        op: &'static str,
        sandbox: String,
        message: String,
    },

    #[error("Sandbox {0} not found")]
    NotFound(String),

    #[error("Sandbox {0} already has an output subscriber")]
    AlreadyAttached(String),

    #[error("Engine does not support {0}")]
    Unsupported(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SandboxError {
    pub fn operation(op: &'static str, sandbox: impl Into<String>, message: impl ToString) -> Self {
        Self::Operation {
            op,
            sandbox: sandbox.into(),
            message: message.to_string(),
        }
    }
}

/// Failures surfaced to a run/continue caller
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Session {0} not found or not ready")]
    SessionNotFound(String),

    #[error("Input stream of session {0} is not writable")]
    StreamNotWritable(SessionId),

    #[error("Sandbox operation failed: {0}")]
    Sandbox(#[from] SandboxError),

    #[error("Output stream of session {session} failed: {message}")]
    StreamFault { session: SessionId, message: String },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Session {0} is already registered")]
    DuplicateSession(SessionId),
}

impl SessionError {
    /// Whether the caller is at fault rather than the engine
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            SessionError::SessionNotFound(_) | SessionError::InvalidRequest(_)
        )
    }
}

pub type SandboxResult<T> = Result<T, SandboxError>;
pub type SessionResult<T> = Result<T, SessionError>;
