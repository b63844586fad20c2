// src/error.rs
use crate::ami::DisconnectReason;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AmiError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Connect to {host}:{port} timed out after {timeout_ms}ms")]
    ConnectTimeout {
        host: String,
        port: u16,
        timeout_ms: u64,
    },

    #[error("Connection not ready (status: {0})")]
    NotReady(String),

    #[error("Authentication failed: {0}")]
    AuthFailed(String),

    #[error("Action {action} timed out after {timeout_ms}ms")]
    ActionTimeout { action: String, timeout_ms: u64 },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Disconnected: {0}")]
    Disconnected(DisconnectReason),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Task queue error: {0}")]
    Queue(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type AmiResult<T> = Result<T, AmiError>;

impl AmiError {
    pub fn error_code(&self) -> &'static str {
        match self {
            AmiError::Connection(_) => "connection_error",
            AmiError::ConnectTimeout { .. } => "connect_timeout",
            AmiError::NotReady(_) => "not_ready",
            AmiError::AuthFailed(_) => "auth_failed",
            AmiError::ActionTimeout { .. } => "action_timeout",
            AmiError::Protocol(_) => "protocol_error",
            AmiError::Disconnected(_) => "disconnected",
            AmiError::Validation(_) => "validation_error",
            AmiError::Io(_) => "io_error",
            AmiError::Config(_) => "config_error",
            AmiError::Queue(_) => "queue_error",
            AmiError::Serialization(_) => "serialization_error",
        }
    }

    /// True when the switch could not be reached or stopped answering, as
    /// opposed to bad input or a well-formed rejection.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            AmiError::Connection(_)
                | AmiError::ConnectTimeout { .. }
                | AmiError::NotReady(_)
                | AmiError::AuthFailed(_)
                | AmiError::ActionTimeout { .. }
                | AmiError::Disconnected(_)
                | AmiError::Io(_)
        )
    }

    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            AmiError::ActionTimeout { .. } | AmiError::ConnectTimeout { .. }
        )
    }
}

impl From<config::ConfigError> for AmiError {
    fn from(err: config::ConfigError) -> Self {
        AmiError::Config(err.to_string())
    }
}

impl From<validator::ValidationErrors> for AmiError {
    fn from(err: validator::ValidationErrors) -> Self {
        AmiError::Config(err.to_string())
    }
}

impl From<reqwest::Error> for AmiError {
    fn from(err: reqwest::Error) -> Self {
        AmiError::Queue(err.to_string())
    }
}
