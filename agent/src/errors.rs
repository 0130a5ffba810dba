//! Error types for study deployments

use thiserror::Error;

/// Main error type shared by the deployment host and the device agent
#[derive(Error, Debug)]
pub enum DeploymentError {
    /// The request can never succeed as sent: unknown deployment or role,
    /// duplicate identifiers, malformed registrations or data.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The request is valid but the current state does not allow it.
    /// Retrying after refreshing state may succeed.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// This device cannot execute the deployment it was handed.
    #[error("Unsupported capability on device '{device_role}': {requirement}")]
    UnsupportedCapability {
        device_role: String,
        requirement: String,
    },

    /// The study deployment was stopped; nothing can change anymore.
    #[error("Study deployment stopped: {0}")]
    Stopped(String),

    /// The deployment host answered with something it should never return.
    #[error("Inconsistent deployment: {0}")]
    Inconsistent(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("Server error: {0}")]
    ServerError(String),

    #[error("Shutdown error: {0}")]
    ShutdownError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl DeploymentError {
    /// Stable name of the error category, used on the wire
    pub fn kind(&self) -> &'static str {
        match self {
            DeploymentError::InvalidArgument(_) => "invalid_argument",
            DeploymentError::InvalidState(_) => "invalid_state",
            DeploymentError::UnsupportedCapability { .. } => "unsupported_capability",
            DeploymentError::Stopped(_) => "stopped",
            DeploymentError::Inconsistent(_) => "inconsistent",
            DeploymentError::IoError(_)
            | DeploymentError::JsonError(_)
            | DeploymentError::StorageError(_) => "storage",
            DeploymentError::HttpError(_) => "transport",
            DeploymentError::ServerError(_)
            | DeploymentError::ShutdownError(_)
            | DeploymentError::ConfigError(_)
            | DeploymentError::Internal(_) => "internal",
        }
    }

    /// Message without the category prefix, as sent over the wire
    pub fn detail(&self) -> String {
        match self {
            DeploymentError::InvalidArgument(message)
            | DeploymentError::InvalidState(message)
            | DeploymentError::Stopped(message)
            | DeploymentError::Inconsistent(message)
            | DeploymentError::StorageError(message) => message.clone(),
            other => other.to_string(),
        }
    }

    /// Rebuild an error from its wire category and message
    pub fn from_kind(kind: &str, message: String) -> Self {
        match kind {
            "invalid_argument" => DeploymentError::InvalidArgument(message),
            "invalid_state" => DeploymentError::InvalidState(message),
            "unsupported_capability" => DeploymentError::UnsupportedCapability {
                device_role: String::new(),
                requirement: message,
            },
            "stopped" => DeploymentError::Stopped(message),
            "inconsistent" => DeploymentError::Inconsistent(message),
            "storage" => DeploymentError::StorageError(message),
            _ => DeploymentError::ServerError(message),
        }
    }

    /// Whether the same call may succeed later without operator intervention
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DeploymentError::InvalidState(_)
                | DeploymentError::HttpError(_)
                | DeploymentError::IoError(_)
                | DeploymentError::ServerError(_)
        )
    }
}

impl From<anyhow::Error> for DeploymentError {
    fn from(err: anyhow::Error) -> Self {
        DeploymentError::Internal(err.to_string())
    }
}
