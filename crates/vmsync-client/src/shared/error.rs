use thiserror::Error;
use vmsync_core::{ActionKind, CoreError, ResourceId};

/// Errors raised by the synchronization core
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("Request cancelled")]
    Cancelled,
    #[error("Unexpected HTTP status {status}: {message}")]
    HttpStatus { status: u16, message: String },
    #[error("Decode error: {0}")]
    Decode(String),
    #[error("Action {action} already pending for resource {resource_id}")]
    ActionPending {
        resource_id: ResourceId,
        action: ActionKind,
    },
    #[error("Resource not found: {0}")]
    ResourceNotFound(ResourceId),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Storage error: {0}")]
    Storage(String),
    #[error("Task failed: {0}")]
    TaskFailed(String),
    #[error("Timeout: {0}")]
    Timeout(String),
    #[error(transparent)]
    Core(#[from] CoreError),
}

impl SyncError {
    /// Network-level failures that the next poll cycle is expected to outlive.
    pub fn is_transient(&self) -> bool {
        match self {
            SyncError::Transport(_) | SyncError::Timeout(_) => true,
            SyncError::HttpStatus { status, .. } => *status >= 500 || *status == 408 || *status == 429,
            _ => false,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, SyncError::Cancelled)
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            SyncError::Timeout(err.to_string())
        } else if err.is_decode() {
            SyncError::Decode(err.to_string())
        } else if let Some(status) = err.status() {
            SyncError::HttpStatus {
                status: status.as_u16(),
                message: err.to_string(),
            }
        } else {
            SyncError::Transport(err.to_string())
        }
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::Decode(err.to_string())
    }
}

impl From<SyncError> for vmsync_core::ErrorResponse {
    fn from(err: SyncError) -> Self {
        let code = match &err {
            SyncError::Transport(_) => "TRANSPORT_ERROR",
            SyncError::Cancelled => "CANCELLED",
            SyncError::HttpStatus { .. } => "HTTP_STATUS",
            SyncError::Decode(_) => "DECODE_ERROR",
            SyncError::ActionPending { .. } => "ACTION_PENDING",
            SyncError::ResourceNotFound(_) => "RESOURCE_NOT_FOUND",
            SyncError::Config(_) => "CONFIG_ERROR",
            SyncError::Storage(_) => "STORAGE_ERROR",
            SyncError::TaskFailed(_) => "TASK_FAILED",
            SyncError::Timeout(_) => "TIMEOUT",
            SyncError::Core(_) => "INVALID_DATA",
        };

        vmsync_core::ErrorResponse::new(code, err.to_string())
    }
}

pub type SyncResult<T> = std::result::Result<T, SyncError>;
