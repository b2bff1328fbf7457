//! Error types for the workflow controller and executor

use thiserror::Error;

/// Exit code used when the executor fails before running user code
pub const SETUP_ERROR_EXIT_CODE: i32 = 64;

/// Main error type
#[derive(Error, Debug)]
pub enum WfError {
    /// User-supplied configuration is invalid
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("not implemented: {0}")]
    NotImplemented(String),

    /// Retriable failure
    #[error("transient error: {0}")]
    Transient(String),

    #[error("internal error: {0}")]
    Internal(String),

    /// A user process exited with this code
    #[error("exit status {0}")]
    Exited(i32),

    /// Stale resource version on update
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("shutdown error: {0}")]
    ShutdownError(String),

    /// A container this one depends on did not succeed
    #[error("dependency failed: {0}")]
    DependencyFailed(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    YamlError(#[from] serde_yaml::Error),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),
}

impl From<anyhow::Error> for WfError {
    fn from(err: anyhow::Error) -> Self {
        WfError::Internal(err.to_string())
    }
}

impl From<tonic::Status> for WfError {
    fn from(status: tonic::Status) -> Self {
        match status.code() {
            tonic::Code::NotFound => WfError::NotFound(status.message().to_string()),
            tonic::Code::InvalidArgument => WfError::BadRequest(status.message().to_string()),
            tonic::Code::Unimplemented => WfError::NotImplemented(status.message().to_string()),
            tonic::Code::Unavailable
            | tonic::Code::DeadlineExceeded
            | tonic::Code::ResourceExhausted
            | tonic::Code::Aborted => WfError::Transient(status.message().to_string()),
            _ => WfError::Internal(status.to_string()),
        }
    }
}

impl From<workflow_api::yaml::ManifestError> for WfError {
    fn from(err: workflow_api::yaml::ManifestError) -> Self {
        WfError::BadRequest(err.to_string())
    }
}

impl WfError {
    /// Whether retrying the operation may succeed
    pub fn is_transient(&self) -> bool {
        match self {
            WfError::Transient(_) | WfError::Conflict(_) => true,
            WfError::IoError(e) => matches!(
                e.kind(),
                std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionRefused
                    | std::io::ErrorKind::ConnectionAborted
            ),
            WfError::HttpError(e) => {
                e.is_timeout()
                    || e.is_connect()
                    || e.status().map(|s| s.is_server_error() || s.as_u16() == 429).unwrap_or(false)
            }
            _ => false,
        }
    }

    pub fn is_not_found(&self) -> bool {
        match self {
            WfError::NotFound(_) => true,
            WfError::IoError(e) => e.kind() == std::io::ErrorKind::NotFound,
            WfError::HttpError(e) => e.status().map(|s| s.as_u16() == 404).unwrap_or(false),
            _ => false,
        }
    }

    pub fn is_conflict(&self) -> bool {
        match self {
            WfError::Conflict(_) => true,
            WfError::HttpError(e) => e.status().map(|s| s.as_u16() == 409).unwrap_or(false),
            _ => false,
        }
    }

    /// Message without the kind prefix, as shown on nodes
    pub fn message(&self) -> String {
        match self {
            WfError::BadRequest(m)
            | WfError::NotFound(m)
            | WfError::NotImplemented(m)
            | WfError::Transient(m)
            | WfError::Internal(m)
            | WfError::Conflict(m)
            | WfError::ShutdownError(m)
            | WfError::DependencyFailed(m) => m.clone(),
            other => other.to_string(),
        }
    }

    /// Process exit code the executor reports for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            WfError::Exited(code) => *code,
            _ => SETUP_ERROR_EXIT_CODE,
        }
    }
}
