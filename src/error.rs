use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

use crate::domain::JobStatus;

#[derive(Debug, Error, Diagnostic)]
pub enum StagingError {
    #[error("invalid file id: {0}")]
    InvalidFileId(String),

    #[error("invalid request id: {0}")]
    InvalidRequestId(String),

    #[error("cache capacity exceeded: {required_kb} KB required, {available_kb} KB available")]
    #[diagnostic(help("free space by expiring jobs or raise max_cache_size_kb"))]
    CapacityExceeded { required_kb: u64, available_kb: i64 },

    #[error("retrieval failed: {0}")]
    RetrievalFailed(String),

    #[error("retrieval of {file_id} exhausted after {attempts} attempts")]
    RetrievalExhausted { file_id: String, attempts: u32 },

    #[error("inconsistent state: {0}")]
    InconsistentState(String),

    #[error("{0} files are generated by the packager and cannot be retrieved")]
    NotRetrievable(String),

    #[error("job not found: {0}")]
    JobNotFound(String),

    #[error("job already exists: {0}")]
    JobAlreadyExists(String),

    #[error("job {request_id} cannot move from {from} to {to}")]
    InvalidTransition {
        request_id: String,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("store error: {0}")]
    Store(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("failed to initialise logging: {0}")]
    Logging(String),
}

impl StagingError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StagingError::RetrievalFailed(_)
                | StagingError::InconsistentState(_)
                | StagingError::Filesystem(_)
        )
    }
}
