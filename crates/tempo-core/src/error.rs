//! Engine error types.

use std::time::Duration;

use tempo_storage::StoreError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, EngineError>;

/// Failure of a single window or idle query
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProbeError {
    /// The platform (or a helper binary) cannot answer this query at all
    #[error("probe unavailable: {0}")]
    Unavailable(String),

    #[error("probe timed out after {0:?}")]
    Timeout(Duration),

    /// Transient failure, e.g. no focused window or unparsable output
    #[error("probe failed: {0}")]
    Failed(String),
}

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("probe unavailable: {0}")]
    ProbeUnavailable(String),

    #[error("probe timed out after {0:?}")]
    ProbeTimeout(Duration),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("task failed: {0}")]
    TaskFailed(String),
}

impl From<ProbeError> for EngineError {
    fn from(err: ProbeError) -> Self {
        match err {
            ProbeError::Unavailable(reason) => Self::ProbeUnavailable(reason),
            ProbeError::Timeout(after) => Self::ProbeTimeout(after),
            ProbeError::Failed(reason) => Self::TaskFailed(format!("probe failed: {reason}")),
        }
    }
}

impl From<tokio::task::JoinError> for EngineError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::TaskFailed(err.to_string())
    }
}
