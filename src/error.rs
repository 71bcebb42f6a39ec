//! Errors surfaced by the job control surface.

use thiserror::Error;

use crate::models::JobState;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("job not found: {0}")]
    JobNotFound(String),

    #[error("job {0} has no step awaiting approval")]
    NoWaitingStep(String),

    #[error("job {id} is already {state}")]
    JobTerminal { id: String, state: JobState },

    #[error("{0}")]
    InvalidRequest(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl EngineError {
    /// Stable machine-readable code used by the HTTP error contract.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::JobNotFound(_) => "not_found",
            EngineError::NoWaitingStep(_) | EngineError::JobTerminal { .. } => "conflict",
            EngineError::InvalidRequest(_) => "bad_request",
            EngineError::Internal(_) => "internal",
        }
    }
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;
