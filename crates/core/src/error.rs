// Central Error Type for the Application

use thiserror::Error;

use crate::domain::PoolError;

/// Application-level error type
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Domain error: {0}")]
    Domain(#[from] crate::domain::DomainError),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Pool busy: {0}")]
    PoolBusy(String),

    /// The job store can no longer be trusted (poisoned lock, lost table).
    /// Fatal to the scheduler loop.
    #[error("Job store fault: {0}")]
    StoreFault(String),

    /// The device pool can no longer be trusted. Fatal to the scheduler loop.
    #[error("Device pool fault: {0}")]
    PoolFault(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Faults that invalidate scheduler state as a whole rather than one job
    pub fn is_fatal(&self) -> bool {
        matches!(self, AppError::StoreFault(_) | AppError::PoolFault(_))
    }
}

impl From<PoolError> for AppError {
    fn from(err: PoolError) -> Self {
        match err {
            PoolError::Busy { .. } => AppError::PoolBusy(err.to_string()),
            PoolError::Poisoned => AppError::PoolFault(err.to_string()),
        }
    }
}

/// Result type alias using AppError
pub type Result<T> = std::result::Result<T, AppError>;
