use thiserror::Error;

/// Error kinds surfaced by the core (admission, task execution, drivers).
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("admission denied: {0}")]
    AdmissionDenied(String),

    #[error("capacity unavailable: {0}")]
    CapacityUnavailable(String),

    #[error("backend error: {0}")]
    BackendError(String),

    #[error("state conflict: {0}")]
    StateConflict(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("cancelled")]
    Cancelled,

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<anyhow::Error> for CoreError {
    fn from(err: anyhow::Error) -> Self {
        CoreError::Internal(err.to_string())
    }
}

impl CoreError {
    /// True for errors that represent cooperative cancellation rather than failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, CoreError::Cancelled)
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;
