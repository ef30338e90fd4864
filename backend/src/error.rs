use thiserror::Error;

/// Typed failure returned by every engine operation.
///
/// Validation, not-found, and conflict cases are detected before a
/// transaction is opened; persistence failures inside a transaction roll
/// the whole unit of work back.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The entity does not exist, or does not belong to the requesting
    /// user. Ownership failures are folded in so existence never leaks.
    #[error("{0}")]
    NotFound(String),

    /// The requested transition is not legal from the current state.
    #[error("{0}")]
    Conflict(String),

    /// The request was malformed and rejected before any write.
    #[error("{0}")]
    Validation(String),

    /// The relational store rejected a read or write.
    #[error("storage error: {0}")]
    Persistence(String),
}

impl From<sqlx::Error> for EngineError {
    fn from(err: sqlx::Error) -> Self {
        EngineError::Persistence(err.to_string())
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::Persistence(format!("serialization: {}", err))
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
