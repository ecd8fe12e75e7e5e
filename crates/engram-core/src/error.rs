use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("invalid parent: {0}")]
    InvalidParent(String),

    #[error("write conflict: {0}")]
    Conflict(String),

    #[error("corrupt history: {0}")]
    CorruptHistory(String),

    #[error("request expired: {0}")]
    Expired(String),

    #[error("already decided: {0}")]
    AlreadyDecided(String),

    #[error("timed out: {0}")]
    TimedOut(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("index error: {0}")]
    Index(String),

    #[error("storage unavailable: {0}")]
    Unavailable(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Transient faults are eligible for bounded retry at the store boundary.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Storage(_) | Error::Unavailable(_))
    }
}

impl From<duckdb::Error> for Error {
    fn from(e: duckdb::Error) -> Self {
        let msg = e.to_string();
        if msg.contains("Constraint") {
            Error::Conflict(msg)
        } else {
            Error::Storage(msg)
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Internal(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
