use thiserror::Error;

#[derive(Error, Debug)]
pub enum SluiceError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Object store error: {0}")]
    ObjectStore(#[from] object_store::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Invocation failed: {0}")]
    Invocation(String),

    #[error("Invalid trigger {key}: {reason}")]
    InvalidTrigger { key: String, reason: String },

    #[error("Invalid timestamp: {0}")]
    InvalidTimestamp(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl SluiceError {
    pub fn invalid_trigger(key: impl ToString, reason: impl Into<String>) -> Self {
        SluiceError::InvalidTrigger {
            key: key.to_string(),
            reason: reason.into(),
        }
    }

    /// Storage and invocation failures that are expected to clear up on the
    /// next poll cycle.
    pub fn is_transient(&self) -> bool {
        match self {
            SluiceError::Io(_)
            | SluiceError::ObjectStore(_)
            | SluiceError::Storage(_)
            | SluiceError::Invocation(_) => true,
            SluiceError::Http(err) => {
                err.is_timeout() || err.is_connect() || err.is_request()
            }
            _ => false,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, SluiceError::NotFound(_))
    }
}

pub type Result<T> = std::result::Result<T, SluiceError>;
