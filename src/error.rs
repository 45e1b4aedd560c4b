use std::time::Duration;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, SamplerError>;

#[derive(Debug, Error)]
pub enum SamplerError {
    /// Bad or missing sample file, non-positive target and similar setup faults.
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("storage call timed out after {0:?}")]
    StorageTimeout(Duration),

    #[error("no {what} found for {key}")]
    NotFound { what: &'static str, key: String },

    #[error("{0}")]
    InvalidRequest(String),
}

impl SamplerError {
    pub fn configuration(message: impl Into<String>) -> Self {
        SamplerError::Configuration(message.into())
    }

    pub fn not_found(what: &'static str, key: impl Into<String>) -> Self {
        SamplerError::NotFound {
            what,
            key: key.into(),
        }
    }

    /// Backing store unreachable or slow; admission treats this as "no slot".
    pub fn is_storage(&self) -> bool {
        matches!(
            self,
            SamplerError::Storage(_) | SamplerError::StorageTimeout(_)
        )
    }
}
