use thiserror::Error as ThisError;

use crate::store::StoreError;

#[derive(ThisError, Debug)]
pub enum Error {
    /// Missing or inconsistent settings; the pipeline must not start
    #[error("invalid configuration: {message}")]
    InvalidConfiguration { message: String },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("failed to register metrics: {0}")]
    Metrics(#[from] prometheus::Error),

    /// Unexpected error with full context chain
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    pub fn invalid_configuration(message: impl Into<String>) -> Self {
        Self::InvalidConfiguration {
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
