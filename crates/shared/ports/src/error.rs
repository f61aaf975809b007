use thiserror::Error;

/// Errors surfaced by the exchange collaborator
///
/// The split between retryable and fatal drives the execution retry policy:
/// only retryable errors consume retry budget.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExchangeError {
    #[error("Request timed out")]
    Timeout,

    #[error("Network failure: {0}")]
    Network(String),

    #[error("Rate limited")]
    RateLimited,

    #[error("Exchange temporarily unavailable: {0}")]
    Unavailable(String),

    #[error("Order rejected: {0}")]
    Rejected(String),

    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("Not found: {0}")]
    NotFound(String),
}

impl ExchangeError {
    /// Transient failures worth another attempt
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ExchangeError::Timeout
                | ExchangeError::Network(_)
                | ExchangeError::RateLimited
                | ExchangeError::Unavailable(_)
        )
    }

    /// Failures that another attempt cannot fix
    pub fn is_fatal(&self) -> bool {
        !self.is_retryable()
    }
}

pub type ExchangeResult<T> = std::result::Result<T, ExchangeError>;

/// Errors surfaced by the repository collaborator
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RepositoryError {
    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Storage failure: {0}")]
    Storage(String),

    #[error("Serialization failed: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for RepositoryError {
    fn from(e: serde_json::Error) -> Self {
        RepositoryError::Serialization(e.to_string())
    }
}

pub type RepositoryResult<T> = std::result::Result<T, RepositoryError>;
