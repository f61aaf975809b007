//! Order Manager errors

use kestrel_core::{ActionError, ActionErrorKind, PositionStatus, StatusTransitionError};
use kestrel_ports::{ExchangeError, RepositoryError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Symbol {0} is locked by another operation")]
    LockContention(String),

    #[error("Position already open for {0}")]
    AlreadyOpen(String),

    #[error("No position for {0}")]
    NoPosition(String),

    #[error("Position for {symbol} is {status:?}, expected {expected:?}")]
    InvalidState {
        symbol: String,
        status: PositionStatus,
        expected: PositionStatus,
    },

    #[error(transparent)]
    Transition(#[from] StatusTransitionError),

    #[error("Execution failed: {0}")]
    Exchange(#[from] ExecutionError),

    #[error("Manual reconciliation required for {symbol}: {reason}")]
    ReconciliationRequired { symbol: String, reason: String },

    #[error("Action queue is closed")]
    QueueClosed,

    #[error("Repository error: {0}")]
    Repository(#[from] RepositoryError),
}

impl Error {
    /// Category reported in a failed `ActionResult`
    pub fn kind(&self) -> ActionErrorKind {
        match self {
            Error::Validation(_)
            | Error::AlreadyOpen(_)
            | Error::NoPosition(_)
            | Error::InvalidState { .. } => ActionErrorKind::Validation,
            Error::LockContention(_) => ActionErrorKind::LockContention,
            Error::Exchange(ExecutionError::ReconciliationRequired(_))
            | Error::ReconciliationRequired { .. } => ActionErrorKind::ReconciliationRequired,
            Error::Exchange(_) => ActionErrorKind::Exchange,
            Error::Transition(_) | Error::QueueClosed | Error::Repository(_) => {
                ActionErrorKind::Internal
            }
        }
    }

    pub fn to_action_error(&self) -> ActionError {
        ActionError::new(self.kind(), self.to_string())
    }
}

impl From<kestrel_core::ActionValidationError> for Error {
    fn from(e: kestrel_core::ActionValidationError) -> Self {
        Error::Validation(e.to_string())
    }
}

/// Failures of the order execution pipeline
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExecutionError {
    #[error("Retries exhausted after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: ExchangeError },

    #[error("Fatal exchange error: {0}")]
    Fatal(ExchangeError),

    #[error("Compensation failed, reconciliation required: {0}")]
    ReconciliationRequired(String),
}

impl ExecutionError {
    /// The exchange error behind this failure, if any
    pub fn exchange_error(&self) -> Option<&ExchangeError> {
        match self {
            ExecutionError::RetriesExhausted { last, .. } => Some(last),
            ExecutionError::Fatal(e) => Some(e),
            ExecutionError::ReconciliationRequired(_) => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
