//! Runner errors

use crate::shutdown::ShutdownReport;
use kestrel_ports::RepositoryError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

#[derive(Error, Debug)]
pub enum ShutdownError {
    #[error("Shutdown timed out with {} action(s) still pending", .0.pending_actions)]
    Timeout(ShutdownReport),

    #[error("Failed to persist final state: {0}")]
    Persistence(#[from] RepositoryError),
}

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Symbol {0} is not configured")]
    UnknownSymbol(String),

    #[error(transparent)]
    Order(#[from] kestrel_order_manager::Error),

    #[error(transparent)]
    Shutdown(#[from] ShutdownError),
}

pub type Result<T> = std::result::Result<T, EngineError>;
