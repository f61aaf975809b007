use thiserror::Error;

#[derive(Error, Debug)]
pub enum RiskError {
    #[error("Failed to enqueue emergency close: {0}")]
    Enqueue(#[from] kestrel_order_manager::Error),

    #[error("Invalid health configuration: {0}")]
    InvalidConfig(String),
}

pub type Result<T> = std::result::Result<T, RiskError>;
