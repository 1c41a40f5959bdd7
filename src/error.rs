use thiserror::Error;

#[derive(Error, Debug)]
pub enum ControllerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("API error: {0}")]
    Api(#[from] api::ApiError),

    #[error("Rebalance error: {0}")]
    Rebalance(#[from] rebalance::RebalanceError),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Task failed: {0}")]
    Task(String),
}

pub type Result<T> = std::result::Result<T, ControllerError>;
