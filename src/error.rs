use thiserror::Error;

pub type Result<T> = std::result::Result<T, AmberLogError>;

#[derive(Error, Debug)]
pub enum AmberLogError {
    #[error("object not found: {0}")]
    NotFound(String),

    #[error("write cancelled by version check: {0}")]
    Cancelled(String),

    #[error("object already exists: {0}")]
    Exists(String),

    #[error("object has no backing data: {0}")]
    NoData(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("inconsistent generation map: {0}")]
    Inconsistency(String),

    #[error("watch error: {0}")]
    Watch(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
