use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("invalid entity id: {0}")]
    InvalidEntityId(String),

    #[error("invalid attribute path: {0}")]
    InvalidPath(String),

    #[error("invalid data: {0}")]
    InvalidData(String),

    #[error("validation failed for {collection}.{path}: {message}")]
    Validation {
        collection: String,
        path: String,
        message: String,
    },
}
