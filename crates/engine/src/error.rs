use trinity_core::CoreError;
use trinity_storage::StorageError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("storage error: {0}")]
    Storage(StorageError),

    #[error("core error: {0}")]
    Core(CoreError),

    #[error("validation failed for {collection}.{path}: {message}")]
    Validation {
        collection: String,
        path: String,
        message: String,
    },

    #[error("write permission denied: {operation} on {collection} {entity}")]
    WritePermission {
        collection: String,
        entity: String,
        operation: String,
    },

    #[error("query not prepared: {0}")]
    QueryNotPrepared(String),

    #[error("relation '{alias}' expected at most one row, got {count}")]
    InvalidResultCardinality { alias: String, count: usize },

    #[error("variable not found: ${0}")]
    SessionVariableNotFound(String),

    #[error("invalid query: {0}")]
    InvalidQuery(String),

    #[error("entity not found: {0}")]
    EntityNotFound(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("subscriber callback failed: {0}")]
    Callback(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl EngineError {
    /// Machine-readable status code, HTTP style.
    pub fn status(&self) -> u16 {
        match self {
            EngineError::Validation { .. } | EngineError::InvalidQuery(_) => 400,
            EngineError::WritePermission { .. } => 403,
            EngineError::EntityNotFound(_) | EngineError::SessionVariableNotFound(_) => 404,
            EngineError::Core(CoreError::Validation { .. }) => 400,
            EngineError::Config(_) => 400,
            EngineError::Storage(_)
            | EngineError::Core(_)
            | EngineError::QueryNotPrepared(_)
            | EngineError::InvalidResultCardinality { .. }
            | EngineError::Callback(_) => 500,
        }
    }

    pub fn callback(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        EngineError::Callback(Box::new(err))
    }
}

impl From<CoreError> for EngineError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::Validation {
                collection,
                path,
                message,
            } => EngineError::Validation {
                collection,
                path,
                message,
            },
            other => EngineError::Core(other),
        }
    }
}

/// Hook failures travel through the store boxed; unwrap our own errors on the way out.
impl From<StorageError> for EngineError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Rejected(source) => match source.downcast::<EngineError>() {
                Ok(engine) => *engine,
                Err(other) => EngineError::Storage(StorageError::Rejected(other)),
            },
            StorageError::Core(core) => core.into(),
            other => EngineError::Storage(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejected_hook_errors_unwrap_to_engine_errors() {
        let denied = EngineError::WritePermission {
            collection: "todos".into(),
            entity: "todos#1".into(),
            operation: "insert".into(),
        };
        let err: EngineError = StorageError::rejected(denied).into();
        assert!(matches!(err, EngineError::WritePermission { .. }));
        assert_eq!(err.status(), 403);
    }

    #[test]
    fn core_validation_maps_to_validation() {
        let err: EngineError = CoreError::Validation {
            collection: "todos".into(),
            path: "title".into(),
            message: "expected string, got number".into(),
        }
        .into();
        assert!(matches!(err, EngineError::Validation { .. }));
        assert_eq!(err.status(), 400);
    }
}
