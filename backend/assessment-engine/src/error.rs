use thiserror::Error;

/// Failures surfaced by the engine's collaborators.
///
/// Content-quality problems (schema rejects, validator rejections) are never
/// reported through this type; they are absorbed into task results.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Persistence read failed: {0}")]
    PersistenceRead(String),

    #[error("Persistence write failed: {0}")]
    PersistenceWrite(String),

    #[error("Queue storage failed: {0}")]
    QueueStorage(String),

    #[error("Generation service unavailable: {0}")]
    GenerationUnavailable(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),
}

impl From<mongodb::error::Error> for EngineError {
    fn from(err: mongodb::error::Error) -> Self {
        EngineError::PersistenceRead(err.to_string())
    }
}

impl From<redis::RedisError> for EngineError {
    fn from(err: redis::RedisError) -> Self {
        EngineError::QueueStorage(err.to_string())
    }
}

impl From<reqwest::Error> for EngineError {
    fn from(err: reqwest::Error) -> Self {
        EngineError::GenerationUnavailable(err.to_string())
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
