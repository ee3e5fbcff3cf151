use thiserror::Error;

#[derive(Debug, Error)]
pub enum StateError {
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Corrupted record under key {0}")]
    Corrupted(String),

    #[error("Core error: {0}")]
    Core(#[from] ordinal_core::CoreError),
}

impl From<std::io::Error> for StateError {
    fn from(err: std::io::Error) -> Self {
        StateError::Storage(err.to_string())
    }
}
