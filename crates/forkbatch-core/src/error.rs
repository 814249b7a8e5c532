use thiserror::Error;

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Invalid queue name: {0:?}")]
    InvalidQueueName(String),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Corrupt job record at {path}: {reason}")]
    CorruptRecord { path: String, reason: String },

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Other error: {0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, QueueError>;
