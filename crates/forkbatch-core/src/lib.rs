mod job;
mod lifecycle;
mod error;
pub mod queue;

pub use job::{Job, JobId, JobPayload, FailedJob};
pub use lifecycle::LifecycleState;
pub use error::{QueueError, Result};
pub use queue::{Queue, QueueStats, MemoryQueue};

/// Maximum length of a queue name. Queue names double as directory names in
/// the spool backend, so they are kept short and path-safe.
pub const MAX_QUEUE_NAME_LEN: usize = 128;

/// Check that a queue name is non-empty, bounded, and free of path separators.
pub fn validate_queue_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name.len() <= MAX_QUEUE_NAME_LEN
        && name != "."
        && name != ".."
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | ':'));

    if valid {
        Ok(())
    } else {
        Err(QueueError::InvalidQueueName(name.to_string()))
    }
}
