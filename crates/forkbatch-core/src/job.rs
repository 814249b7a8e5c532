use crate::{validate_queue_name, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a job
pub type JobId = Uuid;

/// What to run: a handler class name and its JSON arguments
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobPayload {
    /// Handler class name (e.g., "send_email", "resize_image")
    pub class: String,

    /// Arguments handed to the handler
    #[serde(default)]
    pub args: serde_json::Value,
}

/// A unit of work sitting in, or reserved from, a named queue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Unique job identifier
    pub id: JobId,

    /// Queue the job was pushed to
    pub queue: String,

    /// Handler class and arguments
    pub payload: JobPayload,

    /// When the job was enqueued
    pub enqueued_at: DateTime<Utc>,
}

impl Job {
    /// Create a new job for `queue`
    pub fn new(
        queue: impl Into<String>,
        class: impl Into<String>,
        args: serde_json::Value,
    ) -> Result<Self> {
        let queue = queue.into();
        validate_queue_name(&queue)?;

        Ok(Job {
            id: Uuid::new_v4(),
            queue,
            payload: JobPayload {
                class: class.into(),
                args,
            },
            enqueued_at: Utc::now(),
        })
    }

    /// Handler class name
    pub fn class(&self) -> &str {
        &self.payload.class
    }

    /// Handler arguments
    pub fn args(&self) -> &serde_json::Value {
        &self.payload.args
    }

    /// Serialize job to JSON bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Deserialize job from JSON bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Short human-readable label used in logs and status lines
    pub fn describe(&self) -> String {
        format!("{}:{} ({})", self.queue, self.payload.class, self.id)
    }
}

/// Record of a job whose execution failed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedJob {
    pub job: Job,
    pub error: String,
    pub worker_id: String,
    pub failed_at: DateTime<Utc>,
}

impl FailedJob {
    pub fn new(job: Job, error: impl Into<String>, worker_id: impl Into<String>) -> Self {
        FailedJob {
            job,
            error: error.into(),
            worker_id: worker_id.into(),
            failed_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::QueueError;
    use serde_json::json;

    #[test]
    fn test_job_creation() {
        let job = Job::new("jobs", "echo", json!(["hello"])).unwrap();

        assert_eq!(job.queue, "jobs");
        assert_eq!(job.class(), "echo");
        assert_eq!(job.args(), &json!(["hello"]));
    }

    #[test]
    fn test_job_rejects_bad_queue_name() {
        match Job::new("../etc", "echo", json!(null)) {
            Err(QueueError::InvalidQueueName(name)) => assert_eq!(name, "../etc"),
            other => panic!("Expected InvalidQueueName, got {:?}", other),
        }
    }

    #[test]
    fn test_job_serialization() {
        let job = Job::new("jobs", "sleep", json!({ "ms": 10 })).unwrap();

        let bytes = job.to_bytes().unwrap();
        let decoded = Job::from_bytes(&bytes).unwrap();

        assert_eq!(job, decoded);
    }

    #[test]
    fn test_payload_args_default_to_null() {
        let payload: JobPayload = serde_json::from_str(r#"{"class":"echo"}"#).unwrap();
        assert_eq!(payload.args, serde_json::Value::Null);
    }
}
