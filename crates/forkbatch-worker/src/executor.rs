use crate::handler::{JobHandlerRegistry, JobResult};
use forkbatch_core::Job;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info};

/// Runs a single job through its registered handler
pub struct JobExecutor {
    handlers: Arc<JobHandlerRegistry>,
}

impl JobExecutor {
    pub fn new(handlers: Arc<JobHandlerRegistry>) -> Self {
        JobExecutor { handlers }
    }

    /// Execute a job, converting a missing handler or a panic into a failure
    pub fn execute(&self, job: &Job) -> JobResult {
        let handler = match self.handlers.get(job.class()) {
            Some(h) => h,
            None => {
                error!("No handler registered for job class: {}", job.class());
                return Err(format!("No handler for job class: {}", job.class()));
            }
        };

        info!("Executing job {}", job.describe());
        let started = Instant::now();

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| handler.perform(job.args())));

        match outcome {
            Ok(Ok(())) => {
                info!("Job {} completed in {:?}", job.id, started.elapsed());
                Ok(())
            }
            Ok(Err(e)) => {
                error!("Job {} failed: {}", job.id, e);
                Err(e)
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                error!("Job {} panicked: {}", job.id, message);
                Err(format!("Job panicked during execution: {}", message))
            }
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
