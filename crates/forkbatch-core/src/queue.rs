use crate::{validate_queue_name, FailedJob, Job, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

/// Aggregate counters reported by a queue backend
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    /// Jobs waiting to be reserved, across all queues
    pub pending: usize,
    /// Jobs reserved but not yet completed or failed
    pub reserved: usize,
    /// Executions that returned control (success or failure)
    pub processed: u64,
    /// Jobs recorded as failed
    pub failed: usize,
    /// Workers with a job marked in progress
    pub working: usize,
}

/// Storage and reservation of jobs.
///
/// Implementations own job destruction: a reserved job leaves the backend
/// through `complete` or `fail`.
pub trait Queue: Send + Sync {
    /// Append a job to the tail of its queue
    fn push(&self, job: Job) -> Result<()>;

    /// Take the job at the head of `queue`, if any
    fn reserve(&self, queue: &str) -> Result<Option<Job>>;

    /// Record that `worker_id` started executing `job`
    fn mark_in_progress(&self, worker_id: &str, job: &Job) -> Result<()>;

    /// Count one execution that returned control
    fn mark_processed(&self, worker_id: &str) -> Result<()>;

    /// Destroy a reserved job after successful execution
    fn complete(&self, worker_id: &str, job: &Job) -> Result<()>;

    /// Record a reserved job as failed
    fn fail(&self, worker_id: &str, job: &Job, error: &str) -> Result<()>;

    /// Return a reserved job that was never executed to the head of its
    /// queue and clear `worker_id`'s in-progress record
    fn release(&self, worker_id: &str, job: &Job) -> Result<()>;

    /// Job currently marked in progress for `worker_id`
    fn working(&self, worker_id: &str) -> Result<Option<Job>>;

    /// Number of pending jobs in `queue`
    fn size(&self, queue: &str) -> Result<usize>;

    /// Aggregate counters
    fn stats(&self) -> Result<QueueStats>;
}

/// In-process FIFO queues keyed by name.
///
/// Not shared across `fork`: use it for single-process workers and tests.
pub struct MemoryQueue {
    queues: RwLock<HashMap<String, VecDeque<Job>>>,
    reserved: RwLock<HashMap<crate::JobId, Job>>,
    working: RwLock<HashMap<String, Job>>,
    failed: RwLock<Vec<FailedJob>>,
    processed: AtomicU64,
}

impl MemoryQueue {
    pub fn new() -> Self {
        MemoryQueue {
            queues: RwLock::new(HashMap::new()),
            reserved: RwLock::new(HashMap::new()),
            working: RwLock::new(HashMap::new()),
            failed: RwLock::new(Vec::new()),
            processed: AtomicU64::new(0),
        }
    }

    /// Snapshot of failed job records, oldest first
    pub fn failed_jobs(&self) -> Vec<FailedJob> {
        self.failed.read().clone()
    }

    /// Processed counter
    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::SeqCst)
    }
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl Queue for MemoryQueue {
    fn push(&self, job: Job) -> Result<()> {
        validate_queue_name(&job.queue)?;
        let mut queues = self.queues.write();
        queues.entry(job.queue.clone()).or_default().push_back(job);
        Ok(())
    }

    fn reserve(&self, queue: &str) -> Result<Option<Job>> {
        let job = {
            let mut queues = self.queues.write();
            queues.get_mut(queue).and_then(|q| q.pop_front())
        };

        if let Some(job) = &job {
            self.reserved.write().insert(job.id, job.clone());
        }
        Ok(job)
    }

    fn mark_in_progress(&self, worker_id: &str, job: &Job) -> Result<()> {
        self.working.write().insert(worker_id.to_string(), job.clone());
        Ok(())
    }

    fn mark_processed(&self, _worker_id: &str) -> Result<()> {
        self.processed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn complete(&self, worker_id: &str, job: &Job) -> Result<()> {
        self.reserved.write().remove(&job.id);
        self.working.write().remove(worker_id);
        Ok(())
    }

    fn fail(&self, worker_id: &str, job: &Job, error: &str) -> Result<()> {
        self.reserved.write().remove(&job.id);
        self.working.write().remove(worker_id);
        self.failed
            .write()
            .push(FailedJob::new(job.clone(), error, worker_id));
        Ok(())
    }

    fn release(&self, worker_id: &str, job: &Job) -> Result<()> {
        self.reserved.write().remove(&job.id);
        self.working.write().remove(worker_id);
        self.queues
            .write()
            .entry(job.queue.clone())
            .or_default()
            .push_front(job.clone());
        Ok(())
    }

    fn working(&self, worker_id: &str) -> Result<Option<Job>> {
        Ok(self.working.read().get(worker_id).cloned())
    }

    fn size(&self, queue: &str) -> Result<usize> {
        Ok(self.queues.read().get(queue).map(VecDeque::len).unwrap_or(0))
    }

    fn stats(&self) -> Result<QueueStats> {
        Ok(QueueStats {
            pending: self.queues.read().values().map(VecDeque::len).sum(),
            reserved: self.reserved.read().len(),
            processed: self.processed(),
            failed: self.failed.read().len(),
            working: self.working.read().len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn job(queue: &str, n: u32) -> Job {
        Job::new(queue, "echo", json!([n])).unwrap()
    }

    #[test]
    fn test_fifo_per_queue() {
        let queue = MemoryQueue::new();
        queue.push(job("a", 1)).unwrap();
        queue.push(job("b", 2)).unwrap();
        queue.push(job("a", 3)).unwrap();

        assert_eq!(queue.size("a").unwrap(), 2);
        assert_eq!(queue.reserve("a").unwrap().unwrap().args(), &json!([1]));
        assert_eq!(queue.reserve("a").unwrap().unwrap().args(), &json!([3]));
        assert!(queue.reserve("a").unwrap().is_none());
        assert_eq!(queue.reserve("b").unwrap().unwrap().args(), &json!([2]));
        assert!(queue.reserve("missing").unwrap().is_none());
    }

    #[test]
    fn test_complete_and_fail_bookkeeping() {
        let queue = MemoryQueue::new();
        queue.push(job("a", 1)).unwrap();
        queue.push(job("a", 2)).unwrap();

        let first = queue.reserve("a").unwrap().unwrap();
        queue.mark_in_progress("w1", &first).unwrap();
        assert_eq!(queue.working("w1").unwrap(), Some(first.clone()));
        assert_eq!(queue.stats().unwrap().reserved, 1);

        queue.complete("w1", &first).unwrap();
        queue.mark_processed("w1").unwrap();
        assert!(queue.working("w1").unwrap().is_none());

        let second = queue.reserve("a").unwrap().unwrap();
        queue.mark_in_progress("w1", &second).unwrap();
        queue.fail("w1", &second, "boom").unwrap();
        queue.mark_processed("w1").unwrap();

        let stats = queue.stats().unwrap();
        assert_eq!(stats.pending, 0);
        assert_eq!(stats.reserved, 0);
        assert_eq!(stats.processed, 2);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.working, 0);

        let failed = queue.failed_jobs();
        assert_eq!(failed[0].job.id, second.id);
        assert_eq!(failed[0].error, "boom");
        assert_eq!(failed[0].worker_id, "w1");
    }

    #[test]
    fn test_release_returns_job_to_head() {
        let queue = MemoryQueue::new();
        queue.push(job("a", 1)).unwrap();
        queue.push(job("a", 2)).unwrap();

        let first = queue.reserve("a").unwrap().unwrap();
        queue.mark_in_progress("w1", &first).unwrap();
        queue.release("w1", &first).unwrap();

        let stats = queue.stats().unwrap();
        assert_eq!(stats.pending, 2);
        assert_eq!(stats.reserved, 0);
        assert_eq!(stats.working, 0);
        assert_eq!(queue.reserve("a").unwrap().unwrap().id, first.id);
    }
}
