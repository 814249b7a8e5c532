//! Execution strategies: what a worker does with a job it has reserved.
//!
//! `SingleJob` performs exactly that job. `BatchExecutor` performs it and then
//! keeps reserving until the batch is full, the queues run dry, or the worker
//! is asked to pause or shut down. Either way the strategy runs inside the
//! process that executes jobs, which is the forked child when forking.

use crate::error::Result;
use crate::hooks::HookPoint;
use crate::worker::Worker;
use forkbatch_core::{Job, LifecycleState};
use tracing::{debug, info, warn};

/// Environment variable holding the batch size
pub const JOBS_PER_FORK_VAR: &str = "JOBS_PER_FORK";

/// Parse a configured batch size. Unset, malformed, zero, or negative values
/// all mean one job per batch.
pub fn parse_jobs_per_fork(raw: Option<&str>) -> usize {
    let Some(raw) = raw else {
        return 1;
    };

    match raw.trim().parse::<i64>() {
        Ok(n) if n >= 1 => usize::try_from(n).unwrap_or(usize::MAX),
        Ok(_) => 1,
        Err(_) => {
            warn!("Ignoring malformed {}={:?}, using 1", JOBS_PER_FORK_VAR, raw);
            1
        }
    }
}

/// Where a batch executor gets its size from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchSize {
    /// Read the named environment variable at the start of every batch
    Env(String),
    /// Fixed size, clamped to at least one
    Fixed(usize),
}

impl BatchSize {
    pub fn from_env() -> Self {
        BatchSize::Env(JOBS_PER_FORK_VAR.to_string())
    }

    /// Effective size for the batch about to start
    pub fn resolve(&self) -> usize {
        match self {
            BatchSize::Env(var) => parse_jobs_per_fork(std::env::var(var).ok().as_deref()),
            BatchSize::Fixed(n) => (*n).max(1),
        }
    }
}

impl Default for BatchSize {
    fn default() -> Self {
        Self::from_env()
    }
}

/// Why a batch stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Executed as many jobs as the batch allows
    BatchFull,
    /// No job left in any watched queue
    QueueEmpty,
    /// Worker was paused before the next attempt
    Paused,
    /// Worker was shutting down before the next attempt
    ShuttingDown,
}

/// Outcome of one strategy invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchReport {
    /// Jobs that were executed and marked processed
    pub executed: usize,
    pub stop: StopReason,
}

/// What the worker does with each job it reserves
pub trait PerformStrategy: Send + Sync {
    /// Execute `job` (already reserved) and whatever else the strategy
    /// decides to take on before returning control to the worker loop.
    fn perform(&self, worker: &Worker, job: Job) -> Result<BatchReport>;

    /// Whether lifecycle signals received by the parent must be forwarded
    /// to the child running this strategy.
    fn relays_signals(&self) -> bool {
        false
    }

    fn name(&self) -> &'static str;
}

/// One job per invocation; no hooks. The worker loop has already marked the
/// job in progress.
#[derive(Debug, Clone, Copy, Default)]
pub struct SingleJob;

impl PerformStrategy for SingleJob {
    fn perform(&self, worker: &Worker, job: Job) -> Result<BatchReport> {
        worker.perform(&job)?;
        worker.processed()?;

        Ok(BatchReport {
            executed: 1,
            stop: StopReason::BatchFull,
        })
    }

    fn name(&self) -> &'static str {
        "single"
    }
}

/// Up to N jobs per invocation, framed by before/after batch hooks
#[derive(Debug, Clone, Default)]
pub struct BatchExecutor {
    size: BatchSize,
}

impl BatchExecutor {
    pub fn new(size: BatchSize) -> Self {
        BatchExecutor { size }
    }

    /// Batch size source
    pub fn size(&self) -> &BatchSize {
        &self.size
    }

    /// Run one batch starting with `initial`, which the caller has already
    /// reserved and marked in progress.
    ///
    /// Before-batch hooks run first and their failure aborts the batch. After
    /// that, every attempt checks the lifecycle before taking on a job, so a
    /// pause or shutdown takes effect between jobs, never during one.
    /// If the batch stops before `initial` ran, it is released back to its
    /// queue. After-batch hooks run whatever number of jobs executed.
    pub fn run_batch(&self, worker: &Worker, initial: Job, batch_size: usize) -> Result<BatchReport> {
        let batch_size = batch_size.max(1);
        worker.hooks().run(HookPoint::BeforeBatch, worker)?;

        let mut initial = Some(initial);
        let mut executed = 0;
        let mut stop = StopReason::BatchFull;

        for attempt in 0..batch_size {
            match worker.lifecycle() {
                LifecycleState::ShuttingDown => {
                    stop = StopReason::ShuttingDown;
                    break;
                }
                LifecycleState::Paused => {
                    stop = StopReason::Paused;
                    break;
                }
                LifecycleState::Running => {}
            }

            // The first attempt's job was reserved and marked in progress by
            // the worker loop
            let job = match initial.take() {
                Some(job) => job,
                None => match worker.reserve()? {
                    Some(job) => {
                        worker.working_on(&job)?;
                        job
                    }
                    None => {
                        stop = StopReason::QueueEmpty;
                        break;
                    }
                },
            };

            debug!("Batch attempt {}/{}: {}", attempt + 1, batch_size, job.describe());
            worker.perform(&job)?;
            worker.processed()?;
            executed += 1;
        }

        if let Some(job) = initial {
            worker.release(&job)?;
        }

        worker.hooks().run(HookPoint::AfterBatch, worker)?;

        info!(
            "Batch finished: {} of {} job(s) executed ({:?})",
            executed, batch_size, stop
        );
        Ok(BatchReport { executed, stop })
    }
}

impl PerformStrategy for BatchExecutor {
    fn perform(&self, worker: &Worker, job: Job) -> Result<BatchReport> {
        self.run_batch(worker, job, self.size.resolve())
    }

    fn relays_signals(&self) -> bool {
        true
    }

    fn name(&self) -> &'static str {
        "batch"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_jobs_per_fork() {
        assert_eq!(parse_jobs_per_fork(None), 1);
        assert_eq!(parse_jobs_per_fork(Some("")), 1);
        assert_eq!(parse_jobs_per_fork(Some("abc")), 1);
        assert_eq!(parse_jobs_per_fork(Some("0")), 1);
        assert_eq!(parse_jobs_per_fork(Some("-3")), 1);
        assert_eq!(parse_jobs_per_fork(Some("2")), 2);
        assert_eq!(parse_jobs_per_fork(Some(" 25 ")), 25);
        assert_eq!(parse_jobs_per_fork(Some("2.5")), 1);
    }

    #[test]
    fn test_fixed_size_is_clamped() {
        assert_eq!(BatchSize::Fixed(0).resolve(), 1);
        assert_eq!(BatchSize::Fixed(7).resolve(), 7);
    }

    #[test]
    fn test_env_size_is_read_on_every_resolve() {
        // Private variable name so parallel tests don't interfere
        let var = "FORKBATCH_TEST_BATCH_SIZE_RESOLVE";
        let size = BatchSize::Env(var.to_string());

        std::env::remove_var(var);
        assert_eq!(size.resolve(), 1);

        std::env::set_var(var, "4");
        assert_eq!(size.resolve(), 4);

        std::env::set_var(var, "many");
        assert_eq!(size.resolve(), 1);

        std::env::remove_var(var);
    }

    #[test]
    fn test_default_reads_jobs_per_fork() {
        assert_eq!(BatchSize::default(), BatchSize::Env("JOBS_PER_FORK".to_string()));
        assert!(BatchExecutor::default().relays_signals());
        assert!(!SingleJob.relays_signals());
    }
}
