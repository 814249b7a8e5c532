use crate::batch::{BatchExecutor, PerformStrategy, SingleJob};
use crate::config::WorkerConfig;
use crate::error::{Result, WorkerError};
use crate::executor::JobExecutor;
use crate::handler::JobHandlerRegistry;
use crate::hooks::HookRegistry;
use crate::process::{self, Forked, TerminationReason};
use crate::signals::{self, SignalRelay};
use crate::state::WorkerState;
use forkbatch_core::{Job, LifecycleState, Queue};

use chrono::Utc;
use nix::sys::signal::Signal;
use nix::unistd::Pid;
use parking_lot::RwLock;
use std::panic::{self as std_panic, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Queue-consuming worker.
///
/// The worker loop reserves jobs from its queues in order and hands each one
/// to its `PerformStrategy`. With forking enabled the strategy runs in a
/// child process forked for that purpose, and the parent waits for it.
pub struct Worker {
    config: WorkerConfig,
    worker_id: String,
    queue: Arc<dyn Queue>,
    handlers: Arc<JobHandlerRegistry>,
    executor: JobExecutor,
    hooks: HookRegistry,
    strategy: Arc<dyn PerformStrategy>,
    state: Arc<WorkerState>,
    procline: RwLock<String>,
}

impl Worker {
    pub fn new(config: WorkerConfig, queue: Arc<dyn Queue>, handlers: JobHandlerRegistry) -> Self {
        let worker_id = config.generate_worker_id();
        let handlers = Arc::new(handlers);
        let strategy: Arc<dyn PerformStrategy> = if config.batch {
            Arc::new(BatchExecutor::default())
        } else {
            Arc::new(SingleJob)
        };

        Worker {
            config,
            worker_id,
            queue,
            executor: JobExecutor::new(handlers.clone()),
            handlers,
            hooks: HookRegistry::new(),
            strategy,
            state: Arc::new(WorkerState::new()),
            procline: RwLock::new("Starting".to_string()),
        }
    }

    pub fn with_hooks(mut self, hooks: HookRegistry) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn with_strategy<S: PerformStrategy + 'static>(mut self, strategy: S) -> Self {
        self.strategy = Arc::new(strategy);
        self
    }

    pub fn id(&self) -> &str {
        &self.worker_id
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn queues(&self) -> &[String] {
        &self.config.queues
    }

    pub fn queue(&self) -> &dyn Queue {
        self.queue.as_ref()
    }

    pub fn handlers(&self) -> &JobHandlerRegistry {
        &self.handlers
    }

    pub fn hooks(&self) -> &HookRegistry {
        &self.hooks
    }

    /// Shared lifecycle/child state, e.g. for handlers that need to stop
    /// the worker
    pub fn state(&self) -> Arc<WorkerState> {
        self.state.clone()
    }

    pub fn lifecycle(&self) -> LifecycleState {
        self.state.lifecycle()
    }

    /// Whether jobs run in forked children
    pub fn can_fork(&self) -> bool {
        self.config.fork
    }

    /// Child process currently running a batch, if any
    pub fn child(&self) -> Option<Pid> {
        self.state.child()
    }

    /// Current status line
    pub fn status(&self) -> String {
        self.procline.read().clone()
    }

    fn procline(&self, status: impl Into<String>) {
        let status = status.into();
        debug!("[{}] {}", self.worker_id, status);
        *self.procline.write() = status;
    }

    /// Reserve the next job from the watched queues, first queue first
    pub fn reserve(&self) -> Result<Option<Job>> {
        for queue in &self.config.queues {
            if let Some(job) = self.queue.reserve(queue)? {
                return Ok(Some(job));
            }
        }
        Ok(None)
    }

    /// Record `job` as this worker's job in progress
    pub fn working_on(&self, job: &Job) -> Result<()> {
        self.queue.mark_in_progress(&self.worker_id, job)?;
        self.procline(format!(
            "Processing {} since {}",
            job.queue,
            Utc::now().timestamp()
        ));
        Ok(())
    }

    /// Run a single job and record its outcome with the queue.
    ///
    /// A failing job is not an error of the worker: it is recorded as failed
    /// and `Ok(())` is returned. Only queue errors propagate.
    pub fn perform(&self, job: &Job) -> Result<()> {
        match self.executor.execute(job) {
            Ok(()) => self.queue.complete(&self.worker_id, job)?,
            Err(e) => self.queue.fail(&self.worker_id, job, &e)?,
        }
        Ok(())
    }

    /// Hand a reserved job that was never executed back to its queue
    pub fn release(&self, job: &Job) -> Result<()> {
        info!("Releasing {} unexecuted ({})", job.describe(), self.lifecycle());
        self.queue.release(&self.worker_id, job)?;
        Ok(())
    }

    /// Count one execution that returned control
    pub fn processed(&self) -> Result<()> {
        self.queue.mark_processed(&self.worker_id)?;
        Ok(())
    }

    /// Stop after the current job; relayed to the running child when batching
    pub fn shutdown(&self) {
        if self.state.shutdown() != LifecycleState::ShuttingDown {
            info!("Worker {} shutdown requested", self.worker_id);
        }
        if self.strategy.relays_signals() {
            signals::forward_to_child(&self.state, Signal::SIGQUIT);
        }
    }

    /// Stop taking jobs after the current one; relayed to the running child
    /// when batching
    pub fn pause(&self) {
        if self.state.pause() {
            info!("Worker {} paused", self.worker_id);
        }
        if self.strategy.relays_signals() && self.state.is_paused() {
            signals::forward_to_child(&self.state, Signal::SIGUSR2);
        }
    }

    /// Leave the paused state
    pub fn resume(&self) {
        if self.state.resume() {
            info!("Worker {} resumed", self.worker_id);
        }
    }

    /// Main loop. Returns once shutting down, or when there is nothing to
    /// do (idle or paused) and the polling interval is zero.
    pub fn work(&self) -> Result<()> {
        if self.config.queues.is_empty() {
            return Err(WorkerError::Config("no queues to watch".to_string()));
        }

        info!(
            "Starting worker {} on queues {:?} (strategy: {}, fork: {})",
            self.worker_id,
            self.config.queues,
            self.strategy.name(),
            self.can_fork()
        );

        if self.can_fork() {
            SignalRelay::install(&self.state, self.strategy.relays_signals())?;
        }

        let interval = self.config.interval();
        let mut observed = LifecycleState::Running;

        loop {
            let lifecycle = self.lifecycle();
            if lifecycle != observed {
                info!("Worker {} is now {}", self.worker_id, lifecycle);
                observed = lifecycle;
            }

            match lifecycle {
                LifecycleState::ShuttingDown => break,
                LifecycleState::Paused => self.procline("Paused"),
                LifecycleState::Running => {
                    if let Some(job) = self.reserve()? {
                        self.working_on(&job)?;
                        self.process(job)?;
                        continue;
                    }
                    self.procline(format!("Waiting for {}", self.config.queues.join(",")));
                }
            }

            if interval.is_zero() {
                break;
            }
            std::thread::sleep(interval);
        }

        self.procline("Exited");
        info!("Worker {} exiting", self.worker_id);
        Ok(())
    }

    fn process(&self, job: Job) -> Result<()> {
        if self.can_fork() {
            return self.fork_and_process(job);
        }

        let report = self.strategy.perform(self, job)?;
        debug!("Strategy {} returned {:?}", self.strategy.name(), report);
        Ok(())
    }

    fn fork_and_process(&self, job: Job) -> Result<()> {
        // Lifecycle signals stay blocked until the child is recorded, so a
        // request arriving meanwhile is relayed instead of missed.
        let blocked = SignalRelay::block()?;

        // A request that arrived after the job was reserved would leave the
        // child with nothing to do
        if self.lifecycle() != LifecycleState::Running {
            drop(blocked);
            return self.release(&job);
        }

        match process::fork_process()? {
            Forked::Child => {
                self.state.set_child(None);
                drop(blocked);
                let code = self.run_in_child(job);
                process::exit_child(code)
            }
            Forked::Parent { child } => {
                self.state.set_child(Some(child));
                drop(blocked);
                self.procline(format!("Forked {} at {}", child, Utc::now().timestamp()));

                // The slot is cleared while the child is still a zombie, so
                // its pid cannot be reused before relaying stops
                let reason = process::reap_after(child, || self.state.set_child(None))?;

                if reason.is_success() {
                    debug!("Child {} {}", child, reason);
                    Ok(())
                } else {
                    warn!("Child {} {}", child, reason);
                    self.fail_dirty_exit(reason)
                }
            }
        }
    }

    /// Body of the forked child; returns its exit code
    fn run_in_child(&self, job: Job) -> i32 {
        let outcome = std_panic::catch_unwind(AssertUnwindSafe(|| self.strategy.perform(self, job)));

        match outcome {
            Ok(Ok(report)) => {
                debug!("Child finished: {:?}", report);
                0
            }
            Ok(Err(e)) => {
                error!("Child of worker {} failed: {}", self.worker_id, e);
                1
            }
            Err(_) => {
                error!("Child of worker {} panicked", self.worker_id);
                1
            }
        }
    }

    /// Fail the job a child left in progress when it did not exit cleanly
    fn fail_dirty_exit(&self, reason: TerminationReason) -> Result<()> {
        if let Some(job) = self.queue.working(&self.worker_id)? {
            let message = format!("Dirty exit: child {}", reason);
            error!("Job {} lost: {}", job.describe(), message);
            self.queue.fail(&self.worker_id, &job, &message)?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("worker_id", &self.worker_id)
            .field("queues", &self.config.queues)
            .field("strategy", &self.strategy.name())
            .field("lifecycle", &self.lifecycle())
            .field("child", &self.child())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::{EchoHandler, FailHandler};
    use forkbatch_core::MemoryQueue;
    use serde_json::json;

    fn config() -> WorkerConfig {
        WorkerConfig {
            queues: vec!["high".to_string(), "low".to_string()],
            worker_id: Some("test-worker".to_string()),
            interval_secs: 0,
            fork: false,
            batch: false,
            ..WorkerConfig::default()
        }
    }

    fn worker(queue: Arc<MemoryQueue>) -> Worker {
        let handlers = JobHandlerRegistry::new();
        handlers.register("echo", EchoHandler);
        handlers.register("fail", FailHandler);
        Worker::new(config(), queue, handlers)
    }

    #[test]
    fn test_reserve_respects_queue_order() {
        let queue = Arc::new(MemoryQueue::new());
        queue.push(Job::new("low", "echo", json!(1)).unwrap()).unwrap();
        queue.push(Job::new("high", "echo", json!(2)).unwrap()).unwrap();

        let worker = worker(queue);
        assert_eq!(worker.reserve().unwrap().unwrap().queue, "high");
        assert_eq!(worker.reserve().unwrap().unwrap().queue, "low");
        assert!(worker.reserve().unwrap().is_none());
    }

    #[test]
    fn test_work_drains_with_zero_interval() {
        let queue = Arc::new(MemoryQueue::new());
        queue.push(Job::new("high", "echo", json!(1)).unwrap()).unwrap();
        queue.push(Job::new("low", "fail", json!({ "message": "nope" })).unwrap()).unwrap();

        let worker = worker(queue.clone());
        worker.work().unwrap();

        let stats = queue.stats().unwrap();
        assert_eq!(stats.pending, 0);
        assert_eq!(stats.processed, 2);
        assert_eq!(stats.failed, 1);
        assert_eq!(queue.failed_jobs()[0].error, "nope");
        assert_eq!(worker.status(), "Exited");
    }

    #[test]
    fn test_shutdown_before_work_runs_nothing() {
        let queue = Arc::new(MemoryQueue::new());
        queue.push(Job::new("high", "echo", json!(1)).unwrap()).unwrap();

        let worker = worker(queue.clone());
        worker.shutdown();
        worker.work().unwrap();

        assert_eq!(queue.size("high").unwrap(), 1);
        assert_eq!(worker.lifecycle(), LifecycleState::ShuttingDown);
    }

    #[test]
    fn test_paused_worker_leaves_jobs_until_resumed() {
        let queue = Arc::new(MemoryQueue::new());
        queue.push(Job::new("high", "echo", json!(1)).unwrap()).unwrap();

        let worker = worker(queue.clone());
        worker.pause();
        worker.work().unwrap();
        assert_eq!(queue.size("high").unwrap(), 1);

        worker.resume();
        worker.work().unwrap();
        assert_eq!(queue.size("high").unwrap(), 0);
        assert_eq!(queue.processed(), 1);
    }

    #[test]
    fn test_job_released_when_paused_before_fork() {
        let queue = Arc::new(MemoryQueue::new());
        queue.push(Job::new("high", "echo", json!(1)).unwrap()).unwrap();

        let worker = Worker::new(
            WorkerConfig { fork: true, ..config() },
            queue.clone(),
            JobHandlerRegistry::new(),
        );
        let job = worker.reserve().unwrap().unwrap();
        worker.working_on(&job).unwrap();
        worker.pause();

        worker.fork_and_process(job.clone()).unwrap();

        assert!(worker.child().is_none());
        assert!(queue.working(worker.id()).unwrap().is_none());
        let stats = queue.stats().unwrap();
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.reserved, 0);
        assert_eq!(worker.reserve().unwrap().unwrap().id, job.id);
    }

    #[test]
    fn test_work_requires_queues() {
        let worker = Worker::new(
            WorkerConfig { queues: Vec::new(), ..config() },
            Arc::new(MemoryQueue::new()),
            JobHandlerRegistry::new(),
        );
        assert!(matches!(worker.work(), Err(WorkerError::Config(_))));
    }

    #[test]
    fn test_strategy_selected_from_config() {
        let queue = Arc::new(MemoryQueue::new());
        let batched = Worker::new(
            WorkerConfig { batch: true, ..config() },
            queue.clone(),
            JobHandlerRegistry::new(),
        );
        let single = worker(queue);

        assert!(format!("{:?}", batched).contains("batch"));
        assert!(format!("{:?}", single).contains("single"));
    }
}
