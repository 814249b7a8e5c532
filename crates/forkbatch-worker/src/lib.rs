pub mod worker;
pub mod handler;
pub mod executor;
pub mod config;
pub mod batch;
pub mod hooks;
pub mod signals;
pub mod process;
pub mod state;
pub mod error;

pub use worker::Worker;
pub use handler::{JobHandler, JobHandlerRegistry, JobResult};
pub use config::WorkerConfig;
pub use batch::{
    parse_jobs_per_fork, BatchExecutor, BatchReport, BatchSize, PerformStrategy, SingleJob,
    StopReason, JOBS_PER_FORK_VAR,
};
pub use hooks::{hook, Hook, HookPoint, HookRegistry};
pub use state::WorkerState;
pub use signals::{RelayOutcome, SignalRelay};
pub use process::TerminationReason;
pub use error::{Result, WorkerError};
