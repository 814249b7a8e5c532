use crate::hooks::HookPoint;
use forkbatch_core::QueueError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("{point} hook failed: {source}")]
    Hook {
        point: HookPoint,
        #[source]
        source: anyhow::Error,
    },

    #[error("Failed to fork: {0}")]
    Fork(#[source] nix::Error),

    #[error("Failed to install handler for {signal}: {source}")]
    Signal {
        signal: nix::sys::signal::Signal,
        #[source]
        source: nix::Error,
    },

    #[error("Failed to reap child {pid}: {source}")]
    Reap {
        pid: nix::unistd::Pid,
        #[source]
        source: nix::Error,
    },

    #[error("Configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, WorkerError>;
