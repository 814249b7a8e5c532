//! Lifecycle flags and the active child slot shared with signal handlers.
//!
//! Everything here is a plain atomic so that it can be touched from inside a
//! signal handler. Writers:
//! - lifecycle: the signal relay and the explicit `Worker` API
//! - child: the fork/reap path only

use forkbatch_core::LifecycleState;
use nix::unistd::Pid;
use std::sync::atomic::{AtomicI32, AtomicU8, Ordering};

const NO_CHILD: i32 = 0;

#[derive(Debug)]
pub struct WorkerState {
    lifecycle: AtomicU8,
    child: AtomicI32,
}

impl WorkerState {
    pub fn new() -> Self {
        WorkerState {
            lifecycle: AtomicU8::new(LifecycleState::Running.as_u8()),
            child: AtomicI32::new(NO_CHILD),
        }
    }

    pub fn lifecycle(&self) -> LifecycleState {
        LifecycleState::from_u8(self.lifecycle.load(Ordering::SeqCst))
    }

    pub fn is_shutting_down(&self) -> bool {
        self.lifecycle() == LifecycleState::ShuttingDown
    }

    pub fn is_paused(&self) -> bool {
        self.lifecycle() == LifecycleState::Paused
    }

    /// Enter `ShuttingDown`. Returns the previous state.
    pub fn shutdown(&self) -> LifecycleState {
        LifecycleState::from_u8(
            self.lifecycle
                .swap(LifecycleState::ShuttingDown.as_u8(), Ordering::SeqCst),
        )
    }

    /// `Running` → `Paused`. Returns whether the state changed.
    pub fn pause(&self) -> bool {
        self.transition(LifecycleState::Running, LifecycleState::Paused)
    }

    /// `Paused` → `Running`. Returns whether the state changed.
    pub fn resume(&self) -> bool {
        self.transition(LifecycleState::Paused, LifecycleState::Running)
    }

    fn transition(&self, from: LifecycleState, to: LifecycleState) -> bool {
        self.lifecycle
            .compare_exchange(from.as_u8(), to.as_u8(), Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Currently recorded child process, if any
    pub fn child(&self) -> Option<Pid> {
        match self.child.load(Ordering::SeqCst) {
            NO_CHILD => None,
            raw => Some(Pid::from_raw(raw)),
        }
    }

    pub(crate) fn set_child(&self, child: Option<Pid>) {
        let raw = child.map(Pid::as_raw).unwrap_or(NO_CHILD);
        self.child.store(raw, Ordering::SeqCst);
    }
}

impl Default for WorkerState {
    fn default() -> Self {
        Self::new()
    }
}
