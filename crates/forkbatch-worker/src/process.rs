//! Fork, reap, and exit for the per-batch child process.

use crate::error::{Result, WorkerError};
use nix::errno::Errno;
use nix::sys::signal::Signal;
use nix::sys::wait::{waitid, waitpid, Id, WaitPidFlag, WaitStatus};
use nix::unistd::{self, ForkResult, Pid};

/// Which side of a `fork` the caller is on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Forked {
    Parent { child: Pid },
    Child,
}

/// Fork the current process.
///
/// The child must only run the batch and then leave through [`exit_child`];
/// it never returns into the parent's loop.
pub fn fork_process() -> Result<Forked> {
    // Safety: the worker runs single-threaded, and the child only executes
    // the strategy before calling `_exit`.
    match unsafe { unistd::fork() } {
        Ok(ForkResult::Parent { child }) => Ok(Forked::Parent { child }),
        Ok(ForkResult::Child) => Ok(Forked::Child),
        Err(e) => Err(WorkerError::Fork(e)),
    }
}

/// Terminate the child without running the parent's destructors or
/// exit handlers.
pub fn exit_child(code: i32) -> ! {
    // Safety: `_exit` is always safe to call; it does not return.
    unsafe { nix::libc::_exit(code) }
}

/// Block until `child` terminates and report how.
pub fn reap(child: Pid) -> Result<TerminationReason> {
    loop {
        match waitpid(child, None) {
            Ok(status @ (WaitStatus::Exited(..) | WaitStatus::Signaled(..))) => {
                return Ok(analyze_wait_status(status));
            }
            // Stopped/continued notifications are not requested, but keep waiting
            Ok(_) => continue,
            Err(Errno::EINTR) => continue,
            Err(source) => return Err(WorkerError::Reap { pid: child, source }),
        }
    }
}

/// Wait for `child` to terminate, run `before_reap` while it is still an
/// unreaped zombie, then reap it.
///
/// Until it is reaped the pid stays allocated to the child, so anything that
/// signals the recorded child can be disabled in `before_reap` without ever
/// hitting a reused pid.
pub fn reap_after<F: FnOnce()>(child: Pid, before_reap: F) -> Result<TerminationReason> {
    let waited = wait_exited(child);
    before_reap();
    waited?;
    reap(child)
}

/// Block until `child` has terminated, leaving it waitable
fn wait_exited(child: Pid) -> Result<()> {
    loop {
        match waitid(Id::Pid(child), WaitPidFlag::WEXITED | WaitPidFlag::WNOWAIT) {
            Ok(_) => return Ok(()),
            Err(Errno::EINTR) => continue,
            Err(source) => return Err(WorkerError::Reap { pid: child, source }),
        }
    }
}

/// Why a child process terminated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationReason {
    /// Normal exit with status code
    Exited(i32),
    /// Killed by a signal
    Signaled { signal: Signal, core_dumped: bool },
    /// Anything `waitpid` reported that is not a termination
    Unknown,
}

impl TerminationReason {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Exited(0))
    }

    pub fn description(&self) -> String {
        match self {
            Self::Exited(code) => format!("exited with code {}", code),
            Self::Signaled { signal, core_dumped: true } => {
                format!("killed by signal {} (core dumped)", signal)
            }
            Self::Signaled { signal, .. } => format!("killed by signal {}", signal),
            Self::Unknown => "terminated for an unknown reason".to_string(),
        }
    }
}

impl std::fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.description())
    }
}

pub fn analyze_wait_status(status: WaitStatus) -> TerminationReason {
    match status {
        WaitStatus::Exited(_, code) => TerminationReason::Exited(code),
        WaitStatus::Signaled(_, signal, core_dumped) => {
            TerminationReason::Signaled { signal, core_dumped }
        }
        _ => TerminationReason::Unknown,
    }
}
