//! Signal handling for forking workers.
//!
//! QUIT requests a graceful shutdown and USR2 a pause; both take effect at the
//! next attempt boundary of the running batch. CONT resumes a paused worker.
//! When the strategy runs batches in a child process, the parent forwards QUIT
//! and USR2 to the recorded child so that the child's batch loop observes the
//! same request.
//!
//! The handler itself only touches atomics and calls `kill(2)`, both of which
//! are async-signal-safe. Logging of the transition happens in the worker
//! loop once it observes the new state.

use crate::error::{Result, WorkerError};
use crate::state::WorkerState;
use nix::libc::c_int;
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, SigmaskHow, Signal};
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// Signals whose handling changes the lifecycle
pub const LIFECYCLE_SIGNALS: [Signal; 3] = [Signal::SIGQUIT, Signal::SIGUSR2, Signal::SIGCONT];

/// State the installed handlers act on. Replaced on every install; previous
/// values are never freed because a handler may still hold a reference.
static ACTIVE_STATE: AtomicPtr<WorkerState> = AtomicPtr::new(ptr::null_mut());

/// Whether QUIT/USR2 are forwarded to the recorded child
static RELAY_TO_CHILD: AtomicBool = AtomicBool::new(false);

/// What happened when a lifecycle signal was handled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayOutcome {
    /// Only the local state changed (or nothing to change)
    Local,
    /// Signal delivered to the child
    Forwarded,
    /// Child was recorded but no longer exists
    ChildGone,
    /// Not a lifecycle signal
    Ignored,
}

pub struct SignalRelay;

impl SignalRelay {
    /// Install QUIT/USR2/CONT handlers acting on `state`.
    ///
    /// With `relay_to_child`, QUIT and USR2 are also forwarded to the child
    /// recorded in `state`. Installing again switches the handlers over to
    /// the new state.
    pub fn install(state: &Arc<WorkerState>, relay_to_child: bool) -> Result<()> {
        let raw = Arc::into_raw(Arc::clone(state)) as *mut WorkerState;
        ACTIVE_STATE.swap(raw, Ordering::SeqCst);
        RELAY_TO_CHILD.store(relay_to_child, Ordering::SeqCst);

        let action = SigAction::new(
            SigHandler::Handler(handle_signal),
            SaFlags::SA_RESTART,
            SigSet::empty(),
        );
        for sig in LIFECYCLE_SIGNALS {
            // Safety: the handler only performs async-signal-safe operations.
            unsafe { signal::sigaction(sig, &action) }
                .map_err(|source| WorkerError::Signal { signal: sig, source })?;
        }

        info!(
            "Installed lifecycle signal handlers (relay to child: {})",
            relay_to_child
        );
        Ok(())
    }

    /// Block lifecycle signals for the calling thread until the returned
    /// guard is released. Used around `fork` so that a request arriving
    /// before the child is recorded is handled (and relayed) afterwards.
    pub fn block() -> Result<SignalBlock> {
        let mut set = SigSet::empty();
        for sig in LIFECYCLE_SIGNALS {
            set.add(sig);
        }

        let mut previous = SigSet::empty();
        signal::pthread_sigmask(SigmaskHow::SIG_BLOCK, Some(&set), Some(&mut previous))
            .map_err(|source| WorkerError::Signal {
                signal: Signal::SIGQUIT,
                source,
            })?;

        Ok(SignalBlock { previous })
    }
}

/// Restores the previous signal mask when dropped
pub struct SignalBlock {
    previous: SigSet,
}

impl Drop for SignalBlock {
    fn drop(&mut self) {
        let _ = signal::pthread_sigmask(SigmaskHow::SIG_SETMASK, Some(&self.previous), None);
    }
}

extern "C" fn handle_signal(signum: c_int) {
    let Ok(sig) = Signal::try_from(signum) else {
        return;
    };

    let raw = ACTIVE_STATE.load(Ordering::SeqCst);
    if raw.is_null() {
        return;
    }
    // Safety: pointers stored in ACTIVE_STATE come from Arc::into_raw and are
    // never released.
    let state = unsafe { &*raw };

    relay(state, sig, RELAY_TO_CHILD.load(Ordering::SeqCst));
}

/// Apply a lifecycle signal to `state`, forwarding it to the recorded child
/// when `relay_to_child` is set.
///
/// A child that has already exited is not an error; the signal raced with
/// its natural exit.
pub fn relay(state: &WorkerState, sig: Signal, relay_to_child: bool) -> RelayOutcome {
    match sig {
        Signal::SIGQUIT => {
            state.shutdown();
        }
        Signal::SIGUSR2 => {
            // A shutting-down worker stays so; its child was sent QUIT
            state.pause();
            if !state.is_paused() {
                return RelayOutcome::Local;
            }
        }
        Signal::SIGCONT => {
            state.resume();
            return RelayOutcome::Local;
        }
        _ => return RelayOutcome::Ignored,
    }

    if !relay_to_child {
        return RelayOutcome::Local;
    }

    signal_child(state, sig)
}

fn signal_child(state: &WorkerState, sig: Signal) -> RelayOutcome {
    match state.child() {
        Some(child) => match signal::kill(child, sig) {
            Ok(()) => RelayOutcome::Forwarded,
            Err(_) => RelayOutcome::ChildGone,
        },
        None => RelayOutcome::Local,
    }
}

/// Forward `sig` to the recorded child from regular (non-handler) code
pub(crate) fn forward_to_child(state: &WorkerState, sig: Signal) -> RelayOutcome {
    let outcome = signal_child(state, sig);
    match outcome {
        RelayOutcome::Forwarded => debug!("Relayed {} to child", sig),
        RelayOutcome::ChildGone => debug!("Child already gone, {} not relayed", sig),
        _ => {}
    }
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use forkbatch_core::LifecycleState;
    use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
    use nix::unistd::Pid;
    use std::process::{Command, Stdio};

    fn spawn_sleeper() -> Pid {
        let child = Command::new("sleep")
            .arg("30")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .spawn()
            .expect("Failed to spawn sleep");
        Pid::from_raw(child.id() as i32)
    }

    #[test]
    fn test_quit_without_child_is_local() {
        let state = WorkerState::new();
        assert_eq!(relay(&state, Signal::SIGQUIT, true), RelayOutcome::Local);
        assert_eq!(state.lifecycle(), LifecycleState::ShuttingDown);
    }

    #[test]
    fn test_pause_and_cont() {
        let state = WorkerState::new();
        assert_eq!(relay(&state, Signal::SIGUSR2, false), RelayOutcome::Local);
        assert!(state.is_paused());

        assert_eq!(relay(&state, Signal::SIGCONT, true), RelayOutcome::Local);
        assert_eq!(state.lifecycle(), LifecycleState::Running);
    }

    #[test]
    fn test_other_signals_ignored() {
        let state = WorkerState::new();
        assert_eq!(relay(&state, Signal::SIGHUP, true), RelayOutcome::Ignored);
        assert_eq!(state.lifecycle(), LifecycleState::Running);
    }

    #[test]
    fn test_quit_forwarded_to_child() {
        let state = WorkerState::new();
        let child = spawn_sleeper();
        state.set_child(Some(child));

        assert_eq!(relay(&state, Signal::SIGQUIT, true), RelayOutcome::Forwarded);
        assert!(state.is_shutting_down());

        // sleep(1) has no QUIT handler, so the relayed signal terminates it
        match waitpid(child, None).unwrap() {
            WaitStatus::Signaled(pid, sig, _) => {
                assert_eq!(pid, child);
                assert_eq!(sig, Signal::SIGQUIT);
            }
            other => panic!("Expected child killed by SIGQUIT, got {:?}", other),
        }
    }

    #[test]
    fn test_usr2_forwarded_only_when_relaying() {
        let state = WorkerState::new();
        let child = spawn_sleeper();
        state.set_child(Some(child));

        assert_eq!(relay(&state, Signal::SIGUSR2, false), RelayOutcome::Local);
        assert_eq!(
            waitpid(child, Some(WaitPidFlag::WNOHANG)).unwrap(),
            WaitStatus::StillAlive
        );

        assert_eq!(relay(&state, Signal::SIGUSR2, true), RelayOutcome::Forwarded);
        match waitpid(child, None).unwrap() {
            WaitStatus::Signaled(_, sig, _) => assert_eq!(sig, Signal::SIGUSR2),
            other => panic!("Expected child killed by SIGUSR2, got {:?}", other),
        }
    }

    #[test]
    fn test_usr2_not_forwarded_while_shutting_down() {
        let state = WorkerState::new();
        let child = spawn_sleeper();
        state.set_child(Some(child));
        state.shutdown();

        assert_eq!(relay(&state, Signal::SIGUSR2, true), RelayOutcome::Local);
        assert!(state.is_shutting_down());
        assert_eq!(
            waitpid(child, Some(WaitPidFlag::WNOHANG)).unwrap(),
            WaitStatus::StillAlive
        );

        signal::kill(child, Signal::SIGKILL).unwrap();
        waitpid(child, None).unwrap();
    }

    #[test]
    fn test_usr2_forwarded_when_already_paused() {
        let state = WorkerState::new();
        let child = spawn_sleeper();
        state.set_child(Some(child));
        state.pause();

        assert_eq!(relay(&state, Signal::SIGUSR2, true), RelayOutcome::Forwarded);
        match waitpid(child, None).unwrap() {
            WaitStatus::Signaled(_, sig, _) => assert_eq!(sig, Signal::SIGUSR2),
            other => panic!("Expected child killed by SIGUSR2, got {:?}", other),
        }
    }

    #[test]
    fn test_signal_to_reaped_child_is_noop() {
        let state = WorkerState::new();
        let child = spawn_sleeper();
        signal::kill(child, Signal::SIGKILL).unwrap();
        waitpid(child, None).unwrap();
        state.set_child(Some(child));

        assert_eq!(relay(&state, Signal::SIGQUIT, true), RelayOutcome::ChildGone);
        assert!(state.is_shutting_down());
        assert_eq!(forward_to_child(&state, Signal::SIGUSR2), RelayOutcome::ChildGone);
    }
}
