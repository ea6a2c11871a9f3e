//! The session-wide cancellation signal.
//!
//! A [`CancelToken`] is created once per session and cloned into whatever
//! needs it: the Ctrl+C handler on one side, the [`crate::supervisor::Supervisor`]
//! on the other. Besides the flag it tracks the PID of the child currently
//! being supervised, so that cancelling also terminates that child right away.
use crate::process;
use nix::sys::signal::Signal;
use nix::unistd::Pid;
use std::ffi::OsString;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    inner: Arc<Shared>,
}

#[derive(Debug, Default)]
struct Shared {
    cancelled: AtomicBool,
    /// The live child, cleared by its owner in the same critical section
    /// that reaps it.
    active: Mutex<Option<Tracked>>,
}

/// The child a cancellation has to reach.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Tracked {
    pub(crate) pid: Pid,
    /// Command prefix able to signal `pid` when this process may not.
    pub(crate) signaller: Option<Vec<OsString>>,
}

/// Empties `slot` if it still holds `pid`.
pub(crate) fn release(slot: &mut Option<Tracked>, pid: Pid) {
    if slot.as_ref().is_some_and(|t| t.pid == pid) {
        *slot = None;
    }
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the flag and asks the tracked child, if any, to terminate.
    ///
    /// Safe to call from any thread, any number of times. Calling it after the
    /// child has been reaped is a no-op.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);

        let active = self.lock_active();
        if let Some(tracked) = active.as_ref() {
            log::warn!("Cancellation requested, sending SIGTERM to process {}", tracked.pid);
            process::deliver(tracked.pid, Signal::SIGTERM, tracked.signaller.as_deref());
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    pub(crate) fn lock_active(&self) -> MutexGuard<'_, Option<Tracked>> {
        self.inner
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}
