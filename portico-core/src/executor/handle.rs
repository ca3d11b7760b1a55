use std::{
    any::Any,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::Arc,
    time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex};

use crate::{AnyError, AnyResult, Error, Result};

enum Slot<T> {
    Pending,
    Running,
    Finished(AnyResult<T>),
    Taken,
    Cancelled,
}

struct Shared<T> {
    slot: Mutex<Slot<T>>,
    ready: Condvar,
}

/// Cancellable handle on a submitted task or request.
///
/// Cancelling work that has not started yet prevents it from ever running;
/// cancelling work that is already running only discards its result (and
/// stops further runs of a periodic task).
pub struct TaskHandle<T> {
    shared: Arc<Shared<T>>,
}

/// The producing half of a [`TaskHandle`], owned by the job.
///
/// Dropping it without completing marks the handle cancelled, which is how
/// jobs discarded by an immediate pool shutdown are reported.
pub(crate) struct Completer<T> {
    shared: Arc<Shared<T>>,
}

impl<T> TaskHandle<T> {
    pub(crate) fn pair() -> (TaskHandle<T>, Completer<T>) {
        let shared = Arc::new(Shared {
            slot: Mutex::new(Slot::Pending),
            ready: Condvar::new(),
        });
        (
            TaskHandle {
                shared: shared.clone(),
            },
            Completer { shared },
        )
    }

    /// A handle whose work already ran on the caller's thread.
    pub(crate) fn completed(result: AnyResult<T>) -> TaskHandle<T> {
        TaskHandle {
            shared: Arc::new(Shared {
                slot: Mutex::new(Slot::Finished(result)),
                ready: Condvar::new(),
            }),
        }
    }

    pub fn is_done(&self) -> bool {
        !matches!(*self.shared.slot.lock(), Slot::Pending | Slot::Running)
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(*self.shared.slot.lock(), Slot::Cancelled)
    }

    /// Returns `false` when the work had already completed.
    pub fn cancel(&self) -> bool {
        let mut slot = self.shared.slot.lock();
        match *slot {
            Slot::Pending | Slot::Running => {
                *slot = Slot::Cancelled;
                self.shared.ready.notify_all();
                true
            }
            _ => false,
        }
    }

    /// Blocks until the work completes or `timeout` elapses; returns whether it is done.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut slot = self.shared.slot.lock();
        while matches!(*slot, Slot::Pending | Slot::Running) {
            if self
                .shared
                .ready
                .wait_until(&mut slot, deadline)
                .timed_out()
            {
                return !matches!(*slot, Slot::Pending | Slot::Running);
            }
        }
        true
    }

    /// Blocks the calling thread until the result is available.
    pub fn get(self) -> Result<T> {
        let mut slot = self.shared.slot.lock();
        while matches!(*slot, Slot::Pending | Slot::Running) {
            self.shared.ready.wait(&mut slot);
        }
        Self::take(&mut slot)
    }

    /// Like [`TaskHandle::get`] but gives the handle back when `timeout` elapses first.
    pub fn get_timeout(self, timeout: Duration) -> std::result::Result<Result<T>, Self> {
        if !self.wait_timeout(timeout) {
            return Err(self);
        }
        let mut slot = self.shared.slot.lock();
        Ok(Self::take(&mut slot))
    }

    fn take(slot: &mut Slot<T>) -> Result<T> {
        match std::mem::replace(slot, Slot::Taken) {
            Slot::Finished(Ok(value)) => Ok(value),
            Slot::Finished(Err(e)) => Err(Error::Execution(e)),
            Slot::Cancelled => {
                *slot = Slot::Cancelled;
                Err(Error::Cancelled)
            }
            Slot::Taken => Err(contract_violation!("task result already taken")),
            Slot::Pending | Slot::Running => unreachable!("result taken before completion"),
        }
    }
}

impl<T> std::fmt::Debug for TaskHandle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match *self.shared.slot.lock() {
            Slot::Pending => "pending",
            Slot::Running => "running",
            Slot::Finished(Ok(_)) | Slot::Taken => "done",
            Slot::Finished(Err(_)) => "failed",
            Slot::Cancelled => "cancelled",
        };
        f.debug_struct("TaskHandle").field("state", &state).finish()
    }
}

impl<T> Completer<T> {
    /// Marks the work as started; `false` means it was cancelled and must not run.
    pub(crate) fn begin(&self) -> bool {
        let mut slot = self.shared.slot.lock();
        match *slot {
            Slot::Pending => {
                *slot = Slot::Running;
                true
            }
            Slot::Running => true,
            _ => false,
        }
    }

    pub(crate) fn complete(self, result: AnyResult<T>) {
        let mut slot = self.shared.slot.lock();
        // A late result of cancelled work is discarded.
        if matches!(*slot, Slot::Pending | Slot::Running) {
            *slot = Slot::Finished(result);
        }
        self.shared.ready.notify_all();
    }
}

impl<T> Drop for Completer<T> {
    fn drop(&mut self) {
        let mut slot = self.shared.slot.lock();
        if matches!(*slot, Slot::Pending | Slot::Running) {
            *slot = Slot::Cancelled;
            self.shared.ready.notify_all();
        }
    }
}

/// Runs a unit of work, turning a panic into an execution failure.
pub(crate) fn run_guarded<T>(f: impl FnOnce() -> AnyResult<T>) -> AnyResult<T> {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(r) => r,
        Err(panic) => Err(panic_error(panic)),
    }
}

pub(crate) fn panic_error(panic: Box<dyn Any + Send>) -> AnyError {
    let msg = if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    };
    anyhow::anyhow!("panicked: {msg}")
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;

    #[test]
    fn test_get_blocks_until_completion() {
        let (handle, completer) = TaskHandle::<u32>::pair();
        assert!(!handle.is_done());
        let worker = thread::spawn(move || {
            assert!(completer.begin());
            thread::sleep(Duration::from_millis(20));
            completer.complete(Ok(7));
        });
        assert_eq!(7, handle.get().unwrap());
        worker.join().unwrap();
    }

    #[test]
    fn test_cancel_before_start_prevents_run() {
        let (handle, completer) = TaskHandle::<()>::pair();
        assert!(handle.cancel());
        assert!(!completer.begin());
        assert!(handle.is_done());
        assert!(handle.is_cancelled());
        assert!(handle.get().unwrap_err().is_cancelled());
    }

    #[test]
    fn test_dropped_completer_reports_cancellation() {
        let (handle, completer) = TaskHandle::<()>::pair();
        drop(completer);
        assert!(handle.is_cancelled());
        assert!(!handle.cancel());
    }

    #[test]
    fn test_failure_and_timeout() {
        let (handle, completer) = TaskHandle::<()>::pair();
        let handle = handle.get_timeout(Duration::from_millis(10)).unwrap_err();
        completer.complete(Err(anyhow::anyhow!("boom")));
        let err = handle.get_timeout(Duration::from_millis(10)).unwrap().unwrap_err();
        assert!(matches!(err, Error::Execution(_)));
    }

    #[test]
    fn test_run_guarded_catches_panics() {
        let err = run_guarded::<()>(|| panic!("bad state")).unwrap_err();
        assert_eq!("panicked: bad state", err.to_string());
        assert_eq!(3, run_guarded(|| Ok(3)).unwrap());
    }
}
