//! Single-slot debounce timer.
//!
//! At most one timer is pending. Scheduling again cancels the pending timer
//! and starts a new window, so a burst of calls runs the task once, one
//! window after the last call. The timer knows nothing about storage.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use log::{debug, warn};
use tokio::runtime::Handle;
use tokio::time::sleep;

/// Cancellation handle of one scheduled timer.
#[derive(Debug, Clone)]
pub struct TimerHandle {
    cancelled: Arc<AtomicBool>,
}

impl TimerHandle {
    fn new() -> Self {
        Self { cancelled: Arc::new(AtomicBool::new(false)) }
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    fn same_timer(&self, other: &TimerHandle) -> bool {
        Arc::ptr_eq(&self.cancelled, &other.cancelled)
    }
}

/// Coalesces bursts of [`Debouncer::schedule`] calls into one run.
#[derive(Debug)]
pub struct Debouncer {
    delay: Duration,
    slot: Arc<Mutex<Option<TimerHandle>>>,
}

impl Debouncer {
    pub fn new(delay: Duration) -> Self {
        Self { delay, slot: Arc::new(Mutex::new(None)) }
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Restarts the window; `task` runs once it elapses undisturbed.
    ///
    /// The timer runs on the current tokio runtime. Called outside one,
    /// nothing is scheduled and `false` is returned.
    pub fn schedule<F, Fut>(&self, task: F) -> bool
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let Ok(runtime) = Handle::try_current() else {
            warn!("No tokio runtime, debounced task not scheduled");
            return false;
        };

        let handle = TimerHandle::new();
        {
            let mut slot = lock(&self.slot);
            if let Some(previous) = slot.replace(handle.clone()) {
                previous.cancel();
            }
        }

        let slot = Arc::clone(&self.slot);
        let delay = self.delay;
        runtime.spawn(async move {
            sleep(delay).await;
            {
                // Checked under the slot lock so a concurrent cancel either
                // wins before this point or finds the slot already empty.
                let mut slot = lock(&slot);
                if handle.is_cancelled() {
                    return;
                }
                if slot.as_ref().is_some_and(|current| current.same_timer(&handle)) {
                    *slot = None;
                }
            }
            debug!("Debounce window of {delay:?} elapsed");
            task().await;
        });
        true
    }

    /// Cancels the pending timer, if any. Returns whether one was pending.
    pub fn cancel(&self) -> bool {
        match lock(&self.slot).take() {
            Some(handle) => {
                handle.cancel();
                true
            }
            None => false,
        }
    }

    pub fn is_pending(&self) -> bool {
        lock(&self.slot).is_some()
    }
}

impl Drop for Debouncer {
    fn drop(&mut self) {
        self.cancel();
    }
}

fn lock(slot: &Mutex<Option<TimerHandle>>) -> MutexGuard<'_, Option<TimerHandle>> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}
