//! Per-controller notification timers.
//!
//! After an audit ends, a controller gets one timer that waits for late southbound events and
//! then runs its task. Starting a timer for a controller that already has one cancels the old
//! timer first, so repeated audits never leak timers.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use topo_common::error::{TopoError, TopoResult};
use topo_core::containers::HotMap as HashMap;
use tracing::{debug, warn};

/// Work run when a timer expires.
pub type TimerTask = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug)]
struct TimerHandle {
    cancel: mpsc::Sender<()>,
    worker: thread::JoinHandle<()>,
}

impl TimerHandle {
    fn stop(self) {
        let _ = self.cancel.send(());
        if self.worker.join().is_err() {
            warn!("notification timer task panicked");
        }
    }
}

/// Timers keyed by controller name, each on its own thread.
#[derive(Debug)]
pub struct NotificationTimers {
    delay: Duration,
    timers: Mutex<HashMap<String, TimerHandle>>,
    fired: Arc<AtomicU64>,
}

impl NotificationTimers {
    /// Creates an empty timer set.
    #[must_use]
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            timers: Mutex::new(HashMap::new()),
            fired: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Starts the timer of `controller`, replacing and cancelling any previous one.
    ///
    /// # Errors
    ///
    /// Returns `TopoError::Io` when the timer thread cannot be spawned and
    /// `TopoError::InvalidState` when the timer map mutex is poisoned.
    pub fn start(&self, controller: &str, task: TimerTask) -> TopoResult<()> {
        let (cancel, cancelled) = mpsc::channel::<()>();
        let delay = self.delay;
        let fired = Arc::clone(&self.fired);
        let name = controller.to_owned();
        let worker = thread::Builder::new()
            .name(format!("notify-timer-{controller}"))
            .spawn(move || match cancelled.recv_timeout(delay) {
                Err(RecvTimeoutError::Timeout) => {
                    debug!(controller = %name, "notification timer fired");
                    task();
                    let _ = fired.fetch_add(1, Ordering::AcqRel);
                }
                Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                    debug!(controller = %name, "notification timer cancelled");
                }
            })
            .map_err(|error| TopoError::Io(error.to_string()))?;

        let replaced = self
            .timers
            .lock()
            .map_err(|_| TopoError::InvalidState("notification timer mutex is poisoned"))?
            .insert(controller.to_owned(), TimerHandle { cancel, worker });
        if let Some(previous) = replaced {
            debug!(controller, "replacing notification timer");
            previous.stop();
        }
        Ok(())
    }

    /// Cancels the timer of `controller`; returns whether one existed.
    ///
    /// # Errors
    ///
    /// Returns `TopoError::InvalidState` when the timer map mutex is poisoned.
    pub fn cancel(&self, controller: &str) -> TopoResult<bool> {
        let removed = self
            .timers
            .lock()
            .map_err(|_| TopoError::InvalidState("notification timer mutex is poisoned"))?
            .remove(controller);
        Ok(removed.map(TimerHandle::stop).is_some())
    }

    /// Returns whether `controller` has a timer that has not fired or been cancelled.
    ///
    /// # Errors
    ///
    /// Returns `TopoError::InvalidState` when the timer map mutex is poisoned.
    pub fn is_pending(&self, controller: &str) -> TopoResult<bool> {
        Ok(self
            .timers
            .lock()
            .map_err(|_| TopoError::InvalidState("notification timer mutex is poisoned"))?
            .get(controller)
            .is_some_and(|handle| !handle.worker.is_finished()))
    }

    /// Number of controllers with a registered timer, fired or not.
    ///
    /// # Errors
    ///
    /// Returns `TopoError::InvalidState` when the timer map mutex is poisoned.
    pub fn len(&self) -> TopoResult<usize> {
        Ok(self
            .timers
            .lock()
            .map_err(|_| TopoError::InvalidState("notification timer mutex is poisoned"))?
            .len())
    }

    /// Number of timers that ran their task.
    #[must_use]
    pub fn fired_count(&self) -> u64 {
        self.fired.load(Ordering::Acquire)
    }
}

impl Drop for NotificationTimers {
    fn drop(&mut self) {
        let handles = match self.timers.get_mut() {
            Ok(timers) => timers.drain().map(|(_, handle)| handle).collect::<Vec<_>>(),
            Err(_) => Vec::new(),
        };
        for handle in handles {
            handle.stop();
        }
    }
}
