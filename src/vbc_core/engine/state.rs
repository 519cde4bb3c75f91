use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use crate::sync_ext::{CondvarExt, MutexExt};
use crate::vbc_core::config::MAX_WORKER_THREADS;

/// Condvar-guarded scheduler counters.
///
/// The pool itself is a fixed set of worker threads; effective parallelism
/// is enforced here, inside the executor's admission wait, so raising or
/// lowering the ceiling never rebuilds the pool.
pub(crate) struct ControlBlock {
    pub active_threads: usize,
    pub current_max_threads: usize,
    pub shutdown_requested: bool,
    pub refresh_requested: bool,
}

pub(crate) struct Control {
    pub state: Mutex<ControlBlock>,
    pub cv: Condvar,
    /// Read-only stop signal polled by every encode loop; set only on
    /// operator interrupt.
    pub shutdown_signal: Arc<AtomicBool>,
}

/// Outcome of a thread-control delta, used to phrase operator feedback.
pub(crate) struct ThreadAdjustment {
    pub old: usize,
    pub new: usize,
    pub requested: i64,
}

impl Control {
    pub fn new(initial_threads: usize) -> Self {
        let initial = initial_threads.clamp(1, MAX_WORKER_THREADS);
        Self {
            state: Mutex::new(ControlBlock {
                active_threads: 0,
                current_max_threads: initial,
                shutdown_requested: false,
                refresh_requested: false,
            }),
            cv: Condvar::new(),
            shutdown_signal: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Toggles graceful shutdown; returns the new state.
    pub fn toggle_shutdown(&self) -> bool {
        let mut state = self.state.lock_unpoisoned();
        state.shutdown_requested = !state.shutdown_requested;
        let requested = state.shutdown_requested;
        drop(state);
        self.cv.notify_all();
        requested
    }

    pub fn shutdown_requested(&self) -> bool {
        self.state.lock_unpoisoned().shutdown_requested
    }

    /// Clamps `current_max_threads` by `delta` into `1..=MAX_WORKER_THREADS`
    /// and wakes admission waiters. No-op while a shutdown is pending.
    pub fn adjust_threads(&self, delta: i32) -> Option<ThreadAdjustment> {
        let mut state = self.state.lock_unpoisoned();
        if state.shutdown_requested {
            return None;
        }
        let old = state.current_max_threads;
        let requested = old as i64 + delta as i64;
        state.current_max_threads = requested.clamp(1, MAX_WORKER_THREADS as i64) as usize;
        let new = state.current_max_threads;
        drop(state);
        self.cv.notify_all();
        Some(ThreadAdjustment {
            old,
            new,
            requested,
        })
    }

    pub fn current_max_threads(&self) -> usize {
        self.state.lock_unpoisoned().current_max_threads
    }

    /// Operator interrupt: stop admitting work and signal every in-flight
    /// encode to terminate its child process.
    pub fn interrupt(&self) {
        self.shutdown_signal.store(true, Ordering::Relaxed);
        let mut state = self.state.lock_unpoisoned();
        state.shutdown_requested = true;
        drop(state);
        self.cv.notify_all();
    }

    pub fn interrupted(&self) -> bool {
        self.shutdown_signal.load(Ordering::Relaxed)
    }

    pub fn request_refresh(&self) {
        self.state.lock_unpoisoned().refresh_requested = true;
    }

    pub fn take_refresh(&self) -> bool {
        let mut state = self.state.lock_unpoisoned();
        std::mem::take(&mut state.refresh_requested)
    }

    /// Blocks the calling worker until a slot is free, then claims it.
    /// Returns false when shutdown was requested instead.
    pub fn admit_worker(&self) -> bool {
        let mut state = self.state.lock_unpoisoned();
        while state.active_threads >= state.current_max_threads && !state.shutdown_requested {
            state = self.cv.wait_unpoisoned(state);
        }
        if state.shutdown_requested {
            return false;
        }
        state.active_threads += 1;
        true
    }

    pub fn release_worker(&self) {
        {
            let mut state = self.state.lock_unpoisoned();
            state.active_threads = state.active_threads.saturating_sub(1);
        }
        self.cv.notify_all();
    }

    #[cfg(test)]
    pub fn active_threads(&self) -> usize {
        self.state.lock_unpoisoned().active_threads
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn thread_adjustment_clamps_into_allowed_range() {
        let control = Control::new(4);
        let adjusted = control.adjust_threads(-10).unwrap();
        assert_eq!(adjusted.new, 1);
        assert_eq!(adjusted.old, 4);

        let adjusted = control.adjust_threads(100).unwrap();
        assert_eq!(adjusted.new, MAX_WORKER_THREADS);
        assert!(adjusted.requested > MAX_WORKER_THREADS as i64);
    }

    #[test]
    fn thread_adjustment_is_refused_during_shutdown() {
        let control = Control::new(4);
        assert!(control.toggle_shutdown());
        assert!(control.adjust_threads(1).is_none());
        // Cancelling the shutdown re-enables control.
        assert!(!control.toggle_shutdown());
        assert!(control.adjust_threads(1).is_some());
    }

    #[test]
    fn admission_respects_the_ceiling_and_shutdown() {
        let control = Control::new(1);
        assert!(control.admit_worker());
        assert_eq!(control.active_threads(), 1);

        // The second worker parks until a slot opens.
        let control = std::sync::Arc::new(control);
        let waiter = control.clone();
        let handle = std::thread::spawn(move || waiter.admit_worker());
        std::thread::sleep(Duration::from_millis(50));
        assert!(!handle.is_finished());

        control.release_worker();
        assert!(handle.join().unwrap());

        // With shutdown pending, admission is refused.
        control.toggle_shutdown();
        assert!(!control.admit_worker());
    }

    #[test]
    fn refresh_flag_is_consumed_once() {
        let control = Control::new(2);
        assert!(!control.take_refresh());
        control.request_refresh();
        assert!(control.take_refresh());
        assert!(!control.take_refresh());
    }

    #[test]
    fn interrupt_sets_both_signal_and_shutdown() {
        let control = Control::new(2);
        control.interrupt();
        assert!(control.interrupted());
        assert!(control.shutdown_requested());
    }

    #[test]
    fn initial_threads_are_clamped() {
        assert_eq!(Control::new(0).current_max_threads(), 1);
        assert_eq!(Control::new(99).current_max_threads(), MAX_WORKER_THREADS);
    }
}
