//! Cooperative pause/cancel signalling and progress reporting between a running
//! simulation and the thread that watches it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

pub const DEFAULT_UPDATE_INTERVAL: Duration = Duration::from_millis(1000);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Pause/cancel flags shared between a simulator and its controlling thread.
///
/// A simulator only looks at the flags at its status checkpoints, so a request takes
/// effect at the next checkpoint.
#[derive(Debug, Default)]
pub struct SimulationController {
    cancelled: AtomicBool,
    stopped: Mutex<bool>,
    resumed: Condvar,
}

impl SimulationController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Cancelling also stops the run, and wakes a simulator blocked in a pause.
    pub fn set_cancelled(&self, cancelled: bool) {
        self.cancelled.store(cancelled, Ordering::SeqCst);
        if cancelled {
            *lock(&self.stopped) = true;
        }
        self.resumed.notify_all();
    }

    pub fn is_stopped(&self) -> bool {
        *lock(&self.stopped)
    }

    pub fn set_stopped(&self, stopped: bool) {
        *lock(&self.stopped) = stopped;
        if !stopped {
            self.resumed.notify_all();
        }
    }

    /// Blocks while the run is paused. Returns true when the run has been cancelled.
    pub fn handle_pause_or_cancel(&self) -> bool {
        let mut stopped = lock(&self.stopped);
        while *stopped && !self.is_cancelled() {
            stopped = self
                .resumed
                .wait(stopped)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
        self.is_cancelled()
    }
}

/// Last progress report published by a simulator.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ProgressStatus {
    pub finished: bool,
    pub fraction_complete: f64,
    pub iterations: u64,
    /// Incremented on every update.
    pub sequence: u64,
}

#[derive(Debug, Default)]
pub struct SimulationProgressReporter {
    status: Mutex<ProgressStatus>,
    updated: Condvar,
}

impl SimulationProgressReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&self, finished: bool, fraction_complete: f64, iterations: u64) {
        let mut status = lock(&self.status);
        status.finished = finished;
        status.fraction_complete = fraction_complete;
        status.iterations = iterations;
        status.sequence += 1;
        self.updated.notify_all();
    }

    pub fn snapshot(&self) -> ProgressStatus {
        *lock(&self.status)
    }

    pub fn is_finished(&self) -> bool {
        lock(&self.status).finished
    }

    /// Blocks until the next update is published.
    pub fn wait_for_update(&self) -> ProgressStatus {
        let status = lock(&self.status);
        let seen = status.sequence;
        let status = self
            .updated
            .wait_while(status, |s| s.sequence == seen)
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *status
    }

    /// Like `wait_for_update`, giving up after `timeout`. Returns `None` on timeout.
    pub fn wait_for_update_timeout(&self, timeout: Duration) -> Option<ProgressStatus> {
        let status = lock(&self.status);
        let seen = status.sequence;
        let (status, result) = self
            .updated
            .wait_timeout_while(status, timeout, |s| s.sequence == seen)
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if result.timed_out() {
            None
        } else {
            Some(*status)
        }
    }
}

/// Wall-clock throttle for status checkpoints.
#[derive(Debug, Clone)]
pub struct UpdateThrottle {
    interval: Duration,
    last: Instant,
}

impl UpdateThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: Instant::now(),
        }
    }

    /// True at most once per interval.
    pub fn is_due(&mut self) -> bool {
        let now = Instant::now();
        if now.duration_since(self.last) >= self.interval {
            self.last = now;
            true
        } else {
            false
        }
    }
}

/// Optional controller and reporter attached to a simulator, plus the minimum
/// wall-clock time between status checkpoints.
#[derive(Debug, Clone)]
pub struct Supervision {
    pub controller: Option<Arc<SimulationController>>,
    pub reporter: Option<Arc<SimulationProgressReporter>>,
    pub update_interval: Duration,
}

impl Default for Supervision {
    fn default() -> Self {
        Self {
            controller: None,
            reporter: None,
            update_interval: DEFAULT_UPDATE_INTERVAL,
        }
    }
}

impl Supervision {
    pub fn throttle(&self) -> UpdateThrottle {
        UpdateThrottle::new(self.update_interval)
    }

    /// Publishes progress, then blocks while paused. Returns true when cancelled.
    pub fn checkpoint(&self, fraction_complete: f64, iterations: u64) -> bool {
        if let Some(reporter) = &self.reporter {
            reporter.update(false, fraction_complete, iterations);
        }
        self.controller
            .as_ref()
            .is_some_and(|controller| controller.handle_pause_or_cancel())
    }

    pub fn finish(&self, fraction_complete: f64, iterations: u64) {
        if let Some(reporter) = &self.reporter {
            reporter.update(true, fraction_complete, iterations);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn cancel_implies_stopped_and_releases_pause() {
        let controller = Arc::new(SimulationController::new());
        controller.set_stopped(true);

        let waiter = {
            let controller = Arc::clone(&controller);
            thread::spawn(move || controller.handle_pause_or_cancel())
        };
        thread::sleep(Duration::from_millis(20));
        controller.set_cancelled(true);

        assert!(waiter.join().expect("join"));
        assert!(controller.is_stopped());
    }

    #[test]
    fn resume_releases_pause_without_cancelling() {
        let controller = Arc::new(SimulationController::new());
        controller.set_stopped(true);

        let waiter = {
            let controller = Arc::clone(&controller);
            thread::spawn(move || controller.handle_pause_or_cancel())
        };
        thread::sleep(Duration::from_millis(20));
        controller.set_stopped(false);

        assert!(!waiter.join().expect("join"));
    }

    #[test]
    fn running_controller_does_not_block() {
        let controller = SimulationController::new();
        assert!(!controller.handle_pause_or_cancel());
    }

    #[test]
    fn reporter_wakes_waiters() {
        let reporter = Arc::new(SimulationProgressReporter::new());
        let waiter = {
            let reporter = Arc::clone(&reporter);
            thread::spawn(move || reporter.wait_for_update())
        };
        while !waiter.is_finished() {
            reporter.update(true, 1.0, 42);
            thread::sleep(Duration::from_millis(5));
        }

        let status = waiter.join().expect("join");
        assert!(status.finished);
        assert_eq!(status.iterations, 42);
        assert!(reporter.snapshot().sequence >= 1);
    }

    #[test]
    fn wait_times_out_without_update() {
        let reporter = SimulationProgressReporter::new();
        assert!(reporter.wait_for_update_timeout(Duration::from_millis(10)).is_none());
    }

    #[test]
    fn throttle_limits_checkpoints() {
        let mut throttle = UpdateThrottle::new(Duration::from_secs(3600));
        assert!(!throttle.is_due());
        let mut eager = UpdateThrottle::new(Duration::ZERO);
        assert!(eager.is_due());
    }

    #[test]
    fn supervision_checkpoint_reports_and_sees_cancel() {
        let controller = Arc::new(SimulationController::new());
        let reporter = Arc::new(SimulationProgressReporter::new());
        let supervision = Supervision {
            controller: Some(Arc::clone(&controller)),
            reporter: Some(Arc::clone(&reporter)),
            update_interval: Duration::ZERO,
        };
        assert!(!supervision.checkpoint(0.25, 10));
        assert_eq!(reporter.snapshot().iterations, 10);

        controller.set_cancelled(true);
        assert!(supervision.checkpoint(0.5, 20));
        supervision.finish(0.5, 20);
        assert!(reporter.is_finished());
        assert!(!Supervision::default().checkpoint(1.0, 0));
    }
}
