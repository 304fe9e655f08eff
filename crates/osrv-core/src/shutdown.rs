//! Shutdown signaling and in-flight request tracking.
//!
//! The [`ShutdownSignal`] is the transport-facing close flag: accept and
//! keep-alive loops poll it between operations, and `close()` raises it. The
//! [`InFlightTracker`] counts live connections so a graceful close can wait
//! for them to finish before forcing the listener down.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// Shared close flag for a transport.
#[derive(Clone, Default)]
pub struct ShutdownSignal {
    closing: Arc<AtomicBool>,
    forced: Arc<AtomicBool>,
}

impl ShutdownSignal {
    /// Create a signal in the running state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Request a graceful close. Raising the signal twice forces.
    pub fn shutdown(&self) {
        if self.closing.swap(true, Ordering::AcqRel) {
            self.forced.store(true, Ordering::Release);
        }
    }

    /// Request an immediate close.
    pub fn force_shutdown(&self) {
        self.closing.store(true, Ordering::Release);
        self.forced.store(true, Ordering::Release);
    }

    /// Whether close has been requested.
    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    /// Whether a forced close has been requested.
    #[must_use]
    pub fn is_forced(&self) -> bool {
        self.forced.load(Ordering::Acquire)
    }
}

struct TrackerState {
    active: Mutex<usize>,
    idle: Condvar,
}

/// Counts in-flight connections.
#[derive(Clone)]
pub struct InFlightTracker {
    state: Arc<TrackerState>,
}

impl Default for InFlightTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl InFlightTracker {
    /// Create a tracker with nothing in flight.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Arc::new(TrackerState {
                active: Mutex::new(0),
                idle: Condvar::new(),
            }),
        }
    }

    /// Track one unit of work; the returned guard releases it on drop.
    #[must_use]
    pub fn track(&self) -> InFlightGuard {
        *self.state.active.lock() += 1;
        InFlightGuard {
            state: Arc::clone(&self.state),
        }
    }

    /// Current in-flight count.
    #[must_use]
    pub fn count(&self) -> usize {
        *self.state.active.lock()
    }

    /// Wait until nothing is in flight or the timeout elapses. Returns
    /// `true` when idle was reached.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut active = self.state.active.lock();
        while *active > 0 {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let result = self.state.idle.wait_for(&mut active, deadline - now);
            if result.timed_out() && *active > 0 {
                return false;
            }
        }
        true
    }
}

/// RAII guard for one in-flight unit.
pub struct InFlightGuard {
    state: Arc<TrackerState>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let mut active = self.state.active.lock();
        *active = active.saturating_sub(1);
        if *active == 0 {
            self.state.idle.notify_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signal_basic_transitions() {
        let signal = ShutdownSignal::new();
        assert!(!signal.is_shutting_down());
        assert!(!signal.is_forced());

        signal.shutdown();
        assert!(signal.is_shutting_down());
        assert!(!signal.is_forced());

        // Second request escalates to forced.
        signal.shutdown();
        assert!(signal.is_forced());
    }

    #[test]
    fn force_shutdown_sets_both() {
        let signal = ShutdownSignal::new();
        signal.force_shutdown();
        assert!(signal.is_shutting_down());
        assert!(signal.is_forced());
    }

    #[test]
    fn clones_share_state() {
        let signal = ShutdownSignal::new();
        let other = signal.clone();
        signal.shutdown();
        assert!(other.is_shutting_down());
    }

    #[test]
    fn tracker_counts_and_waits() {
        let tracker = InFlightTracker::new();
        assert_eq!(tracker.count(), 0);

        let g1 = tracker.track();
        let g2 = tracker.track();
        assert_eq!(tracker.count(), 2);
        assert!(!tracker.wait_idle(Duration::from_millis(20)));

        drop(g1);
        drop(g2);
        assert!(tracker.wait_idle(Duration::from_millis(20)));
        assert_eq!(tracker.count(), 0);
    }

    #[test]
    fn wait_idle_wakes_on_release_from_other_thread() {
        let tracker = InFlightTracker::new();
        let guard = tracker.track();
        let t = {
            let tracker = tracker.clone();
            std::thread::spawn(move || tracker.wait_idle(Duration::from_secs(5)))
        };
        std::thread::sleep(Duration::from_millis(30));
        drop(guard);
        assert!(t.join().unwrap());
    }
}
