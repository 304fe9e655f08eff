//! Background-task registry for `waitUntil`.
//!
//! Each request receives a clonable [`WaitUntil`] sink. Registered tasks may
//! outlive their request; a graceful close waits for the whole set with a
//! single overall timeout. Tasks are driven to completion on detached worker
//! threads, each with its own single-threaded runtime — the runtime exposes
//! no task spawner, so this mirrors how the rest of the workspace drives
//! servers off the main thread.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

struct TaskState {
    active: Mutex<usize>,
    idle: Condvar,
}

/// Guard that deregisters a task when dropped, so a panicking task cannot
/// leak an active count and wedge the drain.
struct ActiveGuard {
    state: Arc<TaskState>,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        let mut active = self.state.active.lock();
        *active = active.saturating_sub(1);
        if *active == 0 {
            self.state.idle.notify_all();
        }
    }
}

/// The server-owned registry of in-flight background tasks.
pub struct TaskSet {
    state: Arc<TaskState>,
}

impl Default for TaskSet {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskSet {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Arc::new(TaskState {
                active: Mutex::new(0),
                idle: Condvar::new(),
            }),
        }
    }

    /// A clonable sink for registering tasks against this set.
    #[must_use]
    pub fn sink(&self) -> WaitUntil {
        WaitUntil {
            state: Arc::clone(&self.state),
        }
    }

    /// Number of tasks currently registered.
    #[must_use]
    pub fn active(&self) -> usize {
        *self.state.active.lock()
    }

    /// Wait until the set is empty or the timeout elapses.
    ///
    /// Returns `true` when the set drained, `false` on timeout (tasks keep
    /// running until process exit).
    pub fn drain(&self, timeout: Duration) -> bool {
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

/// Per-request sink for fire-and-forget background work.
#[derive(Clone)]
pub struct WaitUntil {
    state: Arc<TaskState>,
}

impl WaitUntil {
    /// Register a task. It is driven on a detached worker and deregistered
    /// on completion (or panic).
    pub fn register<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        *self.state.active.lock() += 1;
        let guard = ActiveGuard {
            state: Arc::clone(&self.state),
        };
        std::thread::spawn(move || {
            let _guard = guard;
            match asupersync::runtime::RuntimeBuilder::current_thread().build() {
                Ok(rt) => {
                    rt.block_on(task);
                }
                Err(err) => {
                    crate::logging::error(
                        "osrv::tasks",
                        &format!("background task runtime failed to build: {err}; task dropped"),
                    );
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn drain_on_empty_set_returns_immediately() {
        let set = TaskSet::new();
        assert_eq!(set.active(), 0);
        assert!(set.drain(Duration::from_millis(1)));
    }

    #[test]
    fn tasks_complete_and_deregister() {
        let set = TaskSet::new();
        let sink = set.sink();
        let counter = Arc::new(AtomicUsize::new(0));

        for _ in 0..4 {
            let counter = counter.clone();
            sink.register(async move {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }

        assert!(set.drain(Duration::from_secs(5)), "tasks should drain");
        assert_eq!(counter.load(Ordering::SeqCst), 4);
        assert_eq!(set.active(), 0);
    }

    #[test]
    fn drain_times_out_on_stuck_task() {
        let set = TaskSet::new();
        let sink = set.sink();
        sink.register(async {
            // Block the worker thread well past the drain timeout.
            std::thread::sleep(Duration::from_millis(500));
        });

        let start = Instant::now();
        assert!(!set.drain(Duration::from_millis(50)));
        assert!(start.elapsed() < Duration::from_millis(400));

        // Eventually the task finishes and the set empties.
        assert!(set.drain(Duration::from_secs(5)));
    }

    #[test]
    fn sink_clones_share_one_set() {
        let set = TaskSet::new();
        let a = set.sink();
        let b = a.clone();
        a.register(async {});
        b.register(async {});
        assert!(set.drain(Duration::from_secs(5)));
    }
}
