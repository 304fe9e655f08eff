//! Opt-in POSIX signal subscription.
//!
//! Installing the listener registers handlers for SIGINT and SIGTERM that
//! only flip an atomic flag (the handler must stay async-signal-safe). A
//! watcher thread turns the flag into waker notifications so async code can
//! await the signal and then drive `close(force = false)`.
//!
//! Signal disposition is process-wide state; installation is idempotent and
//! everything else stays per-listener.

#![allow(unsafe_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::task::Waker;
use std::time::Duration;

use parking_lot::Mutex;

static SIGNAL_PENDING: AtomicBool = AtomicBool::new(false);
static WAKERS: OnceLock<Arc<Mutex<Vec<Waker>>>> = OnceLock::new();
static INSTALLED: AtomicBool = AtomicBool::new(false);

fn wakers() -> &'static Arc<Mutex<Vec<Waker>>> {
    WAKERS.get_or_init(|| Arc::new(Mutex::new(Vec::new())))
}

#[cfg(unix)]
extern "C" fn on_signal(_sig: libc::c_int) {
    // Async-signal-safe: a single atomic store, nothing else.
    SIGNAL_PENDING.store(true, Ordering::Release);
}

/// Waits for SIGINT/SIGTERM.
#[derive(Clone)]
pub struct SignalListener {
    _priv: (),
}

impl SignalListener {
    /// Install the SIGINT/SIGTERM handlers (idempotent) and start the
    /// watcher thread.
    ///
    /// On non-unix platforms this is a no-op listener that never fires.
    #[must_use]
    pub fn install() -> Self {
        if !INSTALLED.swap(true, Ordering::SeqCst) {
            #[cfg(unix)]
            unsafe {
                libc::signal(libc::SIGINT, on_signal as libc::sighandler_t);
                libc::signal(libc::SIGTERM, on_signal as libc::sighandler_t);
            }

            let wakers = Arc::clone(wakers());
            std::thread::Builder::new()
                .name("osrv-signal-watch".to_string())
                .spawn(move || loop {
                    if SIGNAL_PENDING.load(Ordering::Acquire) {
                        for waker in wakers.lock().drain(..) {
                            waker.wake();
                        }
                    }
                    std::thread::park_timeout(Duration::from_millis(100));
                })
                .ok();
        }
        Self { _priv: () }
    }

    /// Whether a shutdown signal has fired.
    #[must_use]
    pub fn triggered(&self) -> bool {
        SIGNAL_PENDING.load(Ordering::Acquire)
    }

    /// Reset the flag (tests and multi-phase shutdown flows).
    pub fn reset(&self) {
        SIGNAL_PENDING.store(false, Ordering::Release);
    }

    /// Wait until a signal fires.
    pub async fn wait(&self) {
        std::future::poll_fn(|cx| {
            if self.triggered() {
                return std::task::Poll::Ready(());
            }
            let wakers = wakers();
            let mut guard = wakers.lock();
            if !guard.iter().any(|w| w.will_wake(cx.waker())) {
                guard.push(cx.waker().clone());
            }
            drop(guard);
            if self.triggered() {
                std::task::Poll::Ready(())
            } else {
                std::task::Poll::Pending
            }
        })
        .await;
    }
}
