//! Root cancellation token shared by the daemon, the workers, and every
//! child process the tool adapter spawns.
//!
//! One flag, tripped once (SIGINT/SIGTERM or tests). Sleeps are
//! condvar-based so a shutdown interrupts an idle worker immediately
//! instead of after its poll interval.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

struct Inner {
    cancelled: AtomicBool,
    lock: Mutex<()>,
    wake: Condvar,
}

impl CancelToken {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                cancelled: AtomicBool::new(false),
                lock: Mutex::new(()),
                wake: Condvar::new(),
            }),
        }
    }

    /// Trip the token and wake every sleeper. Idempotent.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        let _guard = self.inner.lock.lock().unwrap_or_else(|e| e.into_inner());
        self.inner.wake.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Sleep for `dur` or until cancelled, whichever comes first.
    /// Returns true when the sleep ran to completion.
    pub fn sleep(&self, dur: Duration) -> bool {
        if self.is_cancelled() {
            return false;
        }
        let guard = self.inner.lock.lock().unwrap_or_else(|e| e.into_inner());
        let (_guard, timeout) = self
            .inner
            .wake
            .wait_timeout_while(guard, dur, |_| !self.is_cancelled())
            .unwrap_or_else(|e| e.into_inner());
        timeout.timed_out()
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}
