//! An edge-triggered wake primitive that composes with socket readiness in
//! a single `tokio::select!`, playing the role spec'd for a process-local
//! latch woken from a signal handler or from another task.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Notify;

#[derive(Clone, Default)]
pub struct Latch {
    inner: Arc<LatchInner>,
}

#[derive(Default)]
struct LatchInner {
    set: AtomicBool,
    notify: Notify,
}

impl Latch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the latch and wake exactly one waiter if any is parked in
    /// `wait()`. Safe to call from any thread, including a signal handler's
    /// delivery thread.
    pub fn set(&self) {
        self.inner.set.store(true, Ordering::SeqCst);
        self.inner.notify.notify_one();
    }

    pub fn reset(&self) {
        self.inner.set.store(false, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.inner.set.load(Ordering::SeqCst)
    }

    /// Wait until the latch is set. If it is already set, returns
    /// immediately. Races with `set()` are handled by registering for the
    /// notification before re-checking the flag.
    pub async fn wait(&self) {
        loop {
            if self.inner.set.swap(false, Ordering::SeqCst) {
                return;
            }
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.inner.set.swap(false, Ordering::SeqCst) {
                return;
            }
            notified.await;
        }
    }
}
