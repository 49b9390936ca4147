use std::sync::atomic::{AtomicBool, Ordering::SeqCst};
use std::sync::Arc;

use tokio::sync::Notify;

/// One-shot broadcast signal tied to a session's lifetime.
///
/// Every clone observes the same signal. Firing is idempotent; tasks that
/// start waiting after the signal has fired resolve immediately.
#[derive(Clone, Default)]
pub struct Terminator {
    inner: Arc<TerminatorInner>,
}

#[derive(Default)]
struct TerminatorInner {
    notify: Notify,
    fired: AtomicBool,
}

impl Terminator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fire the signal, waking every waiter. Returns `true` on the first
    /// call only.
    pub fn fire(&self) -> bool {
        let prev = self.inner.fired.swap(true, SeqCst);
        self.inner.notify.notify_waiters();
        !prev
    }

    pub fn is_fired(&self) -> bool {
        self.inner.fired.load(SeqCst)
    }

    /// Resolves once the signal has fired.
    pub async fn fired(&self) {
        while !self.is_fired() {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            // Register before the re-check so a fire() in between still wakes us.
            notified.as_mut().enable();
            if self.is_fired() {
                return;
            }
            notified.await;
        }
    }
}

/// Best-effort text of a caught panic payload.
pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    panic
        .downcast_ref::<&'static str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}
