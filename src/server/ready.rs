//! Single-slot readiness signal.
//!
//! Used by the accept loop in confirmed-handoff mode: the loop resets the
//! signal, spawns a handler, and waits until the handler task signals that
//! it has taken ownership of the connection.

use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Notify;

/// A binary signal that can be reset, set, and awaited.
#[derive(Debug, Default)]
pub struct ReadySignal {
    set: AtomicBool,
    notify: Notify,
}

impl ReadySignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Clear the signal.
    pub fn reset(&self) {
        self.set.store(false, Ordering::Release);
    }

    /// Set the signal and wake every waiter.
    pub fn signal(&self) {
        self.set.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    pub fn is_set(&self) -> bool {
        self.set.load(Ordering::Acquire)
    }

    /// Wait until the signal is set.
    ///
    /// Returns immediately if it was set after the last [`reset`](Self::reset).
    pub async fn wait(&self) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before checking the flag so a concurrent `signal`
            // cannot slip in between.
            notified.as_mut().enable();

            if self.is_set() {
                return;
            }
            notified.await;
        }
    }
}
