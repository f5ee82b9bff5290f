use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

/// Something a [`CancellationToken`] can cancel.
pub trait Cancellable: Send + Sync {
    /// Drop everything queued and abort in-flight work.
    fn cancel_now(&self);

    /// Drop everything queued and let in-flight work finish first.
    fn cancel_after_current(&self);
}

/// Handle returned by `fire()` and the stream connect calls.
///
/// The token never keeps its orchestrator alive. The first cancel call
/// consumes the back-reference, so any later call is a no-op.
pub struct CancellationToken {
    target: Mutex<Option<Weak<dyn Cancellable>>>,
}

impl CancellationToken {
    pub(crate) fn new(target: Weak<dyn Cancellable>) -> Self {
        Self { target: Mutex::new(Some(target)) }
    }

    pub fn cancel_now(&self) {
        if let Some(target) = self.take() {
            target.cancel_now();
        }
    }

    pub fn cancel_after_current_task(&self) {
        if let Some(target) = self.take() {
            target.cancel_after_current();
        }
    }

    /// Whether a cancel call would still reach the orchestrator.
    pub fn is_active(&self) -> bool {
        self.target.lock().as_ref().is_some_and(|w| w.strong_count() > 0)
    }

    fn take(&self) -> Option<Arc<dyn Cancellable>> { self.target.lock().take()?.upgrade() }
}

impl fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancellationToken").field("active", &self.is_active()).finish()
    }
}
