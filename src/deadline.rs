//! Monotonic execution deadline shared across an execution.
//!
//! One deadline is created at orchestrator entry and handed to every LM call
//! and sandbox run. External cancellation moves the deadline to now; the
//! effect is identical to expiry.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Shared wall-clock deadline for one execution.
#[derive(Debug)]
pub struct Deadline {
    at: Mutex<Instant>,
    cancelled: AtomicBool,
}

impl Deadline {
    /// Create a deadline `timeout` from now.
    pub fn after(timeout: Duration) -> Self {
        Self {
            at: Mutex::new(Instant::now() + timeout),
            cancelled: AtomicBool::new(false),
        }
    }

    /// Remaining wall-clock time, zero once expired.
    pub fn remaining(&self) -> Duration {
        let at = *self.at.lock().expect("deadline lock poisoned");
        at.saturating_duration_since(Instant::now())
    }

    /// Whether the deadline has passed.
    pub fn expired(&self) -> bool {
        self.remaining().is_zero()
    }

    /// Move the deadline to now. Subsequent checks behave exactly as if the
    /// wall clock ran out.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        let mut at = self.at.lock().expect("deadline lock poisoned");
        *at = Instant::now();
    }

    /// Whether the deadline was cancelled rather than reached.
    pub fn was_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}
