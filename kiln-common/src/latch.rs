//! Count-down latch used to gate a procedure on outstanding dependencies.

use std::sync::{Condvar, Mutex, PoisonError};
use std::time::Duration;

/// One-shot count-down latch.
///
/// The owning round arms the latch with the number of unsatisfied
/// dependencies; result deliveries count it down and the procedure thread
/// blocks in [`CountDownLatch::wait`] until it reaches zero. Counting below
/// zero saturates.
#[derive(Debug)]
pub struct CountDownLatch {
    count: Mutex<usize>,
    zeroed: Condvar,
}

impl CountDownLatch {
    /// Creates a latch armed with `count` outstanding events.
    #[must_use]
    pub fn new(count: usize) -> Self {
        Self {
            count: Mutex::new(count),
            zeroed: Condvar::new(),
        }
    }

    /// Current outstanding count.
    #[must_use]
    pub fn count(&self) -> usize {
        *self.count.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Records one completed event, waking waiters when the count reaches
    /// zero.
    pub fn count_down(&self) {
        let mut count = self.count.lock().unwrap_or_else(PoisonError::into_inner);
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.zeroed.notify_all();
        }
    }

    /// Forces the count to zero, waking every waiter.
    ///
    /// Used by error paths: a failed remote batch may never deliver its
    /// remaining dependencies, and the blocked procedure must wake to
    /// observe the pending error.
    pub fn open(&self) {
        let mut count = self.count.lock().unwrap_or_else(PoisonError::into_inner);
        *count = 0;
        self.zeroed.notify_all();
    }

    /// Blocks until the count reaches zero.
    pub fn wait(&self) {
        let mut count = self.count.lock().unwrap_or_else(PoisonError::into_inner);
        while *count > 0 {
            count = self
                .zeroed
                .wait(count)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Blocks until the count reaches zero or the timeout elapses.
    ///
    /// Returns whether the latch reached zero.
    #[must_use]
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut count = self.count.lock().unwrap_or_else(PoisonError::into_inner);
        while *count > 0 {
            let (guard, result) = self
                .zeroed
                .wait_timeout(count, timeout)
                .unwrap_or_else(PoisonError::into_inner);
            count = guard;
            if result.timed_out() {
                return *count == 0;
            }
        }
        true
    }
}
