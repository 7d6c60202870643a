//! # Counting semaphore
//!
//! `count` units are available, bounded by `max`. [Semaphore::acquire] takes one unit
//! (sleeping while there are none), [Semaphore::release] puts one back and wakes a
//! single sleeper.
//!
//! The kernel side is the usual Mutex + Condvar pair: the count lives in the mutex, the
//! condvar is what acquirers sleep on. Timed acquire is `wait_timeout_while`, so a timeout
//! never consumes a unit.

use std::{
    sync::{Condvar, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

pub struct Semaphore {
    count: Mutex<u32>,
    max: u32,
    available: Condvar,
}

impl Semaphore {
    pub fn new(initial: u32, max: u32) -> Self {
        assert!(max > 0, "semaphore needs a positive maximum count");
        assert!(
            initial <= max,
            "semaphore initial count {initial} exceeds maximum {max}"
        );
        Self {
            count: Mutex::new(initial),
            max,
            available: Condvar::new(),
        }
    }

    /// A binary semaphore with its only unit taken.
    pub fn empty() -> Self {
        Self::new(0, 1)
    }

    fn count(&self) -> MutexGuard<'_, u32> {
        // a poisoned count is still a valid number
        self.count.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn acquire(&self) {
        let mut count = self.count();
        while *count == 0 {
            count = self
                .available
                .wait(count)
                .unwrap_or_else(PoisonError::into_inner);
        }
        *count -= 1;
    }

    /// Returns false if nothing was released within the timeout.
    pub fn acquire_timeout(&self, timeout: Duration) -> bool {
        let count = self.count();
        let (mut count, _) = self
            .available
            .wait_timeout_while(count, timeout, |count| *count == 0)
            .unwrap_or_else(PoisonError::into_inner);

        // judge by the count, not by the timeout flag: a release may land right at the deadline
        if *count == 0 {
            return false;
        }
        *count -= 1;
        true
    }

    /// `None` waits forever, like [Semaphore::acquire].
    pub fn acquire_millis(&self, millis: Option<u64>) -> bool {
        match millis {
            Some(millis) => self.acquire_timeout(Duration::from_millis(millis)),
            None => {
                self.acquire();
                true
            }
        }
    }

    pub fn release(&self) {
        let mut count = self.count();
        // going past the maximum is a broken protocol, not something to recover from
        assert!(
            *count < self.max,
            "semaphore released past its maximum count {}",
            self.max
        );
        *count += 1;
        drop(count);
        self.available.notify_one();
    }
}

impl std::fmt::Debug for Semaphore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Semaphore")
            .field("count", &*self.count())
            .field("max", &self.max)
            .finish()
    }
}

#[cfg(test)]
mod test {
    use std::{
        thread::{scope, sleep},
        time::Instant,
    };

    use super::*;

    #[test]
    fn times_out_without_release() {
        let sem = Semaphore::new(0, 1);
        let started = Instant::now();
        assert!(!sem.acquire_timeout(Duration::from_millis(100)));
        assert!(started.elapsed() >= Duration::from_millis(100));
    }

    #[test]
    fn release_within_window_wakes_acquirer() {
        let sem = Semaphore::new(0, 1);
        scope(|s| {
            s.spawn(|| {
                sleep(Duration::from_millis(20));
                sem.release();
            });
            assert!(sem.acquire_millis(Some(2_000)));
        });
        // the unit got consumed
        assert!(!sem.acquire_timeout(Duration::from_millis(1)));
    }

    #[test]
    fn counts_units() {
        let sem = Semaphore::new(2, 3);
        sem.acquire();
        sem.acquire();
        assert!(!sem.acquire_timeout(Duration::ZERO));
        sem.release();
        sem.release();
        sem.release();
        assert!(sem.acquire_millis(None));
    }

    #[test]
    #[should_panic(expected = "past its maximum")]
    fn release_past_max_is_fatal() {
        let sem = Semaphore::new(1, 1);
        sem.release();
    }

    #[test]
    fn bounds_concurrency() {
        use std::sync::atomic::{AtomicU32, Ordering::SeqCst};

        let sem = Semaphore::new(2, 2);
        let inside = AtomicU32::new(0);
        let peak = AtomicU32::new(0);
        scope(|s| {
            for _ in 0..6 {
                s.spawn(|| {
                    sem.acquire();
                    let now = inside.fetch_add(1, SeqCst) + 1;
                    peak.fetch_max(now, SeqCst);
                    sleep(Duration::from_millis(10));
                    inside.fetch_sub(1, SeqCst);
                    sem.release();
                });
            }
        });
        assert!(peak.load(SeqCst) <= 2);
    }
}
