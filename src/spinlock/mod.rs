/*
 * Short-hold exclusive lock.
 *
 * Same shape as a classic spin lock: an atomic state and the protected value
 * in an UnsafeCell, handed out through a guard. The difference is that a waiter
 * only spins for a short while and then sleeps in the kernel (futex wait),
 * so a long holder doesn't burn the waiting cores.
 *
 * It's NOT reentrant: locking it twice from the same thread deadlocks.
 */

use std::{
    cell::UnsafeCell,
    ops::{Deref, DerefMut},
    sync::atomic::{
        AtomicU32,
        Ordering::{Acquire, Relaxed, Release},
    },
};

use atomic_wait::{wait, wake_one};

const UNLOCKED: u32 = 0;
const LOCKED: u32 = 1;
/// locked and somebody may be sleeping on the state
const CONTENDED: u32 = 2;

pub struct Spinlock<Y = ()> {
    state: AtomicU32,
    value: UnsafeCell<Y>,
}

// only one thread at a time gets to the value => Send is enough
unsafe impl<Y> Sync for Spinlock<Y> where Y: Send {}

impl<Y> Spinlock<Y> {
    pub const fn new(value: Y) -> Self {
        Self {
            state: AtomicU32::new(UNLOCKED),
            value: UnsafeCell::new(value),
        }
    }

    pub fn lock(&self) -> SpinlockGuard<'_, Y> {
        self.enter();
        SpinlockGuard { lock: self }
    }

    /// Raw acquire, blocks until the lock is ours. Pair it with [Spinlock::leave].
    pub fn enter(&self) {
        if self
            .state
            .compare_exchange(UNLOCKED, LOCKED, Acquire, Relaxed)
            .is_err()
        {
            Self::enter_contended(&self.state);
        }
    }

    #[cold]
    fn enter_contended(state: &AtomicU32) {
        let mut spin_count = 0;

        // plain loads while spinning, only 1 is worth waiting for: 2 means others already gave up
        while state.load(Relaxed) == LOCKED && spin_count < 100 {
            spin_count += 1;
            std::hint::spin_loop();
        }

        if state
            .compare_exchange(UNLOCKED, LOCKED, Acquire, Relaxed)
            .is_ok()
        {
            return;
        }

        // leave 2 behind us so the holder knows there's someone to wake
        while state.swap(CONTENDED, Acquire) != UNLOCKED {
            wait(state, CONTENDED);
        }
    }

    /// Raw release.
    ///
    /// # Safety
    /// The calling thread must hold the lock through [Spinlock::enter] and must not
    /// have a live guard or a reference obtained through one.
    pub unsafe fn leave(&self) {
        self.release();
    }

    fn release(&self) {
        if self.state.swap(UNLOCKED, Release) == CONTENDED {
            wake_one(&self.state);
        }
    }

    pub fn into_inner(self) -> Y {
        self.value.into_inner()
    }
}

impl<Y: Default> Default for Spinlock<Y> {
    fn default() -> Self {
        Self::new(Y::default())
    }
}

pub struct SpinlockGuard<'a, Y> {
    lock: &'a Spinlock<Y>,
}

unsafe impl<Y> Sync for SpinlockGuard<'_, Y> where Y: Sync {}

impl<Y> Deref for SpinlockGuard<'_, Y> {
    type Target = Y;
    fn deref(&self) -> &Y {
        // SAFETY: the guard exists only while the lock is held
        unsafe { &*self.lock.value.get() }
    }
}

impl<Y> DerefMut for SpinlockGuard<'_, Y> {
    fn deref_mut(&mut self) -> &mut Y {
        // SAFETY: the guard exists only while the lock is held
        unsafe { &mut *self.lock.value.get() }
    }
}

impl<Y> Drop for SpinlockGuard<'_, Y> {
    fn drop(&mut self) {
        self.lock.release();
    }
}

#[cfg(test)]
mod test {
    use std::{
        sync::atomic::{AtomicBool, Ordering::SeqCst},
        thread::{scope, sleep},
        time::Duration,
    };

    use super::*;

    #[test]
    fn counts_under_contention() {
        let counter = Spinlock::new(0u64);
        scope(|s| {
            for _ in 0..8 {
                s.spawn(|| {
                    for _ in 0..10_000 {
                        *counter.lock() += 1;
                    }
                });
            }
        });
        assert_eq!(counter.into_inner(), 80_000);
    }

    #[test]
    fn waiter_sleeps_until_leave() {
        let lock = Spinlock::new(Vec::new());
        let entered = AtomicBool::new(false);

        lock.enter();
        scope(|s| {
            s.spawn(|| {
                lock.lock().push(2);
                entered.store(true, SeqCst);
            });

            // long enough for the other thread to give up spinning
            sleep(Duration::from_millis(50));
            assert!(!entered.load(SeqCst));

            // SAFETY: entered above, no guard around
            unsafe {
                (*lock.value.get()).push(1);
                lock.leave();
            }
        });

        assert!(entered.load(SeqCst));
        assert_eq!(*lock.lock(), [1, 2]);
    }
}
