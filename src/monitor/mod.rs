//! # Monitor
//!
//! A reentrant lock with a single condition variable, put together from one [Spinlock]
//! and three [Semaphore]s:
//! - `owner_sem` (1 unit) - whoever holds the unit owns the monitor
//! - `wait_sem` (starts empty) - a notifier hands one wake-up to one waiter through it
//! - `notify_sem` (starts empty) - the woken waiter hands an acknowledgement back
//!
//! The spinlock only guards the bookkeeping: the owner, the nesting depth and how many
//! threads sit in [Monitor::wait].
//!
//! ## The handshake
//!
//! [Monitor::notify] doesn't fire and forget. It releases `wait_sem` and then sleeps on
//! `notify_sem` until the woken thread confirms it got the signal. By then the waiter is
//! off the wait list and queued on `owner_sem`, so `notify` returning means the wake-up
//! has been observed. Without it a second notify could land on `wait_sem` before the first
//! one was picked up and one of them would be lost (the semaphore holds a single unit).
//!
//! The protected value is only reachable through a [MonitorGuard] and only as `&Y`:
//! the owner may hold several nested guards at once. Use a `Cell`/`RefCell` inside to mutate.

use std::{cell::Cell, marker::PhantomData, ops::Deref, thread::ThreadId};

use crate::{semaphore::Semaphore, spinlock::Spinlock, thread::Thread};

#[derive(Default)]
struct Ownership {
    owner: Option<ThreadId>,
    /// nesting depth of the owner
    enter_count: u32,
    /// threads parked in wait()
    wait_count: u32,
}

impl Ownership {
    fn is_held_by(&self, id: ThreadId) -> bool {
        self.owner == Some(id) && self.enter_count > 0
    }
}

pub struct Monitor<Y = ()> {
    lock: Spinlock<Ownership>,
    owner_sem: Semaphore,
    wait_sem: Semaphore,
    notify_sem: Semaphore,
    value: Y,
}

// the value is only touched by the owning thread => Send is enough, like for a reentrant mutex
unsafe impl<Y> Sync for Monitor<Y> where Y: Send {}

impl<Y> Monitor<Y> {
    pub fn new(value: Y) -> Self {
        Self {
            lock: Spinlock::new(Ownership::default()),
            owner_sem: Semaphore::new(1, 1),
            wait_sem: Semaphore::empty(),
            notify_sem: Semaphore::empty(),
            value,
        }
    }

    /// Blocks until the monitor is ours. Nested calls from the owner just go one level deeper.
    pub fn enter(&self) -> MonitorGuard<'_, Y> {
        let me = Thread::id();
        {
            let mut own = self.lock.lock();
            if own.is_held_by(me) {
                own.enter_count += 1;
                return MonitorGuard::new(self);
            }
        }

        self.owner_sem.acquire();

        let mut own = self.lock.lock();
        own.owner = Some(me);
        own.enter_count = 1;
        MonitorGuard::new(self)
    }

    fn assert_owned(&self, own: &Ownership, op: &str) {
        assert!(
            own.is_held_by(Thread::id()),
            "Monitor::{op} called by a thread that doesn't own the monitor"
        );
    }

    fn leave(&self) {
        let mut own = self.lock.lock();
        self.assert_owned(&own, "leave");
        own.enter_count -= 1;
        if own.enter_count == 0 {
            own.owner = None;
            drop(own);
            self.owner_sem.release();
        }
    }

    /// Gives the monitor up entirely (whatever the nesting), sleeps until notified and
    /// takes it back with the same nesting depth.
    pub fn wait(&self) {
        let (me, depth) = {
            let mut own = self.lock.lock();
            self.assert_owned(&own, "wait");
            let saved = (Thread::id(), own.enter_count);
            own.enter_count = 0;
            own.owner = None;
            own.wait_count += 1;
            saved
        };
        self.owner_sem.release();

        self.wait_sem.acquire();
        self.lock.lock().wait_count -= 1;
        // let the notifier go, we're off the wait list
        self.notify_sem.release();

        self.owner_sem.acquire();
        let mut own = self.lock.lock();
        own.owner = Some(me);
        own.enter_count = depth;
    }

    fn has_waiters(&self, op: &str) -> bool {
        let own = self.lock.lock();
        self.assert_owned(&own, op);
        own.wait_count > 0
    }

    fn wake_one(&self) {
        self.wait_sem.release();
        self.notify_sem.acquire();
    }

    /// Wakes one waiter, if any, and returns once it has taken the wake-up.
    pub fn notify(&self) {
        if self.has_waiters("notify") {
            self.wake_one();
        }
    }

    /// Wakes every thread waiting right now, one handshake at a time.
    pub fn notify_all(&self) {
        // the woken ones queue on owner_sem, which we hold => nobody joins the list meanwhile
        while self.has_waiters("notify_all") {
            self.wake_one();
        }
    }

    pub fn into_inner(self) -> Y {
        self.value
    }
}

impl<Y: Default> Default for Monitor<Y> {
    fn default() -> Self {
        Self::new(Y::default())
    }
}

/// Proof of ownership. Dropping it is the `leave`.
pub struct MonitorGuard<'a, Y> {
    monitor: &'a Monitor<Y>,
    // leaving from another thread would break the ownership check
    _not_send: PhantomData<*const ()>,
}

impl<'a, Y> MonitorGuard<'a, Y> {
    fn new(monitor: &'a Monitor<Y>) -> Self {
        Self {
            monitor,
            _not_send: PhantomData,
        }
    }

    pub fn wait(&self) {
        self.monitor.wait();
    }

    pub fn notify(&self) {
        self.monitor.notify();
    }

    pub fn notify_all(&self) {
        self.monitor.notify_all();
    }

    pub fn leave(self) {
        drop(self);
    }

    /// Keeps waiting while `condition` holds on the protected value.
    pub fn wait_while(&self, mut condition: impl FnMut(&Y) -> bool) {
        while condition(&self.monitor.value) {
            self.monitor.wait();
        }
    }
}

impl<Y> Deref for MonitorGuard<'_, Y> {
    type Target = Y;
    fn deref(&self) -> &Y {
        &self.monitor.value
    }
}

impl<Y> Drop for MonitorGuard<'_, Y> {
    fn drop(&mut self) {
        self.monitor.leave();
    }
}

/// A plain flag to wait on, for when the monitor protects nothing else.
pub type Signal = Monitor<Cell<bool>>;

#[cfg(test)]
mod test {
    use std::{
        cell::RefCell,
        collections::VecDeque,
        sync::atomic::{AtomicBool, AtomicU32, Ordering::SeqCst},
        thread::{scope, sleep},
        time::Duration,
    };

    use super::*;

    #[test]
    fn nested_enters_need_as_many_leaves() {
        let monitor = Monitor::new(());
        let outer = monitor.enter();
        let other_entered = AtomicBool::new(false);

        scope(|s| {
            s.spawn(|| {
                let _g = monitor.enter();
                other_entered.store(true, SeqCst);
            });

            let inner = monitor.enter();
            let innermost = monitor.enter();
            drop(innermost);
            drop(inner);
            sleep(Duration::from_millis(50));
            // one level still held
            assert!(!other_entered.load(SeqCst));
            drop(outer);
        });

        assert!(other_entered.load(SeqCst));
    }

    #[test]
    fn notify_without_waiters_is_noop() {
        let monitor = Monitor::new(());
        let g = monitor.enter();
        g.notify();
        g.notify_all();
        g.leave();
    }

    #[test]
    fn notify_returns_after_waiter_took_the_signal() {
        let signal = Signal::default();
        for _ in 0..200 {
            scope(|s| {
                s.spawn(|| {
                    let g = signal.enter();
                    g.set(true);
                    g.wait();
                    g.set(false);
                });

                loop {
                    let g = signal.enter();
                    if g.get() {
                        g.notify();
                        // the waiter is off the list already
                        assert_eq!(signal.lock.lock().wait_count, 0);
                        // and can't have run past wait(): we still own the monitor
                        assert!(g.get());
                        break;
                    }
                    drop(g);
                    std::thread::yield_now();
                }
            });
            assert!(!signal.enter().get());
        }
    }

    #[test]
    fn notify_all_wakes_each_waiter_once() {
        const WAITERS: u32 = 6;
        let monitor = Monitor::new(Cell::new(0u32));
        let woken = AtomicU32::new(0);

        scope(|s| {
            for _ in 0..WAITERS {
                s.spawn(|| {
                    let g = monitor.enter();
                    g.set(g.get() + 1);
                    g.wait();
                    woken.fetch_add(1, SeqCst);
                });
            }

            loop {
                let g = monitor.enter();
                // each waiter counts itself and waits without letting go in between
                if g.get() == WAITERS {
                    assert_eq!(woken.load(SeqCst), 0);
                    g.notify_all();
                    assert_eq!(monitor.lock.lock().wait_count, 0);
                    break;
                }
                drop(g);
                sleep(Duration::from_millis(1));
            }
        });

        assert_eq!(woken.load(SeqCst), WAITERS);
    }

    #[test]
    fn producer_consumer_moves_every_item_once() {
        let queue = Monitor::new(RefCell::new(VecDeque::new()));
        let mut consumed = Vec::new();

        scope(|s| {
            s.spawn(|| {
                for item in 0..5 {
                    let g = queue.enter();
                    g.borrow_mut().push_back(item);
                    g.notify();
                    drop(g);
                    sleep(Duration::from_millis(5));
                }
            });

            while consumed.len() < 5 {
                let g = queue.enter();
                g.wait_while(|q| q.borrow().is_empty());
                let item = g.borrow_mut().pop_front();
                consumed.extend(item);
            }
        });

        assert_eq!(consumed, [0, 1, 2, 3, 4]);
    }

    #[test]
    fn wait_restores_nesting() {
        let monitor = Monitor::new(Cell::new(false));
        scope(|s| {
            let outer = monitor.enter();
            let inner = monitor.enter();

            s.spawn(|| {
                let g = monitor.enter();
                g.set(true);
                g.notify();
            });

            inner.wait_while(|flag| !flag.get());
            assert_eq!(monitor.lock.lock().enter_count, 2);
            drop(inner);
            assert_eq!(monitor.lock.lock().enter_count, 1);
            drop(outer);
        });
    }

    #[test]
    #[should_panic(expected = "doesn't own the monitor")]
    fn notify_needs_ownership() {
        Monitor::new(()).notify();
    }

    #[test]
    #[should_panic(expected = "doesn't own the monitor")]
    fn wait_needs_ownership() {
        Monitor::new(()).wait();
    }

    #[test]
    fn owner_is_per_thread() {
        let monitor = Monitor::new(());
        let _g = monitor.enter();
        scope(|s| {
            let stranger = s.spawn(|| monitor.notify());
            assert!(stranger.join().is_err());
        });
    }
}
