//! # Registry of live threads
//!
//! Maps native thread ids to their [ThreadObject]s. The registry never owns an object:
//! it keeps `Weak`s, the owner of a wrapper decides when it goes away. One lock guards
//! both the table and the main-thread designation.
//!
//! The main role goes to the first object that ever registers and is never handed to
//! anyone else: once that object is cleaned up there's simply no main thread anymore.

use std::{
    collections::HashMap,
    sync::{Arc, OnceLock, Weak},
    thread::ThreadId,
};

use crate::spinlock::{Spinlock, SpinlockGuard};

use super::ThreadObject;

#[derive(Default)]
pub(crate) struct Entries {
    threads: HashMap<ThreadId, Weak<ThreadObject>>,
    main: Option<Weak<ThreadObject>>,
    main_claimed: bool,
}

impl Entries {
    /// Every registered object that is still around. Don't let the `Arc`s die under
    /// the lock: the last one runs the object's drop and its user data deinit.
    pub(crate) fn live(&self) -> impl Iterator<Item = Arc<ThreadObject>> + '_ {
        self.threads.values().filter_map(Weak::upgrade)
    }
}

#[derive(Default)]
pub struct ThreadRegistry {
    entries: Spinlock<Entries>,
}

impl ThreadRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide instance, created on first use.
    pub fn global() -> &'static ThreadRegistry {
        static REGISTRY: OnceLock<ThreadRegistry> = OnceLock::new();
        REGISTRY.get_or_init(ThreadRegistry::new)
    }

    pub(crate) fn lock(&self) -> SpinlockGuard<'_, Entries> {
        self.entries.lock()
    }

    /// Adds `object` under `id` unless a live object already sits there.
    /// Returns true if the object became the main thread.
    pub(crate) fn register(&self, id: ThreadId, object: &Arc<ThreadObject>) -> bool {
        let mut entries = self.entries.lock();

        let became_main = !entries.main_claimed;
        if became_main {
            entries.main_claimed = true;
            entries.main = Some(Arc::downgrade(object));
        }

        let slot = entries
            .threads
            .entry(id)
            .or_insert_with(|| Arc::downgrade(object));
        if slot.strong_count() == 0 {
            // left behind by an object that was dropped without cleanup
            *slot = Arc::downgrade(object);
        }
        became_main
    }

    /// Drops `object` from the table (and from the main role). Entries of other objects
    /// under the same id are left alone.
    pub(crate) fn deregister(&self, id: ThreadId, object: &ThreadObject) {
        let mut entries = self.entries.lock();

        if entries
            .main
            .as_ref()
            .is_some_and(|main| std::ptr::eq(main.as_ptr(), object))
        {
            entries.main = None;
        }

        if entries
            .threads
            .get(&id)
            .is_some_and(|found| std::ptr::eq(found.as_ptr(), object))
        {
            entries.threads.remove(&id);
        }

        if entries.threads.is_empty() {
            entries.threads.shrink_to_fit();
        }
    }

    pub fn lookup(&self, id: ThreadId) -> Option<Arc<ThreadObject>> {
        self.entries.lock().threads.get(&id).and_then(Weak::upgrade)
    }

    /// Is `object` still the one registered under `id`?
    pub fn contains(&self, id: ThreadId, object: &ThreadObject) -> bool {
        self.entries
            .lock()
            .threads
            .get(&id)
            .is_some_and(|found| std::ptr::eq(found.as_ptr(), object))
    }

    pub fn main(&self) -> Option<Arc<ThreadObject>> {
        self.entries.lock().main.as_ref().and_then(Weak::upgrade)
    }

    pub fn is_main(&self, object: &ThreadObject) -> bool {
        self.entries
            .lock()
            .main
            .as_ref()
            .is_some_and(|main| std::ptr::eq(main.as_ptr(), object))
    }

    pub fn len(&self) -> usize {
        // counting only, upgrading here could make us the last owner
        self.entries
            .lock()
            .threads
            .values()
            .filter(|found| found.strong_count() > 0)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
