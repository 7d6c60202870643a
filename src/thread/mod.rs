//! # Threads
//!
//! [Thread] owns an OS thread wrapper, [ThreadObject] is the part of it everybody may
//! share: the id, the native handle, priority, liveness and the user data slots.
//!
//! ## Lifecycle
//! `Unstarted -> Running -> ExitPending -> Cleaned`, see [ThreadState].
//!
//! A wrapper registers itself in the [ThreadRegistry] from the new thread, before
//! [Thread::start] returns. When the thread function is done (or a `join` sees the thread
//! gone) the object is flagged as exited, but the native handle is only released and the
//! registry entry only dropped once nobody is in the middle of using the handle.
//! That's what `refer`/`unrefer` count: every operation on the handle is bracketed by
//! them and whoever brings the count to zero on an exited object does the cleanup.
//!
//! Threads not started through [Thread::start] (the process' initial thread, threads from
//! `std::thread::spawn`, ...) get a wrapper the first time they call [Thread::current].
//! That wrapper lives in a thread-local and is cleaned up when the thread exits.

pub mod native;
pub mod registry;
pub mod user_data;

use std::{
    any::Any,
    cell::RefCell,
    ops::Deref,
    panic::{self, AssertUnwindSafe},
    sync::{Arc, Weak},
    thread::{self, JoinHandle, ThreadId},
    time::Duration,
};

use strum_macros::Display;

use crate::{
    error::{fail_if_error, set_error, Result, ThreadError},
    semaphore::Semaphore,
    spinlock::Spinlock,
};

use native::NativeHandle;
pub use registry::ThreadRegistry;
use user_data::{Slot, UserData};

pub const PRIORITY_MIN: i32 = -15;
pub const PRIORITY_NORMAL: i32 = 0;
pub const PRIORITY_MAX: i32 = 15;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum ThreadState {
    /// never ran
    Unstarted,
    Running,
    /// done, but somebody still holds the native handle
    ExitPending,
    /// handle released, out of the registry; safe to drop or to start again
    Cleaned,
}

/// What the OS thread gets created with.
#[derive(Debug, Clone, Default)]
pub struct ThreadOptions {
    name: Option<String>,
    stack_size: Option<usize>,
}

impl ThreadOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn stack_size(mut self, bytes: usize) -> Self {
        self.stack_size = Some(bytes);
        self
    }

    fn builder(&self) -> thread::Builder {
        let mut builder = thread::Builder::new();
        if let Some(name) = &self.name {
            builder = builder.name(name.clone());
        }
        if let Some(bytes) = self.stack_size {
            builder = builder.stack_size(bytes);
        }
        builder
    }
}

struct State {
    id: Option<ThreadId>,
    handle: Option<NativeHandle>,
    ref_count: u32,
    exited: bool,
    priority: i32,
    /// set_priority was called => the trampoline applies it
    priority_requested: bool,
    runs: u32,
    cleanups: u32,
    user_data: UserData,
}

pub struct ThreadObject {
    state: Spinlock<State>,
    /// serializes start() against start()
    start_lock: Spinlock,
    join_handle: Spinlock<Option<JoinHandle<()>>>,
    /// Threads we didn't spawn have no join handle: their thread-local teardown fires this.
    gone: Option<Semaphore>,
    options: ThreadOptions,
}

impl ThreadObject {
    fn new(options: ThreadOptions) -> Self {
        Self::with_exit_signal(options, None)
    }

    fn foreign() -> Self {
        Self::with_exit_signal(ThreadOptions::default(), Some(Semaphore::empty()))
    }

    fn with_exit_signal(options: ThreadOptions, gone: Option<Semaphore>) -> Self {
        Self {
            state: Spinlock::new(State {
                id: None,
                handle: None,
                ref_count: 0,
                exited: false,
                priority: PRIORITY_NORMAL,
                priority_requested: false,
                runs: 0,
                cleanups: 0,
                user_data: UserData::default(),
            }),
            start_lock: Spinlock::new(()),
            join_handle: Spinlock::new(None),
            gone,
            options,
        }
    }

    /// Native id of the thread, while it's registered.
    pub fn native_id(&self) -> Option<ThreadId> {
        self.state.lock().id
    }

    pub fn name(&self) -> Option<&str> {
        self.options.name.as_deref()
    }

    pub fn state(&self) -> ThreadState {
        let state = self.state.lock();
        match (&state.handle, state.exited) {
            (Some(_), false) => ThreadState::Running,
            (Some(_), true) => ThreadState::ExitPending,
            (None, _) if state.runs == 0 => ThreadState::Unstarted,
            (None, _) => ThreadState::Cleaned,
        }
    }

    pub fn is_main(&self) -> bool {
        ThreadRegistry::global().is_main(self)
    }

    fn is_running_here(&self) -> bool {
        self.state.lock().id == Some(Thread::id())
    }

    fn refer(&self) {
        self.state.lock().ref_count += 1;
    }

    /// The last unrefer of an exited object does the cleanup, exactly once per run.
    fn unrefer(&self) {
        let released = {
            let mut state = self.state.lock();
            assert!(state.ref_count > 0, "unrefer without a matching refer");
            state.ref_count -= 1;
            if state.ref_count > 0 || !state.exited {
                return;
            }
            state.exited = false;
            match (state.id.take(), state.handle.take()) {
                (Some(id), Some(_)) => {
                    state.cleanups += 1;
                    Some(id)
                }
                _ => None,
            }
        };

        // outside the object lock: suspend_all takes the registry lock first, then ours
        if let Some(id) = released {
            self.exited(id);
        }
    }

    fn mark_exited(&self) {
        self.refer();
        self.state.lock().exited = true;
        self.unrefer();
    }

    /// Runs on the thread itself: record who we are and show up in the registry.
    fn started(self: &Arc<Self>) {
        let id = Thread::id();
        {
            let mut state = self.state.lock();
            state.id = Some(id);
            state.handle = Some(NativeHandle::current());
            state.exited = false;
            state.runs += 1;
        }
        let main = ThreadRegistry::global().register(id, self);
        tracing::debug!(thread_id = ?id, name = self.name(), main, "thread started");
    }

    fn exited(&self, id: ThreadId) {
        ThreadRegistry::global().deregister(id, self);
        tracing::debug!(thread_id = ?id, name = self.name(), "thread cleaned up");
    }

    /// The handle and id to work with, if the object still has them. Only valid while referred.
    fn native(&self) -> Option<(ThreadId, NativeHandle)> {
        let state = self.state.lock();
        state.id.zip(state.handle)
    }

    /// Blocks until the thread is gone. Returns immediately if it already is.
    ///
    /// Joining the calling thread or the main thread is a bug and panics.
    pub fn join(&self) -> Result<()> {
        let current = Thread::current();
        assert!(
            !std::ptr::eq(self, Arc::as_ptr(&current)),
            "Thread::join called on the current thread"
        );
        assert!(!self.is_main(), "Thread::join called on the main thread");

        self.refer();
        let mut outcome = Ok(());
        // take it out: a join can take forever, the lock is for short stuff
        let handle = self.join_handle.lock().take();
        if let Some(handle) = handle {
            tracing::trace!(name = self.name(), "joining thread");
            if handle.join().is_err() {
                outcome = Err(ThreadError::Panicked);
            }
        } else if let Some(gone) = &self.gone {
            tracing::trace!(name = self.name(), "joining foreign thread");
            gone.acquire();
            // leave it fired for the next joiner
            gone.release();
        }
        self.state.lock().exited = true;
        self.unrefer();
        outcome
    }

    /// Checks with the OS. Seeing the thread finished moves the object towards cleanup.
    pub fn is_alive(&self) -> bool {
        self.refer();
        let alive = {
            let mut state = self.state.lock();
            if state.handle.is_none() {
                false
            } else {
                let finished = self
                    .join_handle
                    .lock()
                    .as_ref()
                    .is_some_and(JoinHandle::is_finished);
                if finished {
                    state.exited = true;
                }
                !finished
            }
        };
        self.unrefer();
        alive
    }

    /// In `PRIORITY_MIN..=PRIORITY_MAX`. Read from the OS when it can tell, cached otherwise.
    pub fn priority(&self) -> i32 {
        self.refer();
        let read = self.native().map(|(_, handle)| handle.priority());
        let priority = {
            let mut state = self.state.lock();
            if let Some(Ok(Some(priority))) = read {
                state.priority = priority;
            }
            state.priority
        };
        self.unrefer();

        if let Some(Err(err)) = read {
            set_error(err);
        }
        priority
    }

    /// Clamped to the valid range. Without a running thread the value waits for the next start.
    pub fn set_priority(&self, priority: i32) {
        let priority = priority.clamp(PRIORITY_MIN, PRIORITY_MAX);
        self.refer();
        let native = {
            let mut state = self.state.lock();
            state.priority = priority;
            state.priority_requested = true;
            state.handle
        };
        let applied = native.map(|handle| handle.set_priority(priority));
        self.unrefer();

        if let Some(Err(err)) = applied {
            set_error(err);
        }
    }

    fn apply_requested_priority(&self) {
        let requested = {
            let state = self.state.lock();
            state.priority_requested.then_some(state.priority)
        };
        if let Some(priority) = requested {
            self.set_priority(priority);
        }
    }

    pub fn user_data<Y: Any + Send + Sync>(&self, key: &str) -> Option<Arc<Y>> {
        let data = self.state.lock().user_data.get(key)?;
        data.downcast::<Y>().ok()
    }

    /// Swaps in the new slot and deinits the old one. `None` for both removes the key.
    pub fn set_user_data<Y, F>(&self, key: &str, data: Option<Arc<Y>>, deinit: Option<F>)
    where
        Y: Any + Send + Sync,
        F: FnOnce(Option<Arc<Y>>) + Send + 'static,
    {
        let previous = self
            .state
            .lock()
            .user_data
            .replace(key, Slot::new(data, deinit));
        // user code, never under the lock
        if let Some(previous) = previous {
            previous.deinit();
        }
    }

    pub fn put_user_data<Y: Any + Send + Sync>(&self, key: &str, data: Arc<Y>) {
        self.set_user_data(key, Some(data), None::<fn(Option<Arc<Y>>)>);
    }

    pub fn clear_user_data(&self, key: &str) {
        let previous = self.state.lock().user_data.replace(key, Slot::default());
        if let Some(previous) = previous {
            previous.deinit();
        }
    }

    fn deinit_user_data(&self) {
        let slots = self.state.lock().user_data.take_all();
        for slot in slots {
            slot.deinit();
        }
    }
}

impl Drop for ThreadObject {
    fn drop(&mut self) {
        // slots set through a shared handle after the owner was gone
        self.deinit_user_data();
    }
}

impl std::fmt::Debug for ThreadObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("ThreadObject")
            .field("name", &self.options.name)
            .field("id", &state.id)
            .field("ref_count", &state.ref_count)
            .field("exited", &state.exited)
            .field("priority", &state.priority)
            .field("user_data", &state.user_data.len())
            .finish()
    }
}

thread_local! {
    /// Wrapper of a thread that wasn't started through Thread::start.
    static SELF_WRAPPED: RefCell<Option<Thread>> = const { RefCell::new(None) };
}

/// Owner of a thread wrapper. Dropping it waits for the thread (or, from the thread
/// itself, marks it exited) and deinits the user data.
pub struct Thread {
    object: Arc<ThreadObject>,
    self_wrapped: bool,
}

impl Thread {
    pub fn new() -> Self {
        Self::with_options(ThreadOptions::default())
    }

    pub fn with_options(options: ThreadOptions) -> Self {
        Self {
            object: Arc::new(ThreadObject::new(options)),
            self_wrapped: false,
        }
    }

    /// A shared handle to the wrapper, e.g. to query it from other threads.
    pub fn object(&self) -> Arc<ThreadObject> {
        self.object.clone()
    }

    /// Runs `func` on a new OS thread, after waiting for the previous run (if any).
    ///
    /// When this returns the new thread is registered, so [Thread::current] from within it
    /// and a registry lookup from here agree.
    pub fn start<F>(&self, func: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let _serial = self.object.start_lock.lock();
        if let Err(err) = self.object.join() {
            tracing::warn!(%err, name = self.object.name(), "previous run ended badly");
        }

        let ready = Arc::new(Semaphore::empty());
        let signal = ready.clone();
        let object = Arc::downgrade(&self.object);

        let handle = self
            .object
            .options
            .builder()
            .spawn(move || trampoline(object, signal, func))
            .map_err(|err| {
                tracing::error!(%err, name = self.object.name(), "failed to spawn thread");
                ThreadError::Spawn(err)
            })?;
        *self.object.join_handle.lock() = Some(handle);

        ready.acquire();
        Ok(())
    }

    /// Wrapper of the calling thread, made on the spot for threads we didn't start.
    pub fn current() -> Arc<ThreadObject> {
        if let Some(object) = ThreadRegistry::global().lookup(Self::id()) {
            return object;
        }

        let thread = Thread {
            object: Arc::new(ThreadObject::foreign()),
            self_wrapped: true,
        };
        thread.object.started();
        let object = thread.object.clone();

        SELF_WRAPPED.with(|slot| *slot.borrow_mut() = Some(thread));
        object
    }

    /// The first thread that ever registered, unless it's gone.
    pub fn main() -> Option<Arc<ThreadObject>> {
        Self::current();
        ThreadRegistry::global().main()
    }

    pub fn is_main() -> bool {
        Self::current().is_main()
    }

    pub fn id() -> ThreadId {
        thread::current().id()
    }

    pub fn sleep(duration: Duration) {
        thread::sleep(duration);
    }

    pub fn yield_now() {
        thread::yield_now();
    }

    /// Emergency brake: suspend every registered thread but the caller.
    ///
    /// No backend here can suspend another thread, so instead of stopping anything this
    /// records [ThreadError::Unsupported] as soon as there's a thread to stop.
    pub fn suspend_all() {
        let me = Self::id();
        let mut held = Vec::new();
        let mut failure = None;

        let entries = ThreadRegistry::global().lock();
        for object in entries.live() {
            object.refer();
            if let Some((id, handle)) = object.native() {
                if id != me {
                    tracing::warn!(thread_id = ?id, name = object.name(), "suspending thread");
                    if let Err(err) = handle.suspend() {
                        failure.get_or_insert(err);
                    }
                }
            }
            held.push(object);
        }
        drop(entries);

        // an unrefer may clean up, and cleanup takes the registry lock
        for object in held {
            object.unrefer();
        }
        if let Some(err) = failure {
            set_error(err);
        }
    }
}

impl Default for Thread {
    fn default() -> Self {
        Self::new()
    }
}

impl Deref for Thread {
    type Target = ThreadObject;
    fn deref(&self) -> &ThreadObject {
        &self.object
    }
}

impl Drop for Thread {
    fn drop(&mut self) {
        if self.self_wrapped {
            // thread-local teardown: no panics here, they'd abort
            self.object.mark_exited();
            if let Some(gone) = &self.object.gone {
                gone.release();
            }
        } else if self.object.is_running_here() {
            fail_if_error();
            self.object.mark_exited();
        } else if let Err(err) = self.object.join() {
            tracing::error!(%err, name = self.object.name(), "thread ended badly");
        }
        self.object.deinit_user_data();
    }
}

/// Body of every thread made by [Thread::start].
fn trampoline<F: FnOnce()>(object: Weak<ThreadObject>, ready: Arc<Semaphore>, func: F) {
    let id = Thread::id();
    // start() holds the owner until `ready` fires => the upgrade can't fail
    if let Some(object) = object.upgrade() {
        object.started();
        object.apply_requested_priority();
    }
    ready.release();
    drop(ready);

    let outcome = panic::catch_unwind(AssertUnwindSafe(func));

    // func may have dropped the wrapper, or handed it to someone who did
    let object = object
        .upgrade()
        .filter(|object| ThreadRegistry::global().contains(id, object));
    if let Some(object) = object {
        if outcome.is_ok() {
            fail_if_error();
        }
        // last look at the priority before the handle goes
        object.priority();
        object.mark_exited();
    }

    if let Err(payload) = outcome {
        tracing::error!(thread_id = ?id, "thread function panicked");
        panic::resume_unwind(payload);
    }
}
