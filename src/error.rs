//! # Errors
//!
//! There are two kinds of failures around threads.
//!
//! Programming errors (waiting on a monitor you don't own, joining yourself) are plain
//! `assert!`s. They're caller bugs and there's nothing sensible to return.
//!
//! Native failures (the OS refused a call) are recorded into a process-wide error slot.
//! Nothing unwinds internally: whoever cares checks [has_error] or calls [fail_if_error]
//! at a convenient point. Only the first error is kept, the rest are just logged.

use std::{
    io,
    sync::{Mutex, PoisonError},
};

use crate::thread::Thread;

#[derive(Debug, thiserror::Error)]
pub enum ThreadError {
    #[error("{call} failed: {source}")]
    Native {
        call: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("failed to spawn a thread: {0}")]
    Spawn(#[source] io::Error),

    #[error("{0} is not supported on this platform")]
    Unsupported(&'static str),

    #[error("thread function panicked")]
    Panicked,
}

pub type Result<T> = std::result::Result<T, ThreadError>;

static LAST_ERROR: Mutex<Option<ThreadError>> = Mutex::new(None);

/// Records the error unless another one is already pending.
pub fn set_error(err: ThreadError) {
    let mut slot = LAST_ERROR.lock().unwrap_or_else(PoisonError::into_inner);
    match *slot {
        None => {
            tracing::error!(error = %err, "native thread error");
            *slot = Some(err);
        }
        Some(ref pending) => {
            tracing::warn!(error = %err, pending = %pending, "dropping error, another one is pending");
        }
    }
}

pub fn has_error() -> bool {
    LAST_ERROR
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .is_some()
}

pub fn error_message() -> Option<String> {
    LAST_ERROR
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .as_ref()
        .map(ToString::to_string)
}

/// Takes the pending error out, leaving the slot empty.
pub fn clear_error() -> Option<ThreadError> {
    LAST_ERROR
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .take()
}

/// The emergency exit: remember the error, try to halt every other thread and blow up.
pub fn fail(err: ThreadError) -> ! {
    let message = err.to_string();
    tracing::error!(error = %message, "fatal error");
    set_error(err);
    Thread::suspend_all();
    panic!("{message}");
}

pub fn fail_if_error() {
    if let Some(err) = clear_error() {
        fail(err);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn messages() {
        let err = ThreadError::Native {
            call: "getpriority",
            source: io::Error::from_raw_os_error(libc::ESRCH),
        };
        assert!(err.to_string().starts_with("getpriority failed: "));
        assert_eq!(
            ThreadError::Unsupported("Thread::suspend_all").to_string(),
            "Thread::suspend_all is not supported on this platform"
        );
        assert_eq!(ThreadError::Panicked.to_string(), "thread function panicked");
    }
}
