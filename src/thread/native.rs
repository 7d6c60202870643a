//! # Native thread backend
//!
//! Everything that talks to the OS about a particular thread lives here.
//!
//! ## Linux
//! Under the default scheduling policy the only per-thread knob is the nice value, and
//! `setpriority(PRIO_PROCESS, tid)` applies it to a single thread (a Linux quirk, POSIX
//! says it should be the whole process). The kernel thread id is a plain number: using it
//! after the thread died is an ESRCH at worst, never UB like a stale `pthread_t`.
//!
//! Raising the priority above the current nice value needs `CAP_SYS_NICE`, lowering is
//! always allowed.
//!
//! ## Elsewhere
//! The priority is only cached by the caller.
//!
//! Suspending another thread isn't available anywhere: pthreads has no such call and
//! SIGSTOP stops the whole process.

use crate::error::{Result, ThreadError};

use super::{PRIORITY_MAX, PRIORITY_MIN};

#[derive(Debug, Clone, Copy)]
pub(crate) struct NativeHandle {
    #[cfg(target_os = "linux")]
    tid: libc::pid_t,
}

impl NativeHandle {
    /// Handle of the calling thread.
    pub(crate) fn current() -> Self {
        Self {
            #[cfg(target_os = "linux")]
            // SAFETY: gettid has no preconditions and can't fail
            tid: unsafe { libc::syscall(libc::SYS_gettid) as libc::pid_t },
        }
    }

    /// `None` when the backend can't tell.
    #[cfg(target_os = "linux")]
    pub(crate) fn priority(&self) -> Result<Option<i32>> {
        // -1 is a legit nice value => errno is the only way to tell a failure
        // SAFETY: errno is thread-local and writable
        unsafe { *libc::__errno_location() = 0 };
        let nice = unsafe { libc::getpriority(libc::PRIO_PROCESS, self.tid as libc::id_t) };
        if nice == -1 {
            let err = std::io::Error::last_os_error();
            match err.raw_os_error() {
                Some(0) => {}
                // already gone, the caller keeps what it has cached
                Some(libc::ESRCH) => return Ok(None),
                _ => {
                    return Err(ThreadError::Native {
                        call: "getpriority",
                        source: err,
                    })
                }
            }
        }
        Ok(Some(nice_to_priority(nice)))
    }

    #[cfg(not(target_os = "linux"))]
    pub(crate) fn priority(&self) -> Result<Option<i32>> {
        Ok(None)
    }

    #[cfg(target_os = "linux")]
    pub(crate) fn set_priority(&self, priority: i32) -> Result<()> {
        let nice = priority_to_nice(priority);
        // SAFETY: plain syscall on a thread id
        let res = unsafe { libc::setpriority(libc::PRIO_PROCESS, self.tid as libc::id_t, nice) };
        if res == -1 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::ESRCH) {
                return Ok(());
            }
            return Err(ThreadError::Native {
                call: "setpriority",
                source: err,
            });
        }
        tracing::trace!(tid = self.tid, priority, nice, "applied thread priority");
        Ok(())
    }

    #[cfg(not(target_os = "linux"))]
    pub(crate) fn set_priority(&self, _priority: i32) -> Result<()> {
        Ok(())
    }

    pub(crate) fn suspend(&self) -> Result<()> {
        Err(ThreadError::Unsupported("Thread::suspend_all"))
    }
}

const NICE_HIGHEST: i32 = -20;
const NICE_LOWEST: i32 = 19;

/*
 * The priority scale is symmetric around 0, nice isn't (-20..=19).
 * Map each half separately so that 0 stays 0, rounding to the nearest step.
 */
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn priority_to_nice(priority: i32) -> i32 {
    let priority = priority.clamp(PRIORITY_MIN, PRIORITY_MAX);
    if priority >= 0 {
        -scale(priority, -NICE_HIGHEST, PRIORITY_MAX)
    } else {
        scale(-priority, NICE_LOWEST, -PRIORITY_MIN)
    }
}

#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn nice_to_priority(nice: i32) -> i32 {
    let nice = nice.clamp(NICE_HIGHEST, NICE_LOWEST);
    if nice <= 0 {
        scale(-nice, PRIORITY_MAX, -NICE_HIGHEST)
    } else {
        -scale(nice, -PRIORITY_MIN, NICE_LOWEST)
    }
}

/// value * to / from, rounded half up; everything is non-negative here
fn scale(value: i32, to: i32, from: i32) -> i32 {
    (value * to + from / 2) / from
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::thread::PRIORITY_NORMAL;

    #[test]
    fn priority_scale_ends_and_middle() {
        assert_eq!(priority_to_nice(PRIORITY_MAX), NICE_HIGHEST);
        assert_eq!(priority_to_nice(PRIORITY_NORMAL), 0);
        assert_eq!(priority_to_nice(PRIORITY_MIN), NICE_LOWEST);
        assert_eq!(priority_to_nice(1_000), NICE_HIGHEST);

        assert_eq!(nice_to_priority(NICE_HIGHEST), PRIORITY_MAX);
        assert_eq!(nice_to_priority(0), PRIORITY_NORMAL);
        assert_eq!(nice_to_priority(NICE_LOWEST), PRIORITY_MIN);
    }

    #[test]
    fn every_priority_survives_the_trip() {
        for priority in PRIORITY_MIN..=PRIORITY_MAX {
            assert_eq!(nice_to_priority(priority_to_nice(priority)), priority);
        }
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn reads_own_priority() {
        let handle = NativeHandle::current();
        let priority = handle.priority().unwrap().unwrap();
        assert!((PRIORITY_MIN..=PRIORITY_MAX).contains(&priority));
    }
}
