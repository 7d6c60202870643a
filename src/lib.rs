pub mod error;
pub mod monitor;
pub mod semaphore;
pub mod spinlock;
pub mod thread;

pub use error::{Result, ThreadError};
pub use monitor::{Monitor, MonitorGuard, Signal};
pub use semaphore::Semaphore;
pub use spinlock::{Spinlock, SpinlockGuard};
pub use thread::{Thread, ThreadObject, ThreadOptions, ThreadRegistry, ThreadState};
