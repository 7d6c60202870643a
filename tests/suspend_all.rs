use std::sync::Arc;

use threadkit::{error, Semaphore, Thread, ThreadError};

#[test]
fn nothing_to_suspend_but_the_caller() {
    Thread::current();
    Thread::suspend_all();
    assert!(!error::has_error());

    let gate = Arc::new(Semaphore::empty());
    let worker = Thread::new();
    let inside = gate.clone();
    worker.start(move || inside.acquire()).unwrap();

    Thread::suspend_all();
    assert!(error::has_error());
    assert_eq!(
        error::error_message().as_deref(),
        Some("Thread::suspend_all is not supported on this platform")
    );
    // first error wins
    Thread::suspend_all();
    assert!(matches!(
        error::clear_error(),
        Some(ThreadError::Unsupported(_))
    ));
    assert!(!error::has_error());

    // cleared before the worker gets to check
    gate.release();
    worker.join().unwrap();
}
