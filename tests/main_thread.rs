use std::sync::{mpsc, Arc};

use threadkit::{Thread, ThreadError, ThreadRegistry};

// one test per binary: the main role goes to whoever registers first, once per process
#[test]
fn main_role_is_claimed_once() {
    let first = std::thread::spawn(|| {
        let me = Thread::current();
        assert!(Thread::is_main());
        assert!(Arc::ptr_eq(&Thread::main().unwrap(), &me));

        let (tx, rx) = mpsc::channel();
        let worker = Thread::new();
        worker
            .start(move || tx.send(Thread::is_main()).unwrap())
            .unwrap();
        assert!(!rx.recv().unwrap());
        worker.join().unwrap();

        let joiner = Thread::new();
        let main = me.clone();
        joiner
            .start(move || {
                let _ = main.join();
            })
            .unwrap();
        assert!(matches!(joiner.join(), Err(ThreadError::Panicked)));

        Thread::id()
    })
    .join()
    .unwrap();

    // the first thread is gone, and nobody inherits the role
    assert!(ThreadRegistry::global().lookup(first).is_none());
    assert!(ThreadRegistry::global().main().is_none());
    assert!(!Thread::is_main());
    assert!(Thread::main().is_none());
}
