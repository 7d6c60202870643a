use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::env::args;
use std::str::FromStr;
use std::string::ToString;
use std::sync::{mpsc, Arc};
use std::time::{Duration, Instant};

use strum::IntoEnumIterator;
use strum_macros::{self, Display, EnumIter, EnumString};
use threadkit::{error, thread, Monitor, Semaphore, Signal, Thread, ThreadRegistry};
use tracing::Level;

fn main() -> Result<(), String> {
    let level = match args().nth(2) {
        Some(level) => Level::from_str(&level).map_err(|e| e.to_string())?,
        None => Level::INFO,
    };
    tracing_subscriber::fmt().with_max_level(level).init();

    args()
        .nth(1)
        .ok_or(format!(
            "no scenario supplied, use one of {} [trace|debug|info|warn|error]",
            Scenario::iter()
                .map(|s| s.to_string())
                .collect::<Vec<String>>()
                .join(",")
        ))
        .and_then(|selector| {
            Scenario::from_str(&selector)
                .map_err(|e| e.to_string())
                .and_then(|scenario| {
                    // claim the main role before anything else registers
                    Thread::current();
                    match scenario {
                        Scenario::ProducerConsumer => producer_consumer(),
                        Scenario::NotifyAll => notify_all(),
                        Scenario::SemaphoreTimeout => semaphore_timeout(),
                        Scenario::SelfDrop => self_drop(),
                        Scenario::Priorities => priorities(),
                        Scenario::SuspendAll => suspend_all(),
                    }
                    .map_err(|e| e.to_string())
                })
        })
}

#[derive(EnumIter, EnumString, Display)]
#[strum(serialize_all = "snake_case")]
enum Scenario {
    ProducerConsumer,
    NotifyAll,
    SemaphoreTimeout,
    SelfDrop,
    Priorities,
    SuspendAll,
}

fn producer_consumer() -> threadkit::Result<()> {
    const ITEMS: u32 = 10;
    let queue = Arc::new(Monitor::new(RefCell::new(VecDeque::new())));

    let consumer = Thread::new();
    let shared = queue.clone();
    consumer.start(move || {
        let mut sum = 0;
        for _ in 0..ITEMS {
            let guard = shared.enter();
            guard.wait_while(|queue| queue.borrow().is_empty());
            let item = guard.borrow_mut().pop_front();
            println!("consumed {item:?}");
            sum += item.unwrap_or_default();
        }
        println!("consumer is done, sum is {sum}");
    })?;

    for item in 1..=ITEMS {
        let guard = queue.enter();
        guard.borrow_mut().push_back(item);
        guard.notify();
    }
    consumer.join()
}

fn notify_all() -> threadkit::Result<()> {
    const WAITERS: usize = 4;
    let go = Arc::new(Signal::new(Cell::new(false)));

    let waiters = (0..WAITERS)
        .map(|n| {
            let waiter = Thread::with_options(thread::ThreadOptions::new().name(format!("waiter-{n}")));
            let go = go.clone();
            waiter.start(move || {
                let guard = go.enter();
                guard.wait_while(|go| !go.get());
                println!("{} woke up", Thread::current().name().unwrap_or("?"));
            })?;
            Ok(waiter)
        })
        .collect::<threadkit::Result<Vec<_>>>()?;

    Thread::sleep(Duration::from_millis(50));
    {
        let guard = go.enter();
        guard.set(true);
        guard.notify_all();
    }
    waiters.iter().try_for_each(|waiter| waiter.join())
}

fn semaphore_timeout() -> threadkit::Result<()> {
    let sem = Arc::new(Semaphore::empty());

    let started = Instant::now();
    let got = sem.acquire_millis(Some(100));
    println!("acquire without release: {got} after {:?}", started.elapsed());

    let releaser = Thread::new();
    let shared = sem.clone();
    releaser.start(move || {
        Thread::sleep(Duration::from_millis(20));
        shared.release();
    })?;
    let started = Instant::now();
    let got = sem.acquire_millis(Some(1_000));
    println!("acquire with release: {got} after {:?}", started.elapsed());
    releaser.join()
}

fn self_drop() -> threadkit::Result<()> {
    let (tx, rx) = mpsc::channel::<Thread>();
    let worker = Thread::new();
    worker.start(move || {
        if let Ok(me) = rx.recv() {
            println!("dropping my own wrapper ({:?})", me.native_id());
            drop(me);
        }
    })?;
    let id = worker.native_id();
    let object = Arc::downgrade(&worker.object());
    // a failed send hands the wrapper back and dropping it joins
    let _ = tx.send(worker);

    while object.upgrade().is_some() {
        Thread::yield_now();
    }
    let registered = id.and_then(|id| ThreadRegistry::global().lookup(id)).is_some();
    println!("wrapper gone, still registered: {registered}");
    Ok(())
}

fn priorities() -> threadkit::Result<()> {
    let worker = Thread::new();
    worker.set_priority(thread::PRIORITY_MIN);
    worker.start(|| {
        println!("running at {}", Thread::current().priority());
    })?;
    worker.join()?;
    println!(
        "cached after exit: {}, main thread at {}",
        worker.priority(),
        Thread::current().priority()
    );
    error::fail_if_error();
    Ok(())
}

fn suspend_all() -> threadkit::Result<()> {
    let gate = Arc::new(Semaphore::empty());
    let worker = Thread::new();
    let shared = gate.clone();
    worker.start(move || shared.acquire())?;

    Thread::suspend_all();
    println!("suspend_all recorded: {:?}", error::error_message());
    error::clear_error();

    gate.release();
    worker.join()
}
