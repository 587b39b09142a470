//! Cooperative threading self tests.

use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::sync::Event;
use crate::task;

/// A spawned closure runs exactly once before its thread is reclaimed.
fn test_spawn_runs_once() {
    static RUNS: AtomicU64 = AtomicU64::new(0);
    RUNS.store(0, Ordering::SeqCst);

    let id = task::spawn(|| {
        RUNS.fetch_add(1, Ordering::SeqCst);
        task::exit();
    })
    .unwrap();
    assert_ne!(id, task::current_thread_id());

    // Several rounds so the thread runs and gets reaped.
    for _ in 0..8 {
        task::yield_now();
    }

    assert_eq!(RUNS.load(Ordering::SeqCst), 1);

    log::info!("task tests: spawn runs once ok");
}

/// `await_event` returns only after a trigger.
fn test_await_event() {
    static EVENT: Event = Event::new();
    static WOKE: AtomicBool = AtomicBool::new(false);

    EVENT.reset();
    WOKE.store(false, Ordering::SeqCst);

    task::spawn(|| {
        task::await_event(&EVENT);
        WOKE.store(true, Ordering::SeqCst);
        task::exit();
    })
    .unwrap();

    // The waiter parks; nothing may wake it yet.
    for _ in 0..4 {
        task::yield_now();
    }
    assert!(!WOKE.load(Ordering::SeqCst));

    EVENT.trigger();
    while !WOKE.load(Ordering::SeqCst) {
        task::yield_now();
    }

    EVENT.reset();
    log::info!("task tests: await event ok");
}

/// Round-robin between two yielding threads interleaves them.
fn test_yield_interleaves() {
    static TICKS_A: AtomicU64 = AtomicU64::new(0);
    static TICKS_B: AtomicU64 = AtomicU64::new(0);

    TICKS_A.store(0, Ordering::SeqCst);
    TICKS_B.store(0, Ordering::SeqCst);

    task::spawn(|| {
        for _ in 0..4 {
            TICKS_A.fetch_add(1, Ordering::SeqCst);
            task::yield_now();
        }
        task::exit();
    })
    .unwrap();

    task::spawn(|| {
        for _ in 0..4 {
            TICKS_B.fetch_add(1, Ordering::SeqCst);
            task::yield_now();
        }
        task::exit();
    })
    .unwrap();

    for _ in 0..16 {
        task::yield_now();
    }

    assert_eq!(TICKS_A.load(Ordering::SeqCst), 4);
    assert_eq!(TICKS_B.load(Ordering::SeqCst), 4);

    log::info!("task tests: yield interleave ok");
}

pub fn run() {
    test_spawn_runs_once();
    test_await_event();
    test_yield_interleaves();
}
