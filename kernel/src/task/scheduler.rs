//! The per-CPU cooperative scheduler.
//!
//! Each CPU owns one runnable queue; the running thread is held outside
//! it. All queue manipulation happens on the owning CPU with interrupts
//! masked, which is the whole synchronization story: threads never
//! migrate, and the only cross-CPU communication is through `Event`
//! atomics that interrupt handlers and other CPUs may trigger.

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::vec::Vec;

use x86_64::instructions::interrupts;

use crate::per_cpu;
use crate::sync::Event;

use super::context::{thread_invoke, thread_yield};
use super::thread::{Thread, ThreadContext, ThreadState};

#[derive(Debug)]
pub enum SpawnError {
    OutOfMemory,
}

pub struct Scheduler {
    queue: VecDeque<Box<Thread>>,
    current: Option<Box<Thread>>,
    /// Exited threads parked here until another thread reaps them; their
    /// stacks must not be freed while still in use.
    retire: Vec<Box<Thread>>,
}

impl Scheduler {
    /// Turn the flow calling this (boot path or AP entry) into the CPU's
    /// first thread.
    pub fn new_adopting_current() -> Self {
        Self {
            queue: VecDeque::new(),
            current: Some(Box::new(Thread::adopt_current())),
            retire: Vec::new(),
        }
    }

    fn reap(&mut self) {
        self.retire.clear();
    }

    /// Rotate the queue to the first runnable thread, if any.
    fn pick_next(&mut self) -> Option<Box<Thread>> {
        for _ in 0..self.queue.len() {
            let thread = self.queue.pop_front().unwrap();
            if thread.is_runnable() {
                return Some(thread);
            }
            self.queue.push_back(thread);
        }
        None
    }
}

fn with_scheduler<R>(f: impl FnOnce(&mut Scheduler) -> R) -> R {
    debug_assert!(!interrupts::are_enabled());
    let sched = per_cpu::get_cpu().scheduler();
    f(unsafe { &mut *sched })
}

/// Hand the CPU to the next runnable thread, leaving the caller `new_state`
/// (`Idle` to stay runnable, `Blocked` to park). Returns without switching
/// when no other thread can run. Interrupts must be masked.
fn schedule(new_state: ThreadState) {
    let switch = with_scheduler(|sched| {
        sched.reap();

        let mut next = sched.pick_next()?;
        next.state = ThreadState::Running;

        let old = sched.current.take().unwrap();
        sched.current = Some(next);
        sched.queue.push_back(old);

        let new_ctx: *const ThreadContext = &sched.current.as_ref().unwrap().ctx;
        let old = sched.queue.back_mut().unwrap();
        let old_ctx: *mut ThreadContext = &mut old.ctx;
        let old_state = &mut old.state as *mut ThreadState as *mut u64;

        Some((old_ctx, old_state, new_ctx))
    });

    if let Some((old_ctx, old_state, new_ctx)) = switch {
        unsafe { thread_yield(old_ctx, old_state, new_ctx, new_state as u64) };
        // Back on this thread; the scheduler marked us Running.
    }
}

/// Voluntarily give up the CPU. Round-robin: the caller goes to the back
/// of the queue; with nothing else runnable it just keeps going.
pub fn yield_now() {
    let saved_if = interrupts::are_enabled();
    interrupts::disable();

    schedule(ThreadState::Idle);

    if saved_if {
        interrupts::enable();
    }
}

/// Park the current thread on `event` until it is triggered. The event is
/// not reset here; edge consumers (e.g. `Promise`) reset it themselves.
pub fn await_event(event: &Event) {
    let saved_if = interrupts::are_enabled();
    interrupts::disable();

    with_scheduler(|sched| {
        let current = sched.current.as_mut().unwrap();
        current.current_event = event as *const Event;
    });

    loop {
        schedule(ThreadState::Blocked);

        if event.is_triggered() {
            break;
        }

        // Nothing else runnable and our event is still down: sleep until
        // an interrupt can trigger it.
        interrupts::enable_and_hlt();
        interrupts::disable();
    }

    with_scheduler(|sched| {
        let current = sched.current.as_mut().unwrap();
        current.current_event = core::ptr::null();
    });

    if saved_if {
        interrupts::enable();
    }
}

/// Terminate the current thread. Its stack and control block are freed by
/// whichever thread reschedules next.
pub fn exit() -> ! {
    interrupts::disable();

    with_scheduler(|sched| {
        let old = sched.current.take().unwrap();
        sched.retire.push(old);
    });

    loop {
        let next = with_scheduler(|sched| {
            let mut next = sched.pick_next()?;
            next.state = ThreadState::Running;
            sched.current = Some(next);
            let ctx: *const ThreadContext = &sched.current.as_ref().unwrap().ctx;
            Some(ctx)
        });

        if let Some(new_ctx) = next {
            unsafe { thread_invoke(new_ctx) };
        }

        // The last thread standing has nowhere to go but waiting for an
        // interrupt to wake somebody.
        interrupts::enable_and_hlt();
        interrupts::disable();
    }
}

extern "C" fn trampoline<F: FnOnce() + Send + 'static>(arg: *mut F) -> ! {
    let f = unsafe { Box::from_raw(arg) };
    f();
    panic!("returned from thread trampoline");
}

/// Create a thread running `f` on this CPU and queue it runnable.
pub fn spawn<F: FnOnce() + Send + 'static>(f: F) -> Result<u64, SpawnError> {
    let closure = Box::into_raw(Box::new(f));
    let entry = trampoline::<F> as usize as u64;

    let thread = match Thread::new(entry, closure as u64) {
        Some(thread) => thread,
        None => {
            drop(unsafe { Box::from_raw(closure) });
            return Err(SpawnError::OutOfMemory);
        }
    };
    let id = thread.id;

    let saved_if = interrupts::are_enabled();
    interrupts::disable();

    with_scheduler(|sched| sched.queue.push_back(Box::new(thread)));

    if saved_if {
        interrupts::enable();
    }

    log::debug!("task: spawned thread {}", id);
    Ok(id)
}

/// Identifier of the thread running on this CPU.
pub fn current_thread_id() -> u64 {
    let saved_if = interrupts::are_enabled();
    interrupts::disable();

    let id = with_scheduler(|sched| sched.current.as_ref().unwrap().id);

    if saved_if {
        interrupts::enable();
    }
    id
}
