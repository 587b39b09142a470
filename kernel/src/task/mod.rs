//! Cooperative per-CPU threading.
//!
//! A thread runs until it calls [`yield_now`] or [`await_event`]; there is
//! no preemption and threads never migrate between CPUs. Context switches
//! save only what the SysV ABI requires across a call, plus `rdi` for the
//! spawn trampoline argument.

pub mod context;
pub mod scheduler;
pub mod thread;

#[cfg(feature = "testing")]
pub mod thread_tests;

pub use scheduler::{await_event, current_thread_id, exit, spawn, yield_now};
