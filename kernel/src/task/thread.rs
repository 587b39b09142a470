//! Thread control blocks.

use core::sync::atomic::{AtomicU64, Ordering};

use alloc::alloc::{alloc_zeroed, dealloc, Layout};

use crate::sync::Event;

/// 16 KiB of zero-filled stack per thread.
pub const STACK_SIZE: usize = 0x4000;
const STACK_ALIGN: usize = 16;

static NEXT_THREAD_ID: AtomicU64 = AtomicU64::new(1);

pub fn allocate_thread_id() -> u64 {
    NEXT_THREAD_ID.fetch_add(1, Ordering::SeqCst)
}

/// Scheduling state. The discriminants are written from the context-switch
/// assembly, so they are fixed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub enum ThreadState {
    /// Runnable, waiting for its turn.
    Idle = 0,
    /// On a CPU right now.
    Running = 1,
    /// Parked on `current_event`.
    Blocked = 2,
}

/// Saved register set. THIS STRUCT IS ACCESSED FROM ASSEMBLY; field order
/// and size are load-bearing.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct ThreadContext {
    pub rbx: u64,
    pub rbp: u64,
    pub rsp: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rdi: u64,
    pub rip: u64,
    pub rflags: u64,
}

impl ThreadContext {
    pub const fn zeroed() -> Self {
        Self {
            rbx: 0,
            rbp: 0,
            rsp: 0,
            r12: 0,
            r13: 0,
            r14: 0,
            r15: 0,
            rdi: 0,
            rip: 0,
            // Bit 1 is always set in RFLAGS; start with interrupts on.
            rflags: 0x202,
        }
    }
}

/// A heap-owned, zeroed, 16-aligned thread stack.
pub struct Stack {
    base: *mut u8,
    size: usize,
}

impl Stack {
    pub fn new(size: usize) -> Option<Self> {
        let layout = Layout::from_size_align(size, STACK_ALIGN).ok()?;
        let base = unsafe { alloc_zeroed(layout) };
        if base.is_null() {
            return None;
        }
        Some(Self { base, size })
    }

    /// First address past the stack; grows downward from here.
    pub fn top(&self) -> u64 {
        self.base as u64 + self.size as u64
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        let layout = Layout::from_size_align(self.size, STACK_ALIGN).unwrap();
        unsafe { dealloc(self.base, layout) };
    }
}

unsafe impl Send for Stack {}

/// A thread. Heap-owned by its CPU's scheduler; the running thread is held
/// out of the runnable queue.
pub struct Thread {
    pub id: u64,
    pub state: ThreadState,
    pub ctx: ThreadContext,
    /// None only for the bootstrap thread, which runs on the boot stack.
    pub stack: Option<Stack>,
    /// The event a Blocked thread is parked on.
    pub current_event: *const Event,
}

unsafe impl Send for Thread {}

impl Thread {
    /// Adopt the currently executing flow (boot or AP entry) as a thread.
    /// Its context gets filled in by the first switch away from it.
    pub fn adopt_current() -> Self {
        Self {
            id: allocate_thread_id(),
            state: ThreadState::Running,
            ctx: ThreadContext::zeroed(),
            stack: None,
            current_event: core::ptr::null(),
        }
    }

    /// A fresh thread that will enter `entry` with `arg` in `rdi`.
    pub fn new(entry: u64, arg: u64) -> Option<Self> {
        let stack = Stack::new(STACK_SIZE)?;

        let mut ctx = ThreadContext::zeroed();
        ctx.rsp = stack.top();
        ctx.rip = entry;
        ctx.rdi = arg;

        Some(Self {
            id: allocate_thread_id(),
            state: ThreadState::Idle,
            ctx,
            stack: Some(stack),
            current_event: core::ptr::null(),
        })
    }

    /// Whether the scheduler may hand this thread the CPU.
    pub fn is_runnable(&self) -> bool {
        match self.state {
            ThreadState::Idle => true,
            ThreadState::Running => false,
            ThreadState::Blocked => {
                !self.current_event.is_null() && unsafe { (*self.current_event).is_triggered() }
            }
        }
    }
}
