//! Events and promises.
//!
//! An [`Event`] is a single sequentially consistent word: edge style, no
//! waiter list, no cancellation. Waiting is the scheduler's business
//! (`task::await_event`); a trigger happens-before any later observation
//! of the flag on any CPU.

use core::cell::UnsafeCell;
use core::mem::MaybeUninit;
use core::sync::atomic::{AtomicU64, Ordering};

pub struct Event {
    value: AtomicU64,
}

impl Event {
    pub const fn new() -> Self {
        Self {
            value: AtomicU64::new(0),
        }
    }

    pub fn trigger(&self) {
        self.value.store(1, Ordering::SeqCst);
    }

    pub fn reset(&self) {
        self.value.store(0, Ordering::SeqCst);
    }

    pub fn is_triggered(&self) -> bool {
        self.value.load(Ordering::SeqCst) == 1
    }
}

impl Default for Event {
    fn default() -> Self {
        Self::new()
    }
}

/// One value handed from a producer to a waiting thread: aligned inline
/// storage plus an event.
pub struct Promise<T> {
    event: Event,
    value: UnsafeCell<MaybeUninit<T>>,
}

unsafe impl<T: Send> Send for Promise<T> {}
unsafe impl<T: Send> Sync for Promise<T> {}

impl<T> Promise<T> {
    pub const fn new() -> Self {
        Self {
            event: Event::new(),
            value: UnsafeCell::new(MaybeUninit::uninit()),
        }
    }

    /// Construct the value in place and wake the waiter. One producer,
    /// one value; a second set before the waiter consumes the first would
    /// overwrite it.
    pub fn set_value(&self, value: T) {
        unsafe { (*self.value.get()).write(value) };
        self.event.trigger();
    }

    /// Block the current thread until a value is set, then borrow it.
    /// Resets the event so the promise can carry another round.
    pub fn wait(&self) -> &T {
        crate::task::await_event(&self.event);
        self.event.reset();

        unsafe { (*self.value.get()).assume_init_ref() }
    }
}

impl<T> Default for Promise<T> {
    fn default() -> Self {
        Self::new()
    }
}
