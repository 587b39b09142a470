//! Ticket spinlocks.
//!
//! Two counters make the lock FIFO fair: acquirers take a ticket with a
//! fetch-add and spin until `serving` reaches it; release increments
//! `serving`. The IRQ-saving variant additionally masks interrupts for the
//! whole held section, so it is the only lock allowed around state shared
//! with interrupt handlers.

use core::cell::UnsafeCell;
use core::hint::spin_loop;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicU64, Ordering};

use x86_64::instructions::interrupts;

pub struct TicketLock<T: ?Sized> {
    next_ticket: AtomicU64,
    serving: AtomicU64,
    data: UnsafeCell<T>,
}

unsafe impl<T: ?Sized + Send> Send for TicketLock<T> {}
unsafe impl<T: ?Sized + Send> Sync for TicketLock<T> {}

impl<T> TicketLock<T> {
    pub const fn new(data: T) -> Self {
        Self {
            next_ticket: AtomicU64::new(0),
            serving: AtomicU64::new(0),
            data: UnsafeCell::new(data),
        }
    }

    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T: ?Sized> TicketLock<T> {
    pub fn lock(&self) -> TicketGuard<'_, T> {
        let ticket = self.next_ticket.fetch_add(1, Ordering::SeqCst);
        while self.serving.load(Ordering::SeqCst) != ticket {
            spin_loop();
        }

        TicketGuard { lock: self }
    }

    /// The ticket currently being served; the self tests use it to check
    /// FIFO order.
    pub fn serving(&self) -> u64 {
        self.serving.load(Ordering::SeqCst)
    }

    fn unlock(&self) {
        self.serving.fetch_add(1, Ordering::SeqCst);
    }
}

pub struct TicketGuard<'a, T: ?Sized> {
    lock: &'a TicketLock<T>,
}

impl<T: ?Sized> Deref for TicketGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> DerefMut for TicketGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T: ?Sized> Drop for TicketGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.unlock();
    }
}

/// A ticket lock whose held sections run with interrupts masked on the
/// owning CPU. The interrupt-enable flag observed at acquire time is
/// restored after release.
pub struct IrqTicketLock<T: ?Sized> {
    inner: TicketLock<T>,
}

unsafe impl<T: ?Sized + Send> Send for IrqTicketLock<T> {}
unsafe impl<T: ?Sized + Send> Sync for IrqTicketLock<T> {}

impl<T> IrqTicketLock<T> {
    pub const fn new(data: T) -> Self {
        Self {
            inner: TicketLock::new(data),
        }
    }
}

impl<T: ?Sized> IrqTicketLock<T> {
    pub fn lock(&self) -> IrqTicketGuard<'_, T> {
        let saved_if = interrupts::are_enabled();
        interrupts::disable();

        let ticket = self.inner.next_ticket.fetch_add(1, Ordering::SeqCst);
        while self.inner.serving.load(Ordering::SeqCst) != ticket {
            spin_loop();
        }

        IrqTicketGuard {
            lock: self,
            saved_if,
        }
    }
}

pub struct IrqTicketGuard<'a, T: ?Sized> {
    lock: &'a IrqTicketLock<T>,
    saved_if: bool,
}

impl<T: ?Sized> Deref for IrqTicketGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.lock.inner.data.get() }
    }
}

impl<T: ?Sized> DerefMut for IrqTicketGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.inner.data.get() }
    }
}

impl<T: ?Sized> Drop for IrqTicketGuard<'_, T> {
    fn drop(&mut self) {
        // Release first, then unmask: the inverse of acquire.
        self.lock.inner.unlock();
        if self.saved_if {
            interrupts::enable();
        }
    }
}
