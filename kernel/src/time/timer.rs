//! The deadline wheel.
//!
//! Timers are arena records addressed by index+generation handles, so a
//! cancelled or destroyed timer is one failed validity check, never a
//! dangling pointer. The queue orders (deadline, slot) pairs; one HPET
//! comparator is kept armed for the earliest deadline and re-armed as the
//! queue changes. Expiry fires handlers outside every lock and re-queues
//! periodic timers.
//!
//! Locking: the registry lock guards the arena, each timer record has its
//! own IRQ-saving lock for start/stop/setup, and the wheel lock guards the
//! queue. Order is always registry → record → wheel.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;

use conquer_once::spin::OnceCell;

use crate::sync::IrqTicketLock;
use crate::time::hpet;

pub type TimerFn = fn(*mut ());

/// Re-arm horizon when the queue is empty.
const IDLE_REARM_NS: u64 = 1_000_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerHandle {
    index: usize,
    generation: u64,
}

struct TimerState {
    period_ns: u64,
    periodic: bool,
    queued: bool,
    deadline: u64,
    handler: Option<TimerFn>,
    userptr: *mut (),
}

unsafe impl Send for TimerState {}

struct Slot {
    generation: u64,
    state: Option<Arc<IrqTicketLock<TimerState>>>,
}

struct Registry {
    slots: Vec<Slot>,
    free: Vec<usize>,
}

static REGISTRY: IrqTicketLock<Registry> = IrqTicketLock::new(Registry {
    slots: Vec::new(),
    free: Vec::new(),
});

struct Wheel {
    /// (deadline, slot index) → generation at enqueue time.
    queue: BTreeMap<(u64, usize), u64>,
}

static WHEEL: IrqTicketLock<Wheel> = IrqTicketLock::new(Wheel {
    queue: BTreeMap::new(),
});

static COMPARATOR: OnceCell<usize> = OnceCell::uninit();

/// Claim the wheel's comparator and let it idle.
pub fn init() {
    let comparator =
        hpet::allocate_comparator(false).expect("timer: no HPET comparator available");
    COMPARATOR.init_once(|| comparator);

    let armed = hpet::comparator_start(comparator, false, IDLE_REARM_NS, tick, core::ptr::null_mut());
    assert!(armed, "timer: could not arm wheel comparator");

    log::info!("timer: wheel driven by HPET comparator {}", comparator);
}

/// Create a timer; it starts stopped.
pub fn create(period_ns: u64, periodic: bool, handler: TimerFn, userptr: *mut ()) -> TimerHandle {
    let state = Arc::new(IrqTicketLock::new(TimerState {
        period_ns,
        periodic,
        queued: false,
        deadline: 0,
        handler: Some(handler),
        userptr,
    }));

    let mut registry = REGISTRY.lock();
    let index = match registry.free.pop() {
        Some(index) => {
            registry.slots[index].state = Some(state);
            index
        }
        None => {
            registry.slots.push(Slot {
                generation: 0,
                state: Some(state),
            });
            registry.slots.len() - 1
        }
    };

    TimerHandle {
        index,
        generation: registry.slots[index].generation,
    }
}

fn lookup(handle: TimerHandle) -> Option<Arc<IrqTicketLock<TimerState>>> {
    let registry = REGISTRY.lock();
    let slot = registry.slots.get(handle.index)?;
    if slot.generation != handle.generation {
        return None;
    }
    slot.state.clone()
}

fn enqueue_locked(state: &mut TimerState, index: usize, generation: u64) {
    let now = hpet::time_ns();
    state.deadline = now + state.period_ns;
    state.queued = true;

    let mut wheel = WHEEL.lock();
    wheel.queue.insert((state.deadline, index), generation);

    if wheel.queue.keys().next() == Some(&(state.deadline, index)) {
        hpet::comparator_rearm(*COMPARATOR.get().unwrap(), state.period_ns);
    }
}

fn dequeue_locked(state: &mut TimerState, index: usize) {
    WHEEL.lock().queue.remove(&(state.deadline, index));
    state.queued = false;
}

/// Arm the timer with its current settings. No-op when already queued.
pub fn start(handle: TimerHandle) {
    let Some(state) = lookup(handle) else { return };
    let mut state = state.lock();
    if !state.queued {
        enqueue_locked(&mut state, handle.index, handle.generation);
    }
}

/// Disarm without destroying. No-op when idle or already fired.
pub fn stop(handle: TimerHandle) {
    let Some(state) = lookup(handle) else { return };
    let mut state = state.lock();
    if state.queued {
        dequeue_locked(&mut state, handle.index);
    }
}

/// Change period/mode, re-arming from now.
pub fn setup(handle: TimerHandle, period_ns: u64, periodic: bool) {
    let Some(state) = lookup(handle) else { return };
    let mut state = state.lock();

    if state.queued {
        dequeue_locked(&mut state, handle.index);
    }
    state.period_ns = period_ns;
    state.periodic = periodic;
    enqueue_locked(&mut state, handle.index, handle.generation);
}

pub fn set_handler(handle: TimerHandle, handler: TimerFn, userptr: *mut ()) {
    let Some(state) = lookup(handle) else { return };
    let mut state = state.lock();
    state.handler = Some(handler);
    state.userptr = userptr;
}

/// Retire the timer. The slot's generation bump invalidates the handle
/// and any queue entries still referencing it.
pub fn destroy(handle: TimerHandle) {
    stop(handle);

    let mut registry = REGISTRY.lock();
    let Some(slot) = registry.slots.get_mut(handle.index) else {
        return;
    };
    if slot.generation != handle.generation {
        return;
    }

    slot.generation += 1;
    slot.state = None;
    registry.free.push(handle.index);
}

/// Comparator callback: fire everything due, re-queue the periodic ones,
/// and re-arm for the new earliest deadline.
fn tick(_: *mut ()) {
    let now = hpet::time_ns();

    let due: Vec<((u64, usize), u64)> = {
        let mut wheel = WHEEL.lock();
        let mut due = Vec::new();
        while let Some((&key, &generation)) = wheel.queue.iter().next() {
            if key.0 > now {
                break;
            }
            wheel.queue.remove(&key);
            due.push((key, generation));
        }
        due
    };

    let mut fired = Vec::new();
    for ((_deadline, index), generation) in due {
        let Some(state) = lookup(TimerHandle { index, generation }) else {
            continue;
        };
        let mut state = state.lock();
        if !state.queued {
            // Raced with stop(); respect the cancellation.
            continue;
        }

        if state.periodic {
            enqueue_locked(&mut state, index, generation);
        } else {
            state.queued = false;
        }

        if let Some(handler) = state.handler {
            fired.push((handler, state.userptr));
        }
    }

    {
        let wheel = WHEEL.lock();
        let delta = match wheel.queue.keys().next() {
            Some(&(deadline, _)) => deadline.saturating_sub(now).max(1),
            None => IDLE_REARM_NS,
        };
        hpet::comparator_rearm(*COMPARATOR.get().unwrap(), delta);
    }

    for (handler, userptr) in fired {
        handler(userptr);
    }
}
