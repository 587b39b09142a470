//! HPET driver: main counter timekeeping plus the comparator pool.
//!
//! The register block comes from the ACPI HPET table and is remapped
//! uncacheable. The capabilities register gives the tick period in
//! femtoseconds; `time_ns` scales the main counter by it. Up to 32
//! comparators are tracked; clients allocate one and attach a callback
//! fired from the comparator's IOAPIC-routed IRQ.

use core::sync::atomic::{AtomicU64, Ordering};

use conquer_once::spin::OnceCell;
use x86_64::structures::idt::InterruptStackFrame;

use crate::memory::paging::{kernel_space, CacheMode};
use crate::memory::PhysAddr;
use crate::sync::IrqTicketLock;
use crate::{acpi, interrupts, ioapic, per_cpu};

const REG_CAP: u64 = 0x000;
const REG_CONFIG: u64 = 0x010;
const REG_MAIN_COUNTER: u64 = 0x0F0;

const fn reg_comparator_config(i: usize) -> u64 {
    0x100 + 0x20 * i as u64
}

const fn reg_comparator_value(i: usize) -> u64 {
    0x108 + 0x20 * i as u64
}

const CONFIG_ENABLE: u64 = 1 << 0;

const COMP_INT_ENABLE: u64 = 1 << 2;
const COMP_PERIODIC: u64 = 1 << 3;
const COMP_PERIODIC_CAPABLE: u64 = 1 << 4;
const COMP_FSB_CAPABLE: u64 = 1 << 15;
const COMP_VALUE_SET: u64 = 1 << 6;

const FS_PER_NS: u64 = 1_000_000;

/// Main-counter state needed by `time_ns` without taking any lock.
static MMIO_BASE: AtomicU64 = AtomicU64::new(0);
static PERIOD_FS: AtomicU64 = AtomicU64::new(0);

pub type TimerFn = fn(*mut ());

struct Comparator {
    present: bool,
    allocated: bool,
    supports_periodic: bool,
    supports_fsb: bool,
    /// Bitmask of GSIs this comparator may drive.
    route_mask: u32,
    /// Vector + GSI once the comparator has been routed.
    vector: Option<u8>,
    gsi: u32,
    handler: Option<TimerFn>,
    userptr: *mut (),
}

impl Comparator {
    const fn empty() -> Self {
        Self {
            present: false,
            allocated: false,
            supports_periodic: false,
            supports_fsb: false,
            route_mask: 0,
            vector: None,
            gsi: 0,
            handler: None,
            userptr: core::ptr::null_mut(),
        }
    }
}

unsafe impl Send for Comparator {}

struct Pool {
    comparators: [Comparator; 32],
}

static POOL: OnceCell<IrqTicketLock<Pool>> = OnceCell::uninit();

fn read_reg(offset: u64) -> u64 {
    let base = MMIO_BASE.load(Ordering::Relaxed);
    unsafe { core::ptr::read_volatile((base + offset) as *const u64) }
}

fn write_reg(offset: u64, value: u64) {
    let base = MMIO_BASE.load(Ordering::Relaxed);
    unsafe { core::ptr::write_volatile((base + offset) as *mut u64, value) }
}

/// Map the register block, start the main counter and size the pool.
pub fn init() {
    let table = acpi::hpet().expect("hpet: no ACPI HPET table");
    let base = PhysAddr::new(table.base_address.address);

    // Registers must not be cached.
    kernel_space()
        .lock()
        .set_caching(base.to_virt(), CacheMode::Uncacheable);
    MMIO_BASE.store(base.to_virt().as_u64(), Ordering::Relaxed);

    let cap = read_reg(REG_CAP);
    let period_fs = cap >> 32;
    let n_comparators = ((cap >> 8) & 0x1F) as usize + 1;
    assert!(period_fs != 0, "hpet: zero tick period");
    PERIOD_FS.store(period_fs, Ordering::Relaxed);

    // Stop, zero, restart: a known epoch for time_ns.
    write_reg(REG_CONFIG, read_reg(REG_CONFIG) & !CONFIG_ENABLE);
    write_reg(REG_MAIN_COUNTER, 0);
    write_reg(REG_CONFIG, read_reg(REG_CONFIG) | CONFIG_ENABLE);

    let mut pool = Pool {
        comparators: [const { Comparator::empty() }; 32],
    };
    for i in 0..n_comparators {
        let config = read_reg(reg_comparator_config(i));
        pool.comparators[i] = Comparator {
            present: true,
            allocated: false,
            supports_periodic: config & COMP_PERIODIC_CAPABLE != 0,
            supports_fsb: config & COMP_FSB_CAPABLE != 0,
            route_mask: (config >> 32) as u32,
            vector: None,
            gsi: 0,
            handler: None,
            userptr: core::ptr::null_mut(),
        };
        // Quiesce until someone claims it.
        write_reg(reg_comparator_config(i), config & !(COMP_INT_ENABLE | COMP_PERIODIC));
    }

    POOL.init_once(|| IrqTicketLock::new(pool));

    log::info!(
        "hpet: {} comparators, period {} fs, counter running",
        n_comparators,
        period_fs
    );
}

pub fn time_ns() -> u64 {
    let counter = read_reg(REG_MAIN_COUNTER);
    (counter as u128 * PERIOD_FS.load(Ordering::Relaxed) as u128 / FS_PER_NS as u128) as u64
}

/// Busy-loop until `ns` nanoseconds have passed.
pub fn poll_sleep(ns: u64) {
    let deadline = time_ns() + ns;
    while time_ns() < deadline {
        core::hint::spin_loop();
    }
}

/// Claim a comparator, optionally insisting on periodic capability.
pub fn allocate_comparator(require_periodic: bool) -> Option<usize> {
    let mut pool = POOL.get()?.lock();

    for (i, comparator) in pool.comparators.iter_mut().enumerate() {
        if !comparator.present || comparator.allocated {
            continue;
        }
        if require_periodic && !comparator.supports_periodic {
            continue;
        }

        comparator.allocated = true;
        if comparator.supports_fsb {
            // FSB delivery is tracked but unused; routing goes through
            // the IOAPIC like everything else.
            log::debug!("hpet: comparator {} is FSB capable", i);
        }
        return Some(i);
    }

    None
}

fn comparator_irq(_vector: u8, _frame: &mut InterruptStackFrame, userptr: *mut ()) {
    let index = userptr as usize;

    let (handler, arg) = {
        let pool = POOL.get().unwrap().lock();
        let comparator = &pool.comparators[index];
        (comparator.handler, comparator.userptr)
    };

    if let Some(handler) = handler {
        handler(arg);
    }
}

/// Route the comparator's IRQ (once) and attach the callback, then arm it.
/// `period_ns` is relative for one-shots and the repeat interval for
/// periodic timers.
pub fn comparator_start(
    index: usize,
    periodic: bool,
    period_ns: u64,
    handler: TimerFn,
    userptr: *mut (),
) -> bool {
    let period_fs = PERIOD_FS.load(Ordering::Relaxed);
    let ticks = (period_ns as u128 * FS_PER_NS as u128 / period_fs as u128) as u64;

    let mut pool = POOL.get().expect("hpet: not initialized").lock();
    let comparator = &mut pool.comparators[index];
    assert!(comparator.allocated, "hpet: comparator {} not allocated", index);

    if periodic && !comparator.supports_periodic {
        return false;
    }

    comparator.handler = Some(handler);
    comparator.userptr = userptr;

    if comparator.vector.is_none() {
        // First use: pick the lowest routable GSI and wire it up.
        let gsi = comparator.route_mask.trailing_zeros();
        if gsi == 32 {
            return false;
        }

        let vector = interrupts::allocate_vector();
        interrupts::set_handler(
            vector,
            interrupts::Handler {
                func: Some(comparator_irq),
                userptr: index as *mut (),
                is_reserved: true,
                is_irq: true,
                should_iret: true,
            },
        );
        ioapic::route_gsi(gsi, vector, per_cpu::get_cpu().lapic_id, false, false);

        comparator.vector = Some(vector);
        comparator.gsi = gsi;
    }

    let mut config = read_reg(reg_comparator_config(index));
    config &= !((0x1F << 9) | COMP_PERIODIC);
    config |= (comparator.gsi as u64) << 9;
    config |= COMP_INT_ENABLE;

    if periodic {
        config |= COMP_PERIODIC | COMP_VALUE_SET;
        write_reg(reg_comparator_config(index), config);
        write_reg(
            reg_comparator_value(index),
            read_reg(REG_MAIN_COUNTER) + ticks,
        );
        // With VALUE_SET still in effect this write is the period.
        write_reg(reg_comparator_value(index), ticks);
    } else {
        write_reg(reg_comparator_config(index), config);
        write_reg(
            reg_comparator_value(index),
            read_reg(REG_MAIN_COUNTER) + ticks,
        );
    }

    true
}

/// Move an armed one-shot comparator to a new relative deadline.
pub fn comparator_rearm(index: usize, delta_ns: u64) {
    let period_fs = PERIOD_FS.load(Ordering::Relaxed);
    let ticks = (delta_ns as u128 * FS_PER_NS as u128 / period_fs as u128) as u64;
    write_reg(
        reg_comparator_value(index),
        read_reg(REG_MAIN_COUNTER) + ticks.max(1),
    );
}

/// Disable a comparator's interrupt; the allocation is kept.
pub fn comparator_cancel(index: usize) {
    let pool = POOL.get().expect("hpet: not initialized").lock();
    assert!(pool.comparators[index].allocated);
    let config = read_reg(reg_comparator_config(index));
    write_reg(
        reg_comparator_config(index),
        config & !(COMP_INT_ENABLE | COMP_PERIODIC),
    );
}
