//! Invariant-TSC clock, calibrated per CPU against the HPET.

use core::arch::x86_64::__cpuid;

use crate::per_cpu::{self, TscInfo};
use crate::sync::IrqTicketLock;
use crate::time::hpet;

const CALIBRATION_MS: u64 = 10;
const NS_PER_MS: u64 = 1_000_000;

/// Serialized TSC read: LFENCE keeps earlier loads from drifting past it.
#[inline]
pub fn rdtsc() -> u64 {
    let low: u32;
    let high: u32;
    unsafe {
        core::arch::asm!(
            "lfence",
            "rdtsc",
            out("eax") low,
            out("edx") high,
            options(nostack, nomem)
        );
    }
    ((high as u64) << 32) | low as u64
}

/// Calibrate this CPU's TSC over a short HPET-timed window.
///
/// Requires invariant TSC; anything older has no stable relationship
/// between cycles and time and is not worth supporting.
pub fn init_per_cpu() {
    let ext = unsafe { __cpuid(0x8000_0007) };
    assert!(ext.edx & (1 << 8) != 0, "tsc: invariant TSC required");

    // IRQs masked so nothing stretches the calibration window.
    let lock = IrqTicketLock::new(());
    let info = {
        let _guard = lock.lock();

        let start = rdtsc();
        hpet::poll_sleep(CALIBRATION_MS * NS_PER_MS);
        let end = rdtsc();

        let ticks_per_ms = (end - start) / CALIBRATION_MS;
        TscInfo {
            ticks_per_ms,
            ticks_per_ns: (ticks_per_ms / NS_PER_MS).max(1),
        }
    };

    per_cpu::get_cpu().set_tsc(info);

    log::info!(
        "tsc: {}.{:03} MHz on LAPIC {}",
        info.ticks_per_ms / 1000,
        info.ticks_per_ms % 1000,
        per_cpu::get_cpu().lapic_id
    );
}

pub fn time_ns() -> u64 {
    rdtsc() / per_cpu::get_cpu().tsc().ticks_per_ns
}

pub fn poll_sleep_ns(ns: u64) {
    let goal = rdtsc() + ns * per_cpu::get_cpu().tsc().ticks_per_ns;
    while rdtsc() < goal {
        core::hint::spin_loop();
    }
}

pub fn poll_sleep_ms(ms: u64) {
    let goal = rdtsc() + ms * per_cpu::get_cpu().tsc().ticks_per_ms;
    while rdtsc() < goal {
        core::hint::spin_loop();
    }
}
