//! Clocks and timers: HPET for wall time and deadline IRQs, the TSC for
//! cheap per-CPU reads, and the deadline wheel on top.

pub mod hpet;
pub mod timer;
pub mod tsc;

/// Nanoseconds since the HPET main counter started.
pub fn time_ns() -> u64 {
    hpet::time_ns()
}

/// Busy-wait for `ns` nanoseconds.
pub fn poll_sleep_ns(ns: u64) {
    hpet::poll_sleep(ns)
}

pub fn poll_sleep_ms(ms: u64) {
    hpet::poll_sleep(ms * 1_000_000)
}

/// Bring up HPET, calibrate the boot CPU's TSC against it, then start the
/// timer wheel.
pub fn init() {
    hpet::init();
    tsc::init_per_cpu();
    timer::init();
}
