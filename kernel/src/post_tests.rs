//! Post-boot self tests, run on the BSP once bring-up is complete.
//!
//! Each module's `run()` asserts its own invariants against the live
//! kernel; any failure panics with context, which is the test verdict.

pub fn run() {
    log::info!("POST: running self tests");

    crate::sync::tests::run();
    crate::task::thread_tests::run();
    crate::memory::tests::run();
    crate::vmm::emulate_tests::run();
    crate::vmm::tests::run();

    log::info!("POST: all self tests passed");
}
