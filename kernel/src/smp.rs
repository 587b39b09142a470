//! SMP bring-up over the stivale2 startup mailboxes.
//!
//! The loader parks every AP spinning on its `goto_address` word. The BSP
//! gives each one a fresh 4 KiB bootstrap stack and publishes the entry
//! point with a seq-cst store; the AP loads the stack and jumps with its
//! own `SmpInfo` in `rdi`.

use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crate::boot::stivale2::{Parser, SmpInfo};
use crate::memory::{paging, pmm, PAGE_SIZE};
use crate::{interrupts, per_cpu, time};

static CPUS_ONLINE: AtomicUsize = AtomicUsize::new(1);

pub fn cpus_online() -> usize {
    CPUS_ONLINE.load(Ordering::SeqCst)
}

/// Wake every AP the loader reported.
pub fn start_cpus(boot: &Parser) {
    let Some(smp) = boot.smp() else {
        log::info!("smp: no SMP tag, staying single-CPU");
        return;
    };

    let x2apic = smp.flags & 1 != 0;
    log::info!(
        "smp: detected {} CPUs, with {}",
        smp.cpu_count,
        if x2apic { "x2APIC" } else { "xAPIC" }
    );

    for cpu in boot.smp_entries() {
        let is_bsp = cpu.lapic_id == smp.bsp_lapic_id;
        log::info!(
            "   - LAPIC {}: ACPI UID {} {}",
            cpu.lapic_id,
            cpu.processor_id,
            if is_bsp { "(BSP)" } else { "(AP)" }
        );

        if is_bsp {
            continue;
        }

        let stack = pmm::alloc_block().expect("smp: out of frames for AP bootstrap stack");
        cpu.target_stack = stack.to_virt().as_u64() + PAGE_SIZE;

        // The AP polls this word; the store is its starting gun.
        let mailbox = unsafe { AtomicU64::from_ptr(&mut cpu.goto_address as *mut u64) };
        mailbox.store(ap_entry as usize as u64, Ordering::SeqCst);
    }
}

/// Common entry for every AP: kernel page tables, per-CPU state, IDT,
/// clocks, then the scheduler idle loop.
extern "C" fn ap_entry(info: &'static SmpInfo) -> ! {
    paging::init_cpu();
    unsafe { paging::kernel_space().lock().switch() };

    per_cpu::init(info.lapic_id);
    interrupts::load_ap();
    time::tsc::init_per_cpu();

    CPUS_ONLINE.fetch_add(1, Ordering::SeqCst);
    log::info!("smp: CPU with LAPIC {} online", info.lapic_id);

    x86_64::instructions::interrupts::enable();
    loop {
        crate::task::yield_now();
        x86_64::instructions::hlt();
    }
}
