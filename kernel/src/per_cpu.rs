//! Per-CPU data reached through the GS base.
//!
//! The first word of [`CpuData`] is a pointer to itself; `get_cpu()` reads
//! it GS-relative, so the accessor works identically on every CPU once
//! `init()` has run there.

use core::cell::UnsafeCell;

use alloc::boxed::Box;

use x86_64::registers::model_specific::GsBase;

use crate::gdt::CpuGdt;
use crate::lapic::Lapic;
use crate::simd;
use crate::task::scheduler::Scheduler;

/// TSC calibration results, filled in by `time::tsc::init_per_cpu`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TscInfo {
    pub ticks_per_ms: u64,
    pub ticks_per_ns: u64,
}

#[repr(C)]
pub struct CpuData {
    /// Must stay the first field: `get_cpu` reads `gs:[0]`.
    self_ptr: *mut CpuData,
    pub lapic_id: u32,
    pub lapic: Lapic,
    pub gdt: CpuGdt,
    pub tsc: UnsafeCell<TscInfo>,
    /// Scratch area for guest SIMD state around VM entries.
    pub simd_scratch: UnsafeCell<simd::SimdArea>,
    scheduler: UnsafeCell<Scheduler>,
}

impl CpuData {
    /// The CPU-local scheduler. Only ever touched from the owning CPU
    /// with interrupts masked.
    pub fn scheduler(&self) -> *mut Scheduler {
        self.scheduler.get()
    }

    pub fn tsc(&self) -> &TscInfo {
        unsafe { &*self.tsc.get() }
    }

    pub fn set_tsc(&self, info: TscInfo) {
        unsafe { *self.tsc.get() = info };
    }
}

/// The calling CPU's data block.
pub fn get_cpu() -> &'static CpuData {
    let cpu: *const CpuData;
    unsafe {
        core::arch::asm!(
            "mov {}, gs:[0]",
            out(reg) cpu,
            options(nostack, preserves_flags, pure, readonly)
        );
        &*cpu
    }
}

/// Stand up this CPU's data block, GDT/TSS and LAPIC handle, and adopt the
/// running flow as its first thread. Heap must be live.
pub fn init(lapic_id: u32) {
    let cpu = Box::leak(Box::new(CpuData {
        self_ptr: core::ptr::null_mut(),
        lapic_id,
        lapic: Lapic::new(),
        gdt: CpuGdt::new(),
        tsc: UnsafeCell::new(TscInfo::default()),
        simd_scratch: UnsafeCell::new(simd::SimdArea::new()),
        scheduler: UnsafeCell::new(Scheduler::new_adopting_current()),
    }));

    cpu.self_ptr = cpu as *mut CpuData;
    GsBase::write(x86_64::VirtAddr::new(cpu.self_ptr as u64));

    unsafe { cpu.gdt.load() };
    cpu.lapic.enable();

    log::info!("cpu: per-CPU data live for LAPIC {}", lapic_id);
}
