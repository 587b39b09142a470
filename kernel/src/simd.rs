//! SIMD state save/restore for the VM layer.
//!
//! Guest FPU/SSE/AVX state is parked in a per-CPU scratch area around VM
//! entries. XSAVE is preferred; FXSAVE is the fallback. A CPU with
//! neither has no business running guests, and hitting one is fatal.

use alloc::alloc::{alloc_zeroed, dealloc, Layout};

use core::arch::x86_64::{__cpuid, __cpuid_count};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveMechanism {
    Xsave,
    Fxsave,
}

#[derive(Debug, Clone, Copy)]
pub struct SimdInfo {
    pub mechanism: SaveMechanism,
    pub region_size: usize,
}

const REGION_ALIGN: usize = 64;
const FXSAVE_SIZE: usize = 512;

/// Probe how this CPU saves SIMD state.
pub fn detect() -> SimdInfo {
    let leaf1 = unsafe { __cpuid(1) };

    if leaf1.ecx & (1 << 26) != 0 {
        // XSAVE: region size for the currently enabled feature set.
        let xsave = unsafe { __cpuid_count(0xD, 0) };
        SimdInfo {
            mechanism: SaveMechanism::Xsave,
            region_size: xsave.ebx as usize,
        }
    } else if leaf1.edx & (1 << 24) != 0 {
        SimdInfo {
            mechanism: SaveMechanism::Fxsave,
            region_size: FXSAVE_SIZE,
        }
    } else {
        panic!("unknown SIMD save mechanism");
    }
}

/// One save area, allocated to the detected size and alignment.
pub struct SimdArea {
    region: *mut u8,
    info: SimdInfo,
}

unsafe impl Send for SimdArea {}

impl SimdArea {
    pub fn new() -> Self {
        let info = detect();
        let layout = Layout::from_size_align(info.region_size.max(FXSAVE_SIZE), REGION_ALIGN)
            .expect("simd: bad save area layout");
        let region = unsafe { alloc_zeroed(layout) };
        if region.is_null() {
            panic!("simd: out of memory for save area");
        }

        Self { region, info }
    }

    pub fn save(&mut self) {
        unsafe {
            match self.info.mechanism {
                SaveMechanism::Xsave => core::arch::asm!(
                    "xsave [{}]",
                    in(reg) self.region,
                    in("eax") u32::MAX,
                    in("edx") u32::MAX,
                    options(nostack, preserves_flags)
                ),
                SaveMechanism::Fxsave => core::arch::asm!(
                    "fxsave [{}]",
                    in(reg) self.region,
                    options(nostack, preserves_flags)
                ),
            }
        }
    }

    pub fn restore(&self) {
        unsafe {
            match self.info.mechanism {
                SaveMechanism::Xsave => core::arch::asm!(
                    "xrstor [{}]",
                    in(reg) self.region,
                    in("eax") u32::MAX,
                    in("edx") u32::MAX,
                    options(nostack, preserves_flags)
                ),
                SaveMechanism::Fxsave => core::arch::asm!(
                    "fxrstor [{}]",
                    in(reg) self.region,
                    options(nostack, preserves_flags)
                ),
            }
        }
    }
}

impl Drop for SimdArea {
    fn drop(&mut self) {
        let layout =
            Layout::from_size_align(self.info.region_size.max(FXSAVE_SIZE), REGION_ALIGN).unwrap();
        unsafe { dealloc(self.region, layout) };
    }
}
