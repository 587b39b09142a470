//! Intel VT-d second-level translation: the `walker` engine for DMA
//! remapping behind a VT-d unit. Leaves optionally request snooping; on a
//! non-coherent unit every table page is remapped to the unit's cache mode
//! and every written entry is flushed out of the CPU caches so the
//! hardware walker observes it.

use bitfield_struct::bitfield;

use super::paging::{kernel_space, CacheMode};
use super::walker::{Context, Engine, PageFlags};
use super::{PhysAddr, VirtAddr, PAGE_SIZE};

#[bitfield(u64)]
pub struct SlEntry {
    pub read: bool,
    pub write: bool,
    pub execute: bool,
    #[bits(3)]
    pub ext_mem_type: u8,
    pub ignore_pat: bool,
    pub reserved: bool,
    pub accessed: bool,
    pub dirty: bool,
    pub reserved0: bool,
    pub snoop: bool,
    #[bits(40)]
    pub frame: u64,
    #[bits(10)]
    pub reserved1: u16,
    pub transient: bool,
    pub reserved2: bool,
}

fn clflush(addr: u64) {
    unsafe {
        core::arch::asm!("clflush [{}]", in(reg) addr, options(nostack, preserves_flags));
    }
}

pub struct SlEngine {
    /// Request DMA snooping on every leaf (page-snoop capable units).
    snoop: bool,
    /// Whether the unit's page walks are cache coherent.
    coherent: bool,
    cache_mode: CacheMode,
}

impl Engine for SlEngine {
    fn is_present(&self, raw: u64) -> bool {
        SlEntry::from(raw).read()
    }

    fn intermediate(&self, frame: PhysAddr, _child_level: u8) -> u64 {
        SlEntry::new()
            .with_read(true)
            .with_write(true)
            .with_frame(frame.as_u64() >> 12)
            .into()
    }

    fn leaf(&self, frame: PhysAddr, flags: PageFlags) -> u64 {
        SlEntry::new()
            .with_read(flags.contains(PageFlags::PRESENT))
            .with_write(flags.contains(PageFlags::WRITE))
            .with_execute(flags.contains(PageFlags::EXECUTE))
            .with_snoop(self.snoop)
            .with_frame(frame.as_u64() >> 12)
            .into()
    }

    fn apply_flags(&self, raw: u64, flags: PageFlags) -> u64 {
        SlEntry::from(raw)
            .with_read(flags.contains(PageFlags::PRESENT))
            .with_write(flags.contains(PageFlags::WRITE))
            .with_execute(flags.contains(PageFlags::EXECUTE))
            .into()
    }

    fn flags_of(&self, raw: u64) -> PageFlags {
        let entry = SlEntry::from(raw);
        let mut flags = PageFlags::empty();
        flags.set(PageFlags::PRESENT, entry.read());
        flags.set(PageFlags::WRITE, entry.write());
        flags.set(PageFlags::EXECUTE, entry.execute());
        flags
    }

    fn invalidate(&self, _root: PhysAddr, _va: VirtAddr) {
        // The VT-d driver issues IOTLB invalidations through its queued
        // invalidation interface; nothing to do CPU-side.
    }

    fn table_allocated(&self, pa: PhysAddr) {
        let va = pa.to_virt();
        kernel_space().lock().set_caching(va, self.cache_mode);

        if !self.coherent {
            // The table was just zeroed through the old mapping; push the
            // lines out before the hardware walks it.
            let mut line = va.as_u64();
            while line < va.as_u64() + PAGE_SIZE {
                clflush(line);
                line += 64;
            }
        }
    }

    fn entry_written(&self, entry: *const u64) {
        if !self.coherent {
            clflush(entry as u64);
        }
    }
}

/// A device DMA address space behind a VT-d unit.
pub type SlContext = Context<SlEngine>;

pub fn new_context(levels: u8, snoop: bool, coherent: bool) -> SlContext {
    let cache_mode = if coherent {
        CacheMode::WriteBack
    } else {
        CacheMode::Uncacheable
    };

    SlContext::new(
        levels,
        SlEngine {
            snoop,
            coherent,
            cache_mode,
        },
    )
}
