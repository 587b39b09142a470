//! AMD-Vi I/O translation: the `walker` engine for DMA remapping behind an
//! AMD IOMMU. Intermediate entries carry the level of the table they point
//! at in `next_level`; leaves use `next_level` 0 and are always marked
//! coherent. No CPU-side invalidation: the IOMMU driver flushes its IOTLB.

use bitfield_struct::bitfield;

use super::walker::{Context, Engine, PageFlags};
use super::{PhysAddr, VirtAddr};

#[bitfield(u64)]
pub struct IoEntry {
    pub present: bool,
    #[bits(4)]
    pub reserved: u8,
    pub accessed: bool,
    pub dirty: bool,
    #[bits(2)]
    pub ignored: u8,
    #[bits(3)]
    pub next_level: u8,
    #[bits(40)]
    pub frame: u64,
    #[bits(7)]
    pub reserved0: u8,
    pub user: bool,
    pub coherent: bool,
    pub read: bool,
    pub write: bool,
    pub ignored0: bool,
}

pub struct IoEngine;

impl Engine for IoEngine {
    fn is_present(&self, raw: u64) -> bool {
        IoEntry::from(raw).present()
    }

    fn intermediate(&self, frame: PhysAddr, child_level: u8) -> u64 {
        IoEntry::new()
            .with_present(true)
            .with_read(true)
            .with_write(true)
            .with_next_level(child_level)
            .with_frame(frame.as_u64() >> 12)
            .into()
    }

    fn leaf(&self, frame: PhysAddr, flags: PageFlags) -> u64 {
        IoEntry::new()
            .with_present(true)
            .with_read(flags.contains(PageFlags::PRESENT))
            .with_write(flags.contains(PageFlags::WRITE))
            .with_next_level(0)
            .with_coherent(true)
            .with_frame(frame.as_u64() >> 12)
            .into()
    }

    fn apply_flags(&self, raw: u64, flags: PageFlags) -> u64 {
        IoEntry::from(raw)
            .with_read(flags.contains(PageFlags::PRESENT))
            .with_write(flags.contains(PageFlags::WRITE))
            .into()
    }

    fn flags_of(&self, raw: u64) -> PageFlags {
        let entry = IoEntry::from(raw);
        let mut flags = PageFlags::empty();
        flags.set(PageFlags::PRESENT, entry.read());
        flags.set(PageFlags::WRITE, entry.write());
        flags
    }

    fn invalidate(&self, _root: PhysAddr, _va: VirtAddr) {
        // The AMD IOMMU driver queues INVALIDATE_IOMMU_PAGES commands; the
        // CPU has nothing to flush here.
    }
}

/// A device DMA address space behind an AMD IOMMU.
pub type IoContext = Context<IoEngine>;

pub fn new_context(levels: u8) -> IoContext {
    IoContext::new(levels, IoEngine)
}
