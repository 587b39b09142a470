//! Per-device DMA arenas.
//!
//! An `Iovmm` owns the I/O virtual address ranges a device may DMA into,
//! handed to it by the device driver. `alloc` carves a first-fit range,
//! backs it with heap memory remapped uncacheable or write-combining,
//! and maps every page into the device's IOMMU context with permissions
//! derived from the transfer direction. Host pages are contiguous in
//! kernel virtual space; each one takes its own IOMMU mapping.

use alloc::vec::Vec;

use crate::iommu;
use crate::pci;

use super::paging::{kernel_space, CacheMode};
use super::walker::PageFlags;
use super::{align_up, heap, VirtAddr, PAGE_SIZE};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmaDirection {
    /// Device writes, host reads.
    DeviceToHost,
    /// Host writes, device reads.
    HostToDevice,
    Bidirectional,
}

impl DmaDirection {
    /// Device-side permissions: present means the device may read.
    fn page_flags(self) -> PageFlags {
        match self {
            DmaDirection::DeviceToHost => PageFlags::WRITE,
            DmaDirection::HostToDevice => PageFlags::PRESENT,
            DmaDirection::Bidirectional => PageFlags::PRESENT | PageFlags::WRITE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmaCaching {
    Uncacheable,
    WriteCombining,
}

impl DmaCaching {
    fn cache_mode(self) -> CacheMode {
        match self {
            DmaCaching::Uncacheable => CacheMode::Uncacheable,
            DmaCaching::WriteCombining => CacheMode::WriteCombining,
        }
    }
}

/// A free extent of the device's I/O virtual address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    pub base: u64,
    pub len: u64,
}

/// A live DMA buffer. A null `host_base` is the exhaustion sentinel.
#[derive(Debug, Clone, Copy)]
pub struct Allocation {
    pub guest_base: u64,
    pub host_base: VirtAddr,
    pub len: usize,
}

impl Allocation {
    pub fn is_null(&self) -> bool {
        self.host_base.is_null()
    }

    pub fn host_slice_mut(&self) -> &mut [u8] {
        unsafe { core::slice::from_raw_parts_mut(self.host_base.as_mut_ptr(), self.len) }
    }
}

pub struct Iovmm {
    device: pci::Address,
    regions: Vec<Region>,
}

impl Iovmm {
    pub fn new(device: pci::Address) -> Self {
        Self {
            device,
            regions: Vec::new(),
        }
    }

    /// Donate a range of device address space to the arena.
    pub fn push_region(&mut self, region: Region) {
        self.regions.push(region);
    }

    #[cfg(feature = "testing")]
    pub fn regions(&self) -> &[Region] {
        &self.regions
    }

    /// Carve a DMA buffer of `len` bytes. Returns `None` when the arena
    /// or the heap is exhausted.
    pub fn alloc(
        &mut self,
        len: usize,
        direction: DmaDirection,
        caching: DmaCaching,
    ) -> Option<Allocation> {
        let aligned_len = align_up(len as u64, PAGE_SIZE);

        let region = self.regions.iter_mut().find(|r| r.len >= aligned_len)?;
        let guest_base = region.base;
        region.base += aligned_len;
        region.len -= aligned_len;

        let host_base = heap::alloc(len, PAGE_SIZE as usize);
        if host_base.is_null() {
            // Give the range back before reporting failure.
            self.release_range(guest_base, aligned_len);
            return None;
        }
        debug_assert!(host_base.is_aligned(PAGE_SIZE));

        // The device sees uncached memory; so must the host side.
        {
            let mut kvmm = kernel_space().lock();
            let mut offset = 0;
            while offset < aligned_len {
                kvmm.set_caching(host_base + offset, caching.cache_mode());
                offset += PAGE_SIZE;
            }
        }

        unsafe {
            core::ptr::write_bytes(host_base.as_mut_ptr::<u8>(), 0, len);
        }

        let flags = direction.page_flags();
        let mut offset = 0;
        while offset < aligned_len {
            let pa = kernel_space().lock().get_phys(host_base + offset);
            iommu::map(self.device, pa, guest_base + offset, flags);
            offset += PAGE_SIZE;
        }

        Some(Allocation {
            guest_base,
            host_base,
            len,
        })
    }

    /// Tear the buffer down: unmap from the device, free the host pages,
    /// and return the range with a one-step merge into its neighbors.
    pub fn free(&mut self, allocation: Allocation) {
        let aligned_len = align_up(allocation.len as u64, PAGE_SIZE);

        let mut offset = 0;
        while offset < aligned_len {
            iommu::unmap(self.device, allocation.guest_base + offset);
            offset += PAGE_SIZE;
        }

        heap::free(allocation.host_base);
        self.release_range(allocation.guest_base, aligned_len);
    }

    fn release_range(&mut self, base: u64, len: u64) {
        // One merge step only; fragmentation beyond that is tolerated.
        for region in &mut self.regions {
            if base + len == region.base {
                region.base -= len;
                region.len += len;
                return;
            }
            if region.base + region.len == base {
                region.len += len;
                return;
            }
        }

        self.regions.push(Region { base, len });
    }
}
