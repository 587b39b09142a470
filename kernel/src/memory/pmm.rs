//! Physical frame allocator.
//!
//! One bit per 4 KiB frame over `[0, highest usable address)`. A set bit
//! means "not free": the bitmap starts fully set, usable regions from the
//! loader memory map are then released frame by frame, and finally the
//! frames holding the bitmap itself are reserved back.

use conquer_once::spin::OnceCell;

use crate::boot::stivale2;
use crate::sync::TicketLock;

use super::{align_down, align_up, phys_map_base, PhysAddr, PAGE_SIZE};

/// Upper bound on distinct usable regions; matches generous UEFI maps.
const MAX_REGIONS: usize = 64;

/// A usable span of physical memory, 4 KiB aligned inward.
#[derive(Debug, Clone, Copy)]
pub struct Region {
    pub base: u64,
    pub len: u64,
}

/// Counters for diagnostics and the destruction-accounting self tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameStats {
    pub total_frames: usize,
    pub free_frames: usize,
}

/// The bitmap allocator itself. The global instance is built over the boot
/// memory map; tests build private instances over synthetic region sets.
pub struct FrameAllocator {
    bitmap: &'static mut [u8],
    highest: u64,
}

impl FrameAllocator {
    /// Build an allocator over `regions` using caller-provided bitmap
    /// storage. The storage must cover one bit per frame below the top of
    /// the highest region; all frames start reserved and the regions are
    /// then released.
    pub fn with_storage(regions: &[Region], bitmap: &'static mut [u8]) -> Self {
        let highest = regions
            .iter()
            .map(|r| r.base + r.len)
            .max()
            .expect("pmm: empty region set");
        assert!(
            bitmap.len() as u64 * 8 >= highest / PAGE_SIZE,
            "pmm: bitmap storage too small"
        );

        bitmap.fill(0xFF);

        let mut allocator = Self { bitmap, highest };
        for region in regions {
            let mut addr = region.base;
            while addr < region.base + region.len {
                allocator.free_block(PhysAddr::new(addr));
                addr += PAGE_SIZE;
            }
        }

        allocator
    }

    /// Lowest free frame, or `None` when physical memory is exhausted.
    pub fn alloc_block(&mut self) -> Option<PhysAddr> {
        for (i, byte) in self.bitmap.iter_mut().enumerate() {
            if *byte == 0xFF {
                continue;
            }

            for j in 0..8 {
                if *byte & (1 << j) == 0 {
                    *byte |= 1 << j;
                    return Some(PhysAddr::new((i as u64 * 8 + j) * PAGE_SIZE));
                }
            }
        }

        None
    }

    /// First run of `n` physically contiguous free frames, or `None`.
    pub fn alloc_n_blocks(&mut self, n: usize) -> Option<PhysAddr> {
        assert!(n > 0);

        let total_bits = self.bitmap.len() * 8;
        let mut run = 0usize;
        let mut bit = 0usize;

        while bit < total_bits {
            // A fully occupied byte breaks any run; skip it whole.
            if bit % 8 == 0 && self.bitmap[bit / 8] == 0xFF {
                run = 0;
                bit += 8;
                continue;
            }

            if self.bitmap[bit / 8] & (1 << (bit % 8)) == 0 {
                run += 1;
                if run == n {
                    let start = bit + 1 - n;
                    for b in start..=bit {
                        self.bitmap[b / 8] |= 1 << (b % 8);
                    }
                    return Some(PhysAddr::new(start as u64 * PAGE_SIZE));
                }
            } else {
                run = 0;
            }

            bit += 1;
        }

        None
    }

    pub fn free_block(&mut self, block: PhysAddr) {
        let frame = block.as_u64() / PAGE_SIZE;
        self.bitmap[frame as usize / 8] &= !(1 << (frame % 8));
    }

    pub fn reserve_block(&mut self, block: PhysAddr) {
        let frame = block.as_u64() / PAGE_SIZE;
        self.bitmap[frame as usize / 8] |= 1 << (frame % 8);
    }

    pub fn stats(&self) -> FrameStats {
        let total_frames = (self.highest / PAGE_SIZE) as usize;
        let free_frames = self
            .bitmap
            .iter()
            .map(|byte| byte.count_zeros() as usize)
            .sum();
        FrameStats {
            total_frames,
            free_frames,
        }
    }
}

static PMM: OnceCell<TicketLock<FrameAllocator>> = OnceCell::uninit();

/// Build the global allocator from the loader memory map.
///
/// Failing to find a home for the bitmap inside a usable region is fatal:
/// nothing can allocate without it.
pub fn init(boot: &stivale2::Parser) {
    let mut regions = [Region { base: 0, len: 0 }; MAX_REGIONS];
    let mut region_count = 0;
    let mut memory_size = 0u64;
    let mut highest = 0u64;

    log::info!("pmm: loader memory map:");
    for entry in boot.memory_map() {
        log::info!(
            "   - {:#x} - {:#x}: {}",
            entry.base,
            entry.base + entry.length,
            stivale2::mmap_type_to_string(entry.kind)
        );

        if entry.kind != stivale2::MMAP_USABLE {
            continue;
        }

        // Align the region inward so it only covers whole frames.
        let base = align_up(entry.base, PAGE_SIZE);
        let len = align_down(entry.length - (base - entry.base), PAGE_SIZE);
        if len == 0 {
            continue;
        }

        memory_size += len;
        if base + len > highest {
            highest = base + len;
        }

        assert!(region_count < MAX_REGIONS, "pmm: too many usable regions");
        regions[region_count] = Region { base, len };
        region_count += 1;
    }

    log::info!(
        "pmm: detected {} MiB of usable RAM",
        memory_size / 1024 / 1024
    );

    let bitmap_size = align_up(highest / PAGE_SIZE, 8) / 8;
    log::info!(
        "pmm: highest usable address {:#x} => bitmap of {:#x} bytes",
        highest,
        bitmap_size
    );

    // Host the bitmap in the first usable region large enough for it.
    let host = regions[..region_count]
        .iter()
        .find(|r| r.len >= bitmap_size)
        .copied()
        .unwrap_or_else(|| panic!("pmm: no usable region fits the bitmap"));

    // The bitmap is accessed through the direct map for its whole lifetime.
    let storage = unsafe {
        core::slice::from_raw_parts_mut(
            (host.base + phys_map_base()) as *mut u8,
            bitmap_size as usize,
        )
    };

    let mut allocator = FrameAllocator::with_storage(&regions[..region_count], storage);

    // The frames the bitmap itself occupies are not allocatable.
    let mut addr = host.base;
    while addr < host.base + align_up(bitmap_size, PAGE_SIZE) {
        allocator.reserve_block(PhysAddr::new(addr));
        addr += PAGE_SIZE;
    }

    PMM.init_once(|| TicketLock::new(allocator));
}

fn global() -> &'static TicketLock<FrameAllocator> {
    PMM.get().expect("pmm: not initialized")
}

pub fn alloc_block() -> Option<PhysAddr> {
    global().lock().alloc_block()
}

pub fn alloc_n_blocks(n: usize) -> Option<PhysAddr> {
    global().lock().alloc_n_blocks(n)
}

pub fn free_block(block: PhysAddr) {
    global().lock().free_block(block)
}

pub fn reserve_block(block: PhysAddr) {
    global().lock().reserve_block(block)
}

pub fn stats() -> FrameStats {
    global().lock().stats()
}
