//! Memory management: physical frames, address spaces, heap and DMA arenas.
//!
//! Layering (bottom up): `pmm` hands out 4 KiB frames from a bitmap built
//! over the loader memory map; `walker` is the generic multi-level
//! page-table engine instantiated by `paging` (CPU), `ept`/`npt` (guest
//! second level) and `io_paging`/`sl_paging` (IOMMU); `heap` is the slab +
//! large-allocation kernel allocator; `iovmm` builds DMA-safe regions per
//! device on top of all three.

pub mod ept;
pub mod heap;
pub mod io_paging;
pub mod iovmm;
pub mod npt;
pub mod paging;
pub mod pmm;
pub mod sl_paging;
pub mod walker;

#[cfg(feature = "testing")]
pub mod tests;

use core::fmt;
use core::sync::atomic::{AtomicU64, AtomicU8, Ordering};

/// Size of a physical frame and of every page-table leaf.
pub const PAGE_SIZE: u64 = 4096;

/// Paging depth detected at boot (4 or 5). Written once by `init_bsp`.
static PAGING_LEVELS: AtomicU8 = AtomicU8::new(0);

/// Virtual base of the direct physical-memory window. Written once by
/// `init_bsp`; every physical frame is read and written through it.
static PHYS_MAP_BASE: AtomicU64 = AtomicU64::new(0);

const PHYS_MAP_BASE_4LVL: u64 = 0xFFFF_8000_0000_0000;
const PHYS_MAP_BASE_5LVL: u64 = 0xFF00_0000_0000_0000;

/// A physical address.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct PhysAddr(u64);

/// A virtual address.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct VirtAddr(u64);

impl PhysAddr {
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    pub const fn zero() -> Self {
        Self(0)
    }

    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// The out-of-memory sentinel: frame 0 is never handed out as usable.
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    pub const fn is_aligned(self, align: u64) -> bool {
        self.0 % align == 0
    }

    /// The location of this physical address inside the direct-map window.
    pub fn to_virt(self) -> VirtAddr {
        VirtAddr::new(self.0 + phys_map_base())
    }
}

impl VirtAddr {
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    pub const fn zero() -> Self {
        Self(0)
    }

    pub const fn as_u64(self) -> u64 {
        self.0
    }

    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    pub const fn as_ptr<T>(self) -> *const T {
        self.0 as *const T
    }

    pub const fn as_mut_ptr<T>(self) -> *mut T {
        self.0 as *mut T
    }

    pub const fn is_aligned(self, align: u64) -> bool {
        self.0 % align == 0
    }
}

impl core::ops::Add<u64> for PhysAddr {
    type Output = PhysAddr;
    fn add(self, rhs: u64) -> PhysAddr {
        PhysAddr(self.0 + rhs)
    }
}

impl core::ops::Add<u64> for VirtAddr {
    type Output = VirtAddr;
    fn add(self, rhs: u64) -> VirtAddr {
        VirtAddr(self.0 + rhs)
    }
}

impl fmt::Debug for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PhysAddr({:#x})", self.0)
    }
}

impl fmt::Debug for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VirtAddr({:#x})", self.0)
    }
}

impl fmt::LowerHex for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

impl fmt::LowerHex for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

pub const fn align_down(value: u64, align: u64) -> u64 {
    value & !(align - 1)
}

pub const fn align_up(value: u64, align: u64) -> u64 {
    align_down(value + align - 1, align)
}

/// Number of paging levels the CPU was booted with.
pub fn paging_levels() -> u8 {
    let levels = PAGING_LEVELS.load(Ordering::Relaxed);
    debug_assert!(levels == 4 || levels == 5);
    levels
}

/// Virtual base of the direct physical-memory window.
pub fn phys_map_base() -> u64 {
    PHYS_MAP_BASE.load(Ordering::Relaxed)
}

/// Whether `addr` is canonical for the active paging depth: the split sits
/// at bit 47 with 4 levels and bit 56 with 5.
pub fn is_canonical(addr: u64) -> bool {
    match paging_levels() {
        4 => addr <= 0x0000_7FFF_FFFF_FFFF || addr >= 0xFFFF_8000_0000_0000,
        5 => addr <= 0x00FF_FFFF_FFFF_FFFF || addr >= 0xFF00_0000_0000_0000,
        levels => panic!("unknown paging depth {}", levels),
    }
}

/// Sign-extend `addr` from the canonical split bit.
pub fn canonicalize(addr: u64) -> u64 {
    match paging_levels() {
        4 => (((addr << 16) as i64) >> 16) as u64,
        5 => (((addr << 7) as i64) >> 7) as u64,
        levels => panic!("unknown paging depth {}", levels),
    }
}

/// Detect the paging depth the loader enabled and pick the direct-map base.
///
/// Must run before anything touches physical memory through the window.
pub fn init_bsp() {
    use x86_64::registers::control::{Cr4, Cr4Flags};

    let la57 = Cr4::read().contains(Cr4Flags::L5_PAGING);
    let (levels, base) = if la57 {
        (5, PHYS_MAP_BASE_5LVL)
    } else {
        (4, PHYS_MAP_BASE_4LVL)
    };

    PAGING_LEVELS.store(levels, Ordering::Relaxed);
    PHYS_MAP_BASE.store(base, Ordering::Relaxed);

    log::info!(
        "memory: using {} paging levels, phys map at {:#x}",
        levels,
        base
    );
}

/// Bring up the physical allocator, the kernel address space and the heap,
/// in that order, then switch to the kernel page tables.
pub fn init(boot: &crate::boot::stivale2::Parser) {
    pmm::init(boot);
    paging::init_kernel_space(boot);
    heap::init();
}
