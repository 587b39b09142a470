//! Kernel heap: slab pools for small objects, frame runs for large ones.
//!
//! Allocations under half a slab are served from 4 KiB slabs formatted to
//! one (size, align) class with an intrusive free list in the free cells.
//! Anything bigger becomes a contiguous frame run tracked by a large-
//! allocation record. Slabs and records live in a chain of 4 KiB pool
//! frames, each a header plus an array of tagged slots.
//!
//! Everything is serialized under one IRQ-saving ticket lock because the
//! heap is called from both thread and interrupt context. The allocator
//! also backs `#[global_allocator]`, so `alloc` collections work anywhere
//! past `init()`.

use core::alloc::{GlobalAlloc, Layout};
use core::ptr;

use crate::sync::IrqTicketLock;

use super::{phys_map_base, pmm, PhysAddr, VirtAddr, PAGE_SIZE};

/// Requests at or past this go to a frame run: a slab must fit at least
/// two entries to be worth formatting.
pub const LARGE_ALLOC_THRESHOLD: usize = PAGE_SIZE as usize / 2;

const SLAB_SIZE: usize = PAGE_SIZE as usize;

/// A free cell holds the link to the next free cell.
#[repr(C)]
struct FreeEntry {
    next: *mut FreeEntry,
}

/// A 4 KiB region cut into equal cells of one (size, align) class.
struct Slab {
    base: VirtAddr,
    free: *mut FreeEntry,
    entry_size: usize,
    length: usize,
    align: usize,
}

impl Slab {
    /// Format the region at `base` for `length`-byte objects aligned to
    /// `align`, threading the free list through the cells.
    fn format(base: VirtAddr, length: usize, align: usize) -> Self {
        let value_size = super::align_up(length as u64, align as u64) as usize;
        let entry_size = value_size.max(core::mem::size_of::<FreeEntry>());
        let n_entries = SLAB_SIZE / entry_size;

        for i in 0..n_entries {
            let entry = (base.as_u64() as usize + i * entry_size) as *mut FreeEntry;
            let next = if i + 1 < n_entries {
                (base.as_u64() as usize + (i + 1) * entry_size) as *mut FreeEntry
            } else {
                ptr::null_mut()
            };
            unsafe { (*entry).next = next };
        }

        Self {
            base,
            free: base.as_mut_ptr(),
            entry_size,
            length,
            align,
        }
    }

    fn alloc(&mut self) -> VirtAddr {
        if self.free.is_null() {
            return VirtAddr::zero();
        }

        let entry = self.free;
        self.free = unsafe { (*entry).next };
        VirtAddr::new(entry as u64)
    }

    fn free(&mut self, addr: VirtAddr) {
        debug_assert!(self.contains(addr));
        debug_assert_eq!(
            (addr.as_u64() - self.base.as_u64()) as usize % self.entry_size,
            0,
            "heap: free of a pointer inside a cell"
        );

        let entry = addr.as_mut_ptr::<FreeEntry>();
        unsafe { (*entry).next = self.free };
        self.free = entry;
    }

    fn contains(&self, addr: VirtAddr) -> bool {
        addr.as_u64() >= self.base.as_u64() && addr.as_u64() < self.base.as_u64() + SLAB_SIZE as u64
    }

    fn is_suitable(&self, length: usize, align: usize) -> bool {
        self.length == length && self.align == align
    }
}

/// A contiguous frame run serving one big allocation. The record is kept
/// (and reused) after the run is freed.
struct LargeAllocation {
    free: bool,
    address: VirtAddr,
    frames: usize,
    size: usize,
}

enum PoolItem {
    None,
    Slab(Slab),
    Large(LargeAllocation),
}

const POOL_ITEMS: usize =
    (PAGE_SIZE as usize - core::mem::size_of::<usize>()) / core::mem::size_of::<PoolItem>();

/// A 4 KiB frame of tagged slots, chained to the next pool.
#[repr(C)]
struct Pool {
    next: *mut Pool,
    items: [PoolItem; POOL_ITEMS],
}

const _: () = assert!(core::mem::size_of::<Pool>() <= PAGE_SIZE as usize);

pub struct Allocator {
    start: *mut Pool,
}

unsafe impl Send for Allocator {}

impl Allocator {
    pub const fn new() -> Self {
        Self {
            start: ptr::null_mut(),
        }
    }

    /// Chain in a fresh pool frame. Returns null when out of frames.
    fn alloc_pool(&mut self) -> *mut Pool {
        let Some(pa) = pmm::alloc_block() else {
            return ptr::null_mut();
        };

        let pool = pa.to_virt().as_mut_ptr::<Pool>();
        unsafe {
            ptr::addr_of_mut!((*pool).next).write(self.start);
            let items = ptr::addr_of_mut!((*pool).items) as *mut PoolItem;
            for i in 0..POOL_ITEMS {
                items.add(i).write(PoolItem::None);
            }
        }

        self.start = pool;
        pool
    }

    /// Claim a free slot, growing the chain when every pool is full.
    fn free_slot(&mut self) -> Option<&mut PoolItem> {
        let mut pool = self.start;
        while !pool.is_null() {
            let items = unsafe { &mut (*pool).items };
            if let Some(slot) = items.iter_mut().find(|i| matches!(i, PoolItem::None)) {
                // Borrow checker cannot see across the raw chain walk.
                return Some(unsafe { &mut *(slot as *mut PoolItem) });
            }
            pool = unsafe { (*pool).next };
        }

        let pool = self.alloc_pool();
        if pool.is_null() {
            return None;
        }
        Some(unsafe { &mut (*pool).items[0] })
    }

    pub fn alloc(&mut self, length: usize, align: usize) -> VirtAddr {
        assert!(length > 0 && align.is_power_of_two());

        if length >= LARGE_ALLOC_THRESHOLD {
            return self.alloc_large(length);
        }

        // An existing slab of this class with room wins.
        let mut pool = self.start;
        while !pool.is_null() {
            for item in unsafe { &mut (*pool).items } {
                if let PoolItem::Slab(slab) = item {
                    if slab.is_suitable(length, align) {
                        let addr = slab.alloc();
                        if !addr.is_null() {
                            return addr;
                        }
                    }
                }
            }
            pool = unsafe { (*pool).next };
        }

        // Format a fresh slab for the class.
        let Some(pa) = pmm::alloc_block() else {
            return VirtAddr::zero();
        };
        let Some(slot) = self.free_slot() else {
            pmm::free_block(pa);
            return VirtAddr::zero();
        };

        let mut slab = Slab::format(pa.to_virt(), length, align);
        let addr = slab.alloc();
        *slot = PoolItem::Slab(slab);
        addr
    }

    fn alloc_large(&mut self, length: usize) -> VirtAddr {
        let frames = (length + PAGE_SIZE as usize - 1) / PAGE_SIZE as usize;
        let Some(pa) = pmm::alloc_n_blocks(frames) else {
            return VirtAddr::zero();
        };
        let address = pa.to_virt();

        // Prefer reviving a retired record over burning a fresh slot.
        let mut pool = self.start;
        while !pool.is_null() {
            for item in unsafe { &mut (*pool).items } {
                if let PoolItem::Large(large) = item {
                    if large.free {
                        *large = LargeAllocation {
                            free: false,
                            address,
                            frames,
                            size: length,
                        };
                        return address;
                    }
                }
            }
            pool = unsafe { (*pool).next };
        }

        let Some(slot) = self.free_slot() else {
            for i in 0..frames {
                pmm::free_block(pa + (i as u64 * PAGE_SIZE));
            }
            return VirtAddr::zero();
        };

        *slot = PoolItem::Large(LargeAllocation {
            free: false,
            address,
            frames,
            size: length,
        });
        address
    }

    /// Return `addr` to whichever slab or large record owns it. A pointer
    /// the heap never handed out is a fatal error: continuing would
    /// corrupt pool state.
    pub fn free(&mut self, addr: VirtAddr) {
        let mut pool = self.start;
        while !pool.is_null() {
            for item in unsafe { &mut (*pool).items } {
                match item {
                    PoolItem::Slab(slab) if slab.contains(addr) => {
                        slab.free(addr);
                        return;
                    }
                    PoolItem::Large(large) if !large.free && large.address == addr => {
                        let pa = PhysAddr::new(addr.as_u64() - phys_map_base());
                        for i in 0..large.frames {
                            pmm::free_block(pa + (i as u64 * PAGE_SIZE));
                        }
                        large.free = true;
                        return;
                    }
                    _ => {}
                }
            }
            pool = unsafe { (*pool).next };
        }

        panic!("heap: free of foreign pointer {:#x}", addr);
    }

    /// Size the heap is holding for `addr`, when it owns it.
    fn size_of(&self, addr: VirtAddr) -> Option<usize> {
        let mut pool = self.start;
        while !pool.is_null() {
            for item in unsafe { &(*pool).items } {
                match item {
                    PoolItem::Slab(slab) if slab.contains(addr) => return Some(slab.length),
                    PoolItem::Large(large) if !large.free && large.address == addr => {
                        return Some(large.size)
                    }
                    _ => {}
                }
            }
            pool = unsafe { (*pool).next };
        }
        None
    }

    pub fn realloc(&mut self, addr: VirtAddr, length: usize, align: usize) -> VirtAddr {
        if addr.is_null() {
            return self.alloc(length, align);
        }

        let old_size = self
            .size_of(addr)
            .unwrap_or_else(|| panic!("heap: realloc of foreign pointer {:#x}", addr));

        let new = self.alloc(length, align);
        if new.is_null() {
            return VirtAddr::zero();
        }

        unsafe {
            ptr::copy_nonoverlapping(
                addr.as_ptr::<u8>(),
                new.as_mut_ptr::<u8>(),
                old_size.min(length),
            );
        }
        self.free(addr);

        new
    }

    /// Whether `addr` is backed by a slab (as opposed to a frame run).
    #[cfg(feature = "testing")]
    pub fn is_slab_backed(&self, addr: VirtAddr) -> Option<bool> {
        let mut pool = self.start;
        while !pool.is_null() {
            for item in unsafe { &(*pool).items } {
                match item {
                    PoolItem::Slab(slab) if slab.contains(addr) => return Some(true),
                    PoolItem::Large(large) if !large.free && large.address == addr => {
                        return Some(false)
                    }
                    _ => {}
                }
            }
            pool = unsafe { (*pool).next };
        }
        None
    }
}

struct LockedHeap {
    inner: IrqTicketLock<Allocator>,
}

#[global_allocator]
static HEAP: LockedHeap = LockedHeap {
    inner: IrqTicketLock::new(Allocator::new()),
};

unsafe impl GlobalAlloc for LockedHeap {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        self.inner
            .lock()
            .alloc(layout.size().max(1), layout.align())
            .as_mut_ptr()
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        self.inner.lock().free(VirtAddr::new(ptr as u64));
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        self.inner
            .lock()
            .realloc(VirtAddr::new(ptr as u64), new_size.max(1), layout.align())
            .as_mut_ptr()
    }
}

/// Prime the pool chain so the first real allocation cannot fail silently.
/// Early-boot exhaustion here is fatal.
pub fn init() {
    let mut heap = HEAP.inner.lock();
    if heap.alloc_pool().is_null() {
        panic!("heap: out of frames during bootstrap");
    }
    log::info!(
        "heap: ready ({} pool slots per frame, large threshold {} bytes)",
        POOL_ITEMS,
        LARGE_ALLOC_THRESHOLD
    );
}

/// Allocate `length` bytes aligned to `align`; null on exhaustion.
pub fn alloc(length: usize, align: usize) -> VirtAddr {
    HEAP.inner.lock().alloc(length, align)
}

pub fn free(addr: VirtAddr) {
    HEAP.inner.lock().free(addr);
}

pub fn realloc(addr: VirtAddr, length: usize, align: usize) -> VirtAddr {
    HEAP.inner.lock().realloc(addr, length, align)
}

#[cfg(feature = "testing")]
pub fn is_slab_backed(addr: VirtAddr) -> Option<bool> {
    HEAP.inner.lock().is_slab_backed(addr)
}

#[alloc_error_handler]
fn alloc_error_handler(layout: Layout) -> ! {
    panic!("allocation error: {:?}", layout)
}
