//! Generic multi-level page-table engine.
//!
//! One walk/map/unmap algorithm serves every translation domain in the
//! kernel: CPU paging, AMD nested paging, Intel EPT and the two IOMMU
//! second levels. The domains differ only in their 64-bit entry layout and
//! invalidation requirements, captured by the [`Engine`] capability set.
//!
//! Tables are always 512 entries of 8 bytes, reached through the direct
//! physical-memory window. No huge pages: every leaf maps 4 KiB.

use bitflags::bitflags;

use super::{pmm, PhysAddr, VirtAddr, PAGE_SIZE};

bitflags! {
    /// The engine-independent mapping permissions. Engines translate these
    /// into their own permission bits when a leaf is written.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFlags: u8 {
        const PRESENT = 1 << 0;
        const WRITE   = 1 << 1;
        const EXECUTE = 1 << 2;
        const USER    = 1 << 3;
    }
}

/// Mask of the 40-bit frame field occupying bits 12..52 in every engine.
const FRAME_MASK: u64 = ((1 << 40) - 1) << 12;

/// Entry semantics of one translation domain.
///
/// Intermediate entries always grant the most permissive access their
/// domain can express; restrictions live at the leaf.
pub trait Engine {
    /// Whether this raw entry points at anything.
    fn is_present(&self, raw: u64) -> bool;

    /// An intermediate entry referencing the child table at `frame`.
    /// `child_level` is the level of that child (AMD-Vi encodes it).
    fn intermediate(&self, frame: PhysAddr, child_level: u8) -> u64;

    /// A leaf entry mapping `frame` with `flags`.
    fn leaf(&self, frame: PhysAddr, flags: PageFlags) -> u64;

    /// `raw` with its permission bits replaced by `flags`; the frame field
    /// is untouched.
    fn apply_flags(&self, raw: u64, flags: PageFlags) -> u64;

    /// The engine-independent view of an entry's permission bits.
    fn flags_of(&self, raw: u64) -> PageFlags;

    /// Physical address held in the frame field.
    fn frame_of(&self, raw: u64) -> PhysAddr {
        PhysAddr::new(raw & FRAME_MASK)
    }

    /// Drop any cached translation of `va` in this domain. IOMMU engines
    /// leave this empty: their IOTLB is flushed by the hardware driver.
    fn invalidate(&self, root: PhysAddr, va: VirtAddr);

    /// Called once for every freshly allocated (and zeroed) table frame.
    fn table_allocated(&self, _pa: PhysAddr) {}

    /// Called after every entry write. Non-coherent IOMMUs flush the cache
    /// line here so the hardware walker observes the store.
    fn entry_written(&self, _entry: *const u64) {}
}

/// One instance of a translation domain: a private tree of tables hanging
/// off a root frame that stays stable for the context's whole lifetime.
pub struct Context<E: Engine> {
    levels: u8,
    root: PhysAddr,
    engine: E,
}

impl<E: Engine> Context<E> {
    /// Create a context with an empty root table.
    pub fn new(levels: u8, engine: E) -> Self {
        assert!((3..=5).contains(&levels), "paging depth {} unsupported", levels);

        let mut ctx = Self {
            levels,
            root: PhysAddr::zero(),
            engine,
        };
        ctx.root = ctx.create_table();
        ctx
    }

    /// Allocate and zero one table frame. Running out of frames for paging
    /// structures is unrecoverable.
    fn create_table(&self) -> PhysAddr {
        let pa = pmm::alloc_block()
            .unwrap_or_else(|| panic!("out of frames for paging structures"));

        unsafe {
            core::ptr::write_bytes(pa.to_virt().as_mut_ptr::<u8>(), 0, PAGE_SIZE as usize);
        }
        self.engine.table_allocated(pa);

        pa
    }

    fn entry_ptr(table: PhysAddr, index: usize) -> *mut u64 {
        unsafe { table.to_virt().as_mut_ptr::<u64>().add(index) }
    }

    fn index_for(va: VirtAddr, level: u8) -> usize {
        ((va.as_u64() >> (9 * (level as u64 - 1) + 12)) & 0x1FF) as usize
    }

    /// Walk down to the level-1 entry for `va`, creating intermediate
    /// tables on the way when asked to.
    pub(in crate::memory) fn walk(&self, va: VirtAddr, create: bool) -> Option<*mut u64> {
        let mut table = self.root;

        for level in (2..=self.levels).rev() {
            let entry = Self::entry_ptr(table, Self::index_for(va, level));
            let raw = unsafe { core::ptr::read_volatile(entry) };

            if self.engine.is_present(raw) {
                table = self.engine.frame_of(raw);
            } else if create {
                let child = self.create_table();
                let raw = self.engine.intermediate(child, level - 1);
                unsafe { core::ptr::write_volatile(entry, raw) };
                self.engine.entry_written(entry);
                table = child;
            } else {
                return None;
            }
        }

        Some(Self::entry_ptr(table, Self::index_for(va, 1)))
    }

    /// Map `va` to the frame at `pa` with `flags`, creating intermediate
    /// tables as needed, and invalidate the old translation.
    pub fn map(&mut self, pa: PhysAddr, va: VirtAddr, flags: PageFlags) {
        let entry = self.walk(va, true).expect("walk with create cannot fail");
        let raw = self.engine.leaf(pa, flags);
        unsafe { core::ptr::write_volatile(entry, raw) };
        self.engine.entry_written(entry);
        self.engine.invalidate(self.root, va);
    }

    /// Clear the mapping of `va`, returning the physical address it held.
    /// A null return means the page was never mapped.
    pub fn unmap(&mut self, va: VirtAddr) -> PhysAddr {
        let Some(entry) = self.walk(va, false) else {
            return PhysAddr::zero();
        };

        let raw = unsafe { core::ptr::read_volatile(entry) };
        if !self.engine.is_present(raw) {
            return PhysAddr::zero();
        }

        let old = self.engine.frame_of(raw);
        unsafe { core::ptr::write_volatile(entry, 0) };
        self.engine.entry_written(entry);
        self.engine.invalidate(self.root, va);

        old
    }

    /// Replace the permission bits of an existing leaf; the frame field is
    /// left alone. Absent mappings are ignored.
    pub fn protect(&mut self, va: VirtAddr, flags: PageFlags) {
        let Some(entry) = self.walk(va, false) else {
            return;
        };

        let raw = unsafe { core::ptr::read_volatile(entry) };
        if !self.engine.is_present(raw) {
            return;
        }

        let raw = self.engine.apply_flags(raw, flags);
        unsafe { core::ptr::write_volatile(entry, raw) };
        self.engine.entry_written(entry);
        self.engine.invalidate(self.root, va);
    }

    /// Translate `va`, or return null when it is not mapped.
    pub fn get_phys(&self, va: VirtAddr) -> PhysAddr {
        let Some(entry) = self.walk(va, false) else {
            return PhysAddr::zero();
        };

        let raw = unsafe { core::ptr::read_volatile(entry) };
        if !self.engine.is_present(raw) {
            return PhysAddr::zero();
        }

        self.engine.frame_of(raw) + (va.as_u64() & (PAGE_SIZE - 1))
    }

    /// Permission bits of the leaf for `va`, if mapped.
    pub fn get_flags(&self, va: VirtAddr) -> Option<PageFlags> {
        let entry = self.walk(va, false)?;
        let raw = unsafe { core::ptr::read_volatile(entry) };
        self.engine.is_present(raw).then(|| self.engine.flags_of(raw))
    }

    /// Physical address of the root table; what CR3/EPTP/nCR3/device-table
    /// entries point at.
    pub fn root_pa(&self) -> PhysAddr {
        self.root
    }

    pub fn levels(&self) -> u8 {
        self.levels
    }

    pub(in crate::memory) fn engine(&self) -> &E {
        &self.engine
    }

    fn clean_table(&self, pa: PhysAddr, level: u8) {
        let table = pa.to_virt().as_mut_ptr::<u64>();

        for i in 0..512 {
            let raw = unsafe { core::ptr::read_volatile(table.add(i)) };
            if !self.engine.is_present(raw) {
                continue;
            }

            if level >= 3 {
                self.clean_table(self.engine.frame_of(raw), level - 1);
            } else {
                pmm::free_block(self.engine.frame_of(raw));
            }
        }

        pmm::free_block(pa);
    }
}

impl<E: Engine> Drop for Context<E> {
    /// Post-order teardown: intermediate tables first, the root last.
    /// Leaf target frames are not owned by the context and are untouched.
    fn drop(&mut self) {
        self.clean_table(self.root, self.levels);
    }
}
