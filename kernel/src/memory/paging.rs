//! CPU address translation: the `walker` engine for regular x86 paging,
//! PAT-based caching control, and the kernel's own address space.

use bitfield_struct::bitfield;
use conquer_once::spin::OnceCell;

use crate::boot::stivale2;
use crate::sync::TicketLock;

use super::walker::{Context, Engine, PageFlags};
use super::{align_down, align_up, paging_levels, phys_map_base, PhysAddr, VirtAddr, PAGE_SIZE};

/// One entry of a CPU page table, any level.
#[bitfield(u64)]
pub struct CpuEntry {
    pub present: bool,
    pub writeable: bool,
    pub user: bool,
    pub writethrough: bool,
    pub cache_disable: bool,
    pub accessed: bool,
    pub dirty: bool,
    pub pat: bool,
    pub global: bool,
    #[bits(3)]
    pub available0: u8,
    #[bits(40)]
    pub frame: u64,
    #[bits(7)]
    pub available1: u8,
    #[bits(4)]
    pub pke: u8,
    pub no_execute: bool,
}

/// Memory types programmed into the PAT at CPU bring-up; the discriminant
/// is the 3-bit PAT index encoded into PWT/PCD/PAT leaf bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CacheMode {
    WriteBack = 0,
    WriteThrough = 1,
    UncacheableMinus = 2,
    Uncacheable = 3,
    WriteCombining = 4,
}

impl CacheMode {
    const fn index(self) -> u64 {
        self as u64
    }
}

/// IA32_PAT layout matching [`CacheMode`]: WB, WT, UC-, UC, WC, then the
/// power-on defaults for the unused upper slots.
const PAT_VALUE: u64 = 0x00_07_04_01_00_07_04_06;
const IA32_PAT: u32 = 0x277;

/// Program the PAT so [`CacheMode`] indexes resolve as declared, and turn
/// on no-execute support. Runs on every CPU before it loads kernel tables.
pub fn init_cpu() {
    use x86_64::registers::model_specific::{Efer, EferFlags, Msr};

    unsafe {
        Msr::new(IA32_PAT).write(PAT_VALUE);
        Efer::update(|flags| flags.insert(EferFlags::NO_EXECUTE_ENABLE));
    }
}

fn invlpg(va: VirtAddr) {
    unsafe {
        core::arch::asm!("invlpg [{}]", in(reg) va.as_u64(), options(nostack, preserves_flags));
    }
}

/// Entry semantics of CPU paging. Intermediates are writeable and
/// user-accessible; leaves restrict, with NX as the complement of execute.
pub struct CpuEngine;

impl CpuEngine {
    fn leaf_with_caching(&self, frame: PhysAddr, flags: PageFlags, caching: CacheMode) -> u64 {
        let index = caching.index();
        CpuEntry::new()
            .with_present(flags.contains(PageFlags::PRESENT))
            .with_writeable(flags.contains(PageFlags::WRITE))
            .with_user(flags.contains(PageFlags::USER))
            .with_no_execute(!flags.contains(PageFlags::EXECUTE))
            .with_writethrough(index & 1 != 0)
            .with_cache_disable(index & 2 != 0)
            .with_pat(index & 4 != 0)
            .with_frame(frame.as_u64() >> 12)
            .into()
    }
}

impl Engine for CpuEngine {
    fn is_present(&self, raw: u64) -> bool {
        CpuEntry::from(raw).present()
    }

    fn intermediate(&self, frame: PhysAddr, _child_level: u8) -> u64 {
        CpuEntry::new()
            .with_present(true)
            .with_writeable(true)
            .with_user(true)
            .with_frame(frame.as_u64() >> 12)
            .into()
    }

    fn leaf(&self, frame: PhysAddr, flags: PageFlags) -> u64 {
        self.leaf_with_caching(frame, flags, CacheMode::WriteBack)
    }

    fn apply_flags(&self, raw: u64, flags: PageFlags) -> u64 {
        CpuEntry::from(raw)
            .with_present(flags.contains(PageFlags::PRESENT))
            .with_writeable(flags.contains(PageFlags::WRITE))
            .with_user(flags.contains(PageFlags::USER))
            .with_no_execute(!flags.contains(PageFlags::EXECUTE))
            .into()
    }

    fn flags_of(&self, raw: u64) -> PageFlags {
        let entry = CpuEntry::from(raw);
        let mut flags = PageFlags::empty();
        flags.set(PageFlags::PRESENT, entry.present());
        flags.set(PageFlags::WRITE, entry.writeable());
        flags.set(PageFlags::USER, entry.user());
        flags.set(PageFlags::EXECUTE, !entry.no_execute());
        flags
    }

    fn invalidate(&self, _root: PhysAddr, va: VirtAddr) {
        invlpg(va);
    }
}

/// A CPU address space.
pub type AddressSpace = Context<CpuEngine>;

/// Create an address space at the boot-detected paging depth.
pub fn new_address_space() -> AddressSpace {
    AddressSpace::new(paging_levels(), CpuEngine)
}

impl AddressSpace {
    /// Like [`Context::map`] but with an explicit memory type.
    pub fn map_with_caching(
        &mut self,
        pa: PhysAddr,
        va: VirtAddr,
        flags: PageFlags,
        caching: CacheMode,
    ) {
        let entry = self.walk(va, true).expect("walk with create cannot fail");
        let raw = self.engine().leaf_with_caching(pa, flags, caching);
        unsafe { core::ptr::write_volatile(entry, raw) };
        invlpg(va);
    }

    /// Rewrite the memory type of an existing leaf. Permissions and the
    /// frame are untouched.
    pub fn set_caching(&mut self, va: VirtAddr, caching: CacheMode) {
        let Some(entry) = self.walk(va, false) else {
            return;
        };

        let index = caching.index();
        let raw = unsafe { core::ptr::read_volatile(entry) };
        let entry_val = CpuEntry::from(raw);
        if !entry_val.present() {
            return;
        }

        let raw = entry_val
            .with_writethrough(index & 1 != 0)
            .with_cache_disable(index & 2 != 0)
            .with_pat(index & 4 != 0)
            .into();
        unsafe { core::ptr::write_volatile(entry, raw) };
        invlpg(va);
    }

    /// Raw leaf read-back, for caching checks and fault diagnostics.
    pub fn get_page(&self, va: VirtAddr) -> CpuEntry {
        match self.walk(va, false) {
            Some(entry) => CpuEntry::from(unsafe { core::ptr::read_volatile(entry) }),
            None => CpuEntry::new(),
        }
    }

    /// Load this address space into CR3.
    ///
    /// # Safety
    /// Every address the CPU touches afterwards (code, stacks, the direct
    /// map) must be mapped here.
    pub unsafe fn switch(&self) {
        core::arch::asm!(
            "mov cr3, {}",
            in(reg) self.root_pa().as_u64(),
            options(nostack, preserves_flags)
        );
    }
}

static KERNEL_SPACE: OnceCell<TicketLock<AddressSpace>> = OnceCell::uninit();

/// The kernel's own address space. Mutated at init and, afterwards, only
/// by subsystems serializing behind this lock (heap remaps, IOVMM caching
/// overrides, IOMMU table mappings).
pub fn kernel_space() -> &'static TicketLock<AddressSpace> {
    KERNEL_SPACE.get().expect("kernel address space not initialized")
}

/// Build the kernel address space: the kernel image from the loader's
/// memory ranges, then the whole physical map window, then switch to it.
pub fn init_kernel_space(boot: &stivale2::Parser) {
    init_cpu();

    let mut space = new_address_space();

    // Kernel image spans, with the permissions the loader handed us.
    let kernel_base = boot.kernel_base();
    for range in boot.kernel_ranges() {
        let mut offset = 0;
        while offset < range.length {
            let va = VirtAddr::new(range.base + offset);
            let pa = PhysAddr::new(
                kernel_base.physical_base + (range.base + offset - kernel_base.virtual_base),
            );

            let mut flags = PageFlags::PRESENT;
            if range.permissions & stivale2::PMR_WRITABLE != 0 {
                flags |= PageFlags::WRITE;
            }
            if range.permissions & stivale2::PMR_EXECUTABLE != 0 {
                flags |= PageFlags::EXECUTE;
            }

            space.map(pa, va, flags);
            offset += PAGE_SIZE;
        }
    }

    // Direct map of every range the loader reported, usable or not: the
    // PMM bitmap, MMIO claims and ACPI tables all go through it.
    for entry in boot.memory_map() {
        let base = align_down(entry.base, PAGE_SIZE);
        let top = align_up(entry.base + entry.length, PAGE_SIZE);

        let caching = if entry.kind == stivale2::MMAP_FRAMEBUFFER {
            CacheMode::WriteCombining
        } else {
            CacheMode::WriteBack
        };

        let mut addr = base;
        while addr < top {
            space.map_with_caching(
                PhysAddr::new(addr),
                VirtAddr::new(addr + phys_map_base()),
                PageFlags::PRESENT | PageFlags::WRITE,
                caching,
            );
            addr += PAGE_SIZE;
        }
    }

    unsafe { space.switch() };
    log::info!(
        "paging: kernel address space live, root at {:#x}",
        space.root_pa()
    );

    KERNEL_SPACE.init_once(|| TicketLock::new(space));
}
