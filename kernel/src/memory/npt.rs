//! AMD nested paging: the `walker` engine for guest-physical translation
//! under SVM. The entry layout is ordinary x86 paging; what differs is the
//! invalidation, which is per-ASID (`invlpga`).

use super::paging::CpuEntry;
use super::walker::{Context, Engine, PageFlags};
use super::{PhysAddr, VirtAddr};

pub struct NptEngine {
    asid: u32,
}

impl Engine for NptEngine {
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
        // Nested walks are treated as user accesses; user stays set.
        CpuEntry::new()
            .with_present(flags.contains(PageFlags::PRESENT))
            .with_writeable(flags.contains(PageFlags::WRITE))
            .with_user(true)
            .with_no_execute(!flags.contains(PageFlags::EXECUTE))
            .with_frame(frame.as_u64() >> 12)
            .into()
    }

    fn apply_flags(&self, raw: u64, flags: PageFlags) -> u64 {
        CpuEntry::from(raw)
            .with_present(flags.contains(PageFlags::PRESENT))
            .with_writeable(flags.contains(PageFlags::WRITE))
            .with_no_execute(!flags.contains(PageFlags::EXECUTE))
            .into()
    }

    fn flags_of(&self, raw: u64) -> PageFlags {
        let entry = CpuEntry::from(raw);
        let mut flags = PageFlags::empty();
        flags.set(PageFlags::PRESENT, entry.present());
        flags.set(PageFlags::WRITE, entry.writeable());
        flags.set(PageFlags::EXECUTE, !entry.no_execute());
        flags
    }

    fn invalidate(&self, _root: PhysAddr, va: VirtAddr) {
        unsafe {
            core::arch::asm!(
                "invlpga rax, ecx",
                in("rax") va.as_u64(),
                in("ecx") self.asid,
                options(nostack)
            );
        }
    }
}

/// A guest-physical address space under SVM, tied to one ASID.
pub type NptContext = Context<NptEngine>;

pub fn new_context(levels: u8, asid: u32) -> NptContext {
    assert!(levels == 4 || levels == 5);
    NptContext::new(levels, NptEngine { asid })
}

impl NptContext {
    pub fn asid(&self) -> u32 {
        self.engine().asid
    }
}
