//! Intel EPT: the `walker` engine for guest-physical translation under
//! VT-x. An entry is present when any of R/W/X is set; intermediates grant
//! all three. Every mutation issues a single-context `invept`.

use bitfield_struct::bitfield;

use super::walker::{Context, Engine, PageFlags};
use super::{PhysAddr, VirtAddr};

/// EPT memory type encodings (actual types, not PAT indexes).
const MEM_TYPE_WRITE_BACK: u8 = 6;

#[bitfield(u64)]
pub struct EptEntry {
    pub read: bool,
    pub write: bool,
    pub execute: bool,
    #[bits(3)]
    pub mem_type: u8,
    pub ignore_pat: bool,
    pub ignored: bool,
    pub accessed: bool,
    pub dirty: bool,
    pub linear_execute: bool,
    pub ignored0: bool,
    #[bits(40)]
    pub frame: u64,
    #[bits(8)]
    pub ignored1: u8,
    pub supervisor_shadow: bool,
    pub spp: bool,
    pub ignored2: bool,
    pub suppress_ve: bool,
}

/// Format the EPT pointer the way VMCS loads expect it: write-back walks,
/// depth encoded as levels - 1.
pub fn eptp_for(root: PhysAddr, levels: u8) -> u64 {
    root.as_u64() | ((levels as u64 - 1) << 3) | MEM_TYPE_WRITE_BACK as u64
}

pub struct EptEngine {
    levels: u8,
}

impl Engine for EptEngine {
    fn is_present(&self, raw: u64) -> bool {
        raw & 0b111 != 0
    }

    fn intermediate(&self, frame: PhysAddr, _child_level: u8) -> u64 {
        EptEntry::new()
            .with_read(true)
            .with_write(true)
            .with_execute(true)
            .with_frame(frame.as_u64() >> 12)
            .into()
    }

    fn leaf(&self, frame: PhysAddr, flags: PageFlags) -> u64 {
        EptEntry::new()
            .with_read(flags.contains(PageFlags::PRESENT))
            .with_write(flags.contains(PageFlags::WRITE))
            .with_execute(flags.contains(PageFlags::EXECUTE))
            .with_mem_type(MEM_TYPE_WRITE_BACK)
            .with_frame(frame.as_u64() >> 12)
            .into()
    }

    fn apply_flags(&self, raw: u64, flags: PageFlags) -> u64 {
        EptEntry::from(raw)
            .with_read(flags.contains(PageFlags::PRESENT))
            .with_write(flags.contains(PageFlags::WRITE))
            .with_execute(flags.contains(PageFlags::EXECUTE))
            .into()
    }

    fn flags_of(&self, raw: u64) -> PageFlags {
        let entry = EptEntry::from(raw);
        let mut flags = PageFlags::empty();
        flags.set(PageFlags::PRESENT, entry.read());
        flags.set(PageFlags::WRITE, entry.write());
        flags.set(PageFlags::EXECUTE, entry.execute());
        flags
    }

    fn invalidate(&self, root: PhysAddr, _va: VirtAddr) {
        // Single-context invalidation; mode 1 support is a vmx::init()
        // prerequisite.
        #[repr(C, align(16))]
        struct InveptDescriptor {
            eptp: u64,
            reserved: u64,
        }

        let descriptor = InveptDescriptor {
            eptp: eptp_for(root, self.levels),
            reserved: 0,
        };
        let mode: u64 = 1;

        unsafe {
            core::arch::asm!(
                "invept {}, [{}]",
                in(reg) mode,
                in(reg) &descriptor,
                options(nostack)
            );
        }
    }
}

/// A guest-physical address space under VT-x.
pub type EptContext = Context<EptEngine>;

pub fn new_context(levels: u8) -> EptContext {
    assert!(levels == 4 || levels == 5);
    EptContext::new(levels, EptEngine { levels })
}
