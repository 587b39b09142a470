//! stivale2 structures and tag-list parsing.
//!
//! The loader hands over one struct whose `tags` field heads a linked
//! list of ID-tagged records. Everything the kernel wants from the loader
//! (memory map, SMP info, RSDP, kernel load ranges, framebuffer) is read
//! through [`Parser`], which walks that list by ID.

use crate::memory::PhysAddr;

pub const STRUCT_TAG_MEMMAP_ID: u64 = 0x2187_f79e_8612_de07;
pub const STRUCT_TAG_SMP_ID: u64 = 0x34d1_d963_3964_7025;
pub const STRUCT_TAG_RSDP_ID: u64 = 0x9e17_8693_0a37_5e78;
pub const STRUCT_TAG_FRAMEBUFFER_ID: u64 = 0x5064_61d2_9504_08fa;
pub const STRUCT_TAG_KERNEL_BASE_ADDRESS_ID: u64 = 0x060d_7887_4a2a_8af0;
pub const STRUCT_TAG_PMRS_ID: u64 = 0x5df2_66a6_4047_b6bd;

pub const HEADER_TAG_SMP_ID: u64 = 0x1ab0_1508_5f32_73df;
pub const HEADER_TAG_5LV_PAGING_ID: u64 = 0x932f_4770_3200_7e8f;

pub const MMAP_USABLE: u32 = 1;
pub const MMAP_RESERVED: u32 = 2;
pub const MMAP_ACPI_RECLAIMABLE: u32 = 3;
pub const MMAP_ACPI_NVS: u32 = 4;
pub const MMAP_BAD_MEMORY: u32 = 5;
pub const MMAP_BOOTLOADER_RECLAIMABLE: u32 = 0x1000;
pub const MMAP_KERNEL_AND_MODULES: u32 = 0x1001;
pub const MMAP_FRAMEBUFFER: u32 = 0x1002;

pub const PMR_EXECUTABLE: u64 = 1 << 0;
pub const PMR_WRITABLE: u64 = 1 << 1;
pub const PMR_READABLE: u64 = 1 << 2;

pub fn mmap_type_to_string(kind: u32) -> &'static str {
    match kind {
        MMAP_USABLE => "Usable",
        MMAP_RESERVED => "Reserved",
        MMAP_ACPI_RECLAIMABLE => "ACPI Reclaimable",
        MMAP_ACPI_NVS => "ACPI NVS",
        MMAP_BAD_MEMORY => "Bad Memory",
        MMAP_BOOTLOADER_RECLAIMABLE => "Bootloader Reclaimable",
        MMAP_KERNEL_AND_MODULES => "Kernel and Modules",
        MMAP_FRAMEBUFFER => "Framebuffer",
        _ => "Unknown",
    }
}

/// The anchor structure the loader passes to the kernel entry point.
#[repr(C)]
pub struct StivaleStruct {
    pub bootloader_brand: [u8; 64],
    pub bootloader_version: [u8; 64],
    pub tags: u64,
}

/// Header the kernel embeds for the loader to find. The pointer-typed
/// fields keep it buildable in a static; the wire layout is identical.
#[repr(C)]
pub struct StivaleHeader {
    pub entry_point: Option<extern "C" fn(&'static StivaleStruct) -> !>,
    pub stack: *const u8,
    pub flags: u64,
    pub tags: *const HeaderTag,
}

unsafe impl Sync for StivaleHeader {}

#[repr(C)]
pub struct HeaderTag {
    pub identifier: u64,
    pub next: *const HeaderTag,
}

unsafe impl Sync for HeaderTag {}

#[repr(C)]
pub struct HeaderTagSmp {
    pub tag: HeaderTag,
    pub flags: u64,
}

unsafe impl Sync for HeaderTagSmp {}

#[repr(C)]
struct Tag {
    identifier: u64,
    next: u64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct MemmapEntry {
    pub base: u64,
    pub length: u64,
    pub kind: u32,
    unused: u32,
}

#[repr(C)]
struct MemmapTag {
    tag: Tag,
    entries: u64,
    // Followed by `entries` MemmapEntry records.
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct KernelBase {
    pub physical_base: u64,
    pub virtual_base: u64,
}

#[repr(C)]
struct KernelBaseTag {
    tag: Tag,
    physical_base_address: u64,
    virtual_base_address: u64,
}

/// One kernel load range, in the image's virtual addresses.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct Pmr {
    pub base: u64,
    pub length: u64,
    pub permissions: u64,
}

#[repr(C)]
struct PmrsTag {
    tag: Tag,
    entries: u64,
    // Followed by `entries` Pmr records.
}

#[repr(C)]
struct RsdpTag {
    tag: Tag,
    rsdp: u64,
}

#[repr(C)]
pub struct SmpInfo {
    pub processor_id: u32,
    pub lapic_id: u32,
    pub target_stack: u64,
    pub goto_address: u64,
    pub extra_argument: u64,
}

#[repr(C)]
pub struct SmpTag {
    tag: Tag,
    pub flags: u64,
    pub bsp_lapic_id: u32,
    unused: u32,
    pub cpu_count: u64,
    // Followed by `cpu_count` SmpInfo records.
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct FramebufferInfo {
    pub framebuffer_addr: u64,
    pub framebuffer_width: u16,
    pub framebuffer_height: u16,
    pub framebuffer_pitch: u16,
    pub framebuffer_bpp: u16,
    pub memory_model: u8,
    pub red_mask_size: u8,
    pub red_mask_shift: u8,
    pub green_mask_size: u8,
    pub green_mask_shift: u8,
    pub blue_mask_size: u8,
    pub blue_mask_shift: u8,
}

/// Read-only view over the loader's tag list.
pub struct Parser {
    info: &'static StivaleStruct,
}

impl Parser {
    /// # Safety
    /// `info` must be the structure the loader passed to the entry point,
    /// and the loader's identity/higher-half mappings must still be live.
    pub unsafe fn new(info: &'static StivaleStruct) -> Self {
        Self { info }
    }

    pub fn bootloader_brand(&self) -> &str {
        cstr_of(&self.info.bootloader_brand)
    }

    pub fn bootloader_version(&self) -> &str {
        cstr_of(&self.info.bootloader_version)
    }

    fn get_tag(&self, id: u64) -> Option<*const Tag> {
        let mut tag = self.info.tags as *const Tag;
        while !tag.is_null() {
            let current = unsafe { &*tag };
            if current.identifier == id {
                return Some(tag);
            }
            tag = current.next as *const Tag;
        }
        None
    }

    pub fn memory_map(&self) -> &'static [MemmapEntry] {
        let Some(tag) = self.get_tag(STRUCT_TAG_MEMMAP_ID) else {
            panic!("stivale2: loader provided no memory map");
        };

        unsafe {
            let tag = &*(tag as *const MemmapTag);
            let first = (tag as *const MemmapTag).add(1) as *const MemmapEntry;
            core::slice::from_raw_parts(first, tag.entries as usize)
        }
    }

    /// Physical address of the ACPI RSDP. Loaders disagree on whether
    /// the tag carries a physical or higher-half address; normalize.
    pub fn acpi_rsdp(&self) -> Option<PhysAddr> {
        let tag = self.get_tag(STRUCT_TAG_RSDP_ID)?;
        let rsdp = unsafe { (*(tag as *const RsdpTag)).rsdp };

        let base = crate::memory::phys_map_base();
        if rsdp >= base {
            Some(PhysAddr::new(rsdp - base))
        } else {
            Some(PhysAddr::new(rsdp))
        }
    }

    pub fn kernel_base(&self) -> KernelBase {
        let Some(tag) = self.get_tag(STRUCT_TAG_KERNEL_BASE_ADDRESS_ID) else {
            panic!("stivale2: loader provided no kernel base address");
        };

        let tag = unsafe { &*(tag as *const KernelBaseTag) };
        KernelBase {
            physical_base: tag.physical_base_address,
            virtual_base: tag.virtual_base_address,
        }
    }

    pub fn kernel_ranges(&self) -> &'static [Pmr] {
        let Some(tag) = self.get_tag(STRUCT_TAG_PMRS_ID) else {
            panic!("stivale2: loader provided no kernel ranges");
        };

        unsafe {
            let tag = &*(tag as *const PmrsTag);
            let first = (tag as *const PmrsTag).add(1) as *const Pmr;
            core::slice::from_raw_parts(first, tag.entries as usize)
        }
    }

    pub fn smp(&self) -> Option<&'static SmpTag> {
        let tag = self.get_tag(STRUCT_TAG_SMP_ID)?;
        Some(unsafe { &*(tag as *const SmpTag) })
    }

    /// The per-CPU startup records. Mutable: SMP bring-up publishes each
    /// AP's stack and entry point through them.
    pub fn smp_entries(&self) -> &'static mut [SmpInfo] {
        let Some(tag) = self.get_tag(STRUCT_TAG_SMP_ID) else {
            panic!("stivale2: loader provided no SMP information");
        };

        unsafe {
            let smp = &*(tag as *const SmpTag);
            let first = (tag as *const SmpTag).add(1) as *mut SmpInfo;
            core::slice::from_raw_parts_mut(first, smp.cpu_count as usize)
        }
    }

    pub fn framebuffer(&self) -> Option<&'static FramebufferInfo> {
        let tag = self.get_tag(STRUCT_TAG_FRAMEBUFFER_ID)?;
        Some(unsafe { &*((tag as *const Tag).add(1) as *const FramebufferInfo) })
    }
}

fn cstr_of(bytes: &[u8]) -> &str {
    let len = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    core::str::from_utf8(&bytes[..len]).unwrap_or("<invalid>")
}
