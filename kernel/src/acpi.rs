//! ACPI table access.
//!
//! Only what the core consumes: RSDP validation, the RSDT/XSDT walk, and
//! typed views of MADT (CPU + IOAPIC enumeration), HPET and MCFG. Every
//! other table is some collaborator's problem.

use alloc::vec::Vec;
use conquer_once::spin::OnceCell;

use crate::memory::PhysAddr;

#[repr(C, packed)]
struct Rsdp {
    signature: [u8; 8],
    checksum: u8,
    oem_id: [u8; 6],
    revision: u8,
    rsdt_address: u32,
    // ACPI 2.0+ fields below.
    length: u32,
    xsdt_address: u64,
    extended_checksum: u8,
    reserved: [u8; 3],
}

#[repr(C, packed)]
pub struct SdtHeader {
    pub signature: [u8; 4],
    pub length: u32,
    pub revision: u8,
    pub checksum: u8,
    pub oem_id: [u8; 6],
    pub oem_table_id: [u8; 8],
    pub oem_revision: u32,
    pub creator_id: u32,
    pub creator_revision: u32,
}

/// ACPI Generic Address Structure.
#[repr(C, packed)]
#[derive(Clone, Copy)]
pub struct GenericAddress {
    pub space_id: u8,
    pub bit_width: u8,
    pub bit_offset: u8,
    pub access_size: u8,
    pub address: u64,
}

#[repr(C, packed)]
pub struct HpetTable {
    pub header: SdtHeader,
    pub event_timer_block_id: u32,
    pub base_address: GenericAddress,
    pub hpet_number: u8,
    pub minimum_tick: u16,
    pub page_protection: u8,
}

#[repr(C, packed)]
pub struct Madt {
    pub header: SdtHeader,
    pub lapic_address: u32,
    pub flags: u32,
    // Followed by variable-length records.
}

#[derive(Debug, Clone, Copy)]
pub enum MadtEntry {
    ProcessorLapic {
        acpi_uid: u8,
        apic_id: u8,
        flags: u32,
    },
    IoApic {
        id: u8,
        address: u32,
        gsi_base: u32,
    },
    InterruptOverride {
        bus: u8,
        source: u8,
        gsi: u32,
        flags: u16,
    },
}

pub struct MadtIter {
    cursor: *const u8,
    end: *const u8,
}

impl Iterator for MadtIter {
    type Item = MadtEntry;

    fn next(&mut self) -> Option<MadtEntry> {
        while (self.cursor as usize) + 2 <= self.end as usize {
            let kind = unsafe { *self.cursor };
            let len = unsafe { *self.cursor.add(1) } as usize;
            if len < 2 || (self.cursor as usize) + len > self.end as usize {
                return None;
            }
            let body = unsafe { self.cursor.add(2) };
            self.cursor = unsafe { self.cursor.add(len) };

            let entry = match kind {
                0 => Some(MadtEntry::ProcessorLapic {
                    acpi_uid: unsafe { *body },
                    apic_id: unsafe { *body.add(1) },
                    flags: unsafe { (body.add(2) as *const u32).read_unaligned() },
                }),
                1 => Some(MadtEntry::IoApic {
                    id: unsafe { *body },
                    address: unsafe { (body.add(2) as *const u32).read_unaligned() },
                    gsi_base: unsafe { (body.add(6) as *const u32).read_unaligned() },
                }),
                2 => Some(MadtEntry::InterruptOverride {
                    bus: unsafe { *body },
                    source: unsafe { *body.add(1) },
                    gsi: unsafe { (body.add(2) as *const u32).read_unaligned() },
                    flags: unsafe { (body.add(6) as *const u16).read_unaligned() },
                }),
                _ => None,
            };

            if entry.is_some() {
                return entry;
            }
            // Unknown record kinds are skipped, not an error.
        }
        None
    }
}

impl Madt {
    pub fn entries(&self) -> MadtIter {
        let base = self as *const Madt as *const u8;
        let len = self.header.length as usize;
        MadtIter {
            cursor: unsafe { base.add(core::mem::size_of::<Madt>()) },
            end: unsafe { base.add(len) },
        }
    }
}

#[repr(C, packed)]
#[derive(Clone, Copy)]
pub struct McfgEntry {
    pub base_address: u64,
    pub segment: u16,
    pub bus_start: u8,
    pub bus_end: u8,
    reserved: u32,
}

#[repr(C, packed)]
pub struct Mcfg {
    pub header: SdtHeader,
    reserved: u64,
    // Followed by McfgEntry records.
}

impl Mcfg {
    pub fn entries(&self) -> &[McfgEntry] {
        let count = (self.header.length as usize - core::mem::size_of::<Mcfg>())
            / core::mem::size_of::<McfgEntry>();
        unsafe {
            core::slice::from_raw_parts(
                (self as *const Mcfg).add(1) as *const McfgEntry,
                count,
            )
        }
    }
}

static TABLES: OnceCell<Vec<PhysAddr>> = OnceCell::uninit();

fn checksum_ok(data: *const u8, len: usize) -> bool {
    let mut sum: u8 = 0;
    for i in 0..len {
        sum = sum.wrapping_add(unsafe { *data.add(i) });
    }
    sum == 0
}

/// Walk RSDP → XSDT/RSDT and remember where every table lives.
pub fn init(rsdp_phys: PhysAddr) {
    let rsdp = unsafe { &*rsdp_phys.to_virt().as_ptr::<Rsdp>() };

    assert_eq!(&rsdp.signature, b"RSD PTR ", "acpi: bad RSDP signature");
    assert!(
        checksum_ok(rsdp as *const Rsdp as *const u8, 20),
        "acpi: RSDP checksum mismatch"
    );

    let use_xsdt = rsdp.revision >= 2 && rsdp.xsdt_address != 0;
    let sdt_phys = if use_xsdt {
        PhysAddr::new(rsdp.xsdt_address)
    } else {
        PhysAddr::new(rsdp.rsdt_address as u64)
    };

    let header = unsafe { &*sdt_phys.to_virt().as_ptr::<SdtHeader>() };
    let entry_size = if use_xsdt { 8 } else { 4 };
    let count = (header.length as usize - core::mem::size_of::<SdtHeader>()) / entry_size;

    let mut tables = Vec::with_capacity(count);
    let entries =
        unsafe { (sdt_phys.to_virt().as_ptr::<SdtHeader>()).add(1) as *const u8 };
    for i in 0..count {
        let phys = if use_xsdt {
            unsafe { (entries.add(i * 8) as *const u64).read_unaligned() }
        } else {
            unsafe { (entries.add(i * 4) as *const u32).read_unaligned() as u64 }
        };
        tables.push(PhysAddr::new(phys));
    }

    log::info!(
        "acpi: {} tables via {}",
        tables.len(),
        if use_xsdt { "XSDT" } else { "RSDT" }
    );
    for &table in &tables {
        let header = unsafe { &*table.to_virt().as_ptr::<SdtHeader>() };
        let sig = header.signature;
        log::debug!(
            "   - {} at {:#x}",
            core::str::from_utf8(&sig).unwrap_or("????"),
            table
        );
    }

    TABLES.init_once(|| tables);
}

/// Find a table by signature. Checksum failures on located tables are
/// logged and tolerated; firmware ships enough broken secondary copies
/// that refusing to boot over them helps nobody.
pub fn get_table(signature: &[u8; 4]) -> Option<&'static SdtHeader> {
    let tables = TABLES.get().expect("acpi: not initialized");

    for &table in tables {
        let header = unsafe { &*table.to_virt().as_ptr::<SdtHeader>() };
        if &header.signature != signature {
            continue;
        }

        if !checksum_ok(
            header as *const SdtHeader as *const u8,
            header.length as usize,
        ) {
            log::warn!(
                "acpi: checksum mismatch on {}, using it anyway",
                core::str::from_utf8(signature).unwrap_or("????")
            );
        }

        return Some(header);
    }

    None
}

pub fn madt() -> Option<&'static Madt> {
    get_table(b"APIC").map(|h| unsafe { &*(h as *const SdtHeader as *const Madt) })
}

pub fn hpet() -> Option<&'static HpetTable> {
    get_table(b"HPET").map(|h| unsafe { &*(h as *const SdtHeader as *const HpetTable) })
}

pub fn mcfg() -> Option<&'static Mcfg> {
    get_table(b"MCFG").map(|h| unsafe { &*(h as *const SdtHeader as *const Mcfg) })
}
