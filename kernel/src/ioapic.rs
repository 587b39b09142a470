//! IOAPIC programming.
//!
//! Enumerated from the MADT; redirection entries are written under an
//! IRQ-saving ticket lock, since device setup and interrupt handlers can
//! both reach for routing changes. Legacy ISA IRQ numbers go through the
//! MADT's interrupt source overrides before they pick a GSI.

use alloc::vec::Vec;

use crate::acpi::{self, MadtEntry};
use crate::memory::PhysAddr;
use crate::sync::IrqTicketLock;

const REG_SELECT: u64 = 0x00;
const REG_DATA: u64 = 0x10;

const REG_VERSION: u32 = 0x01;
const REG_REDIR_BASE: u32 = 0x10;

const REDIR_MASKED: u64 = 1 << 16;
const REDIR_LEVEL_TRIGGERED: u64 = 1 << 15;
const REDIR_ACTIVE_LOW: u64 = 1 << 13;

struct IoApic {
    base: PhysAddr,
    gsi_base: u32,
    entries: u32,
}

impl IoApic {
    fn read(&self, reg: u32) -> u32 {
        unsafe {
            core::ptr::write_volatile((self.base + REG_SELECT).to_virt().as_mut_ptr::<u32>(), reg);
            core::ptr::read_volatile((self.base + REG_DATA).to_virt().as_ptr::<u32>())
        }
    }

    fn write(&self, reg: u32, value: u32) {
        unsafe {
            core::ptr::write_volatile((self.base + REG_SELECT).to_virt().as_mut_ptr::<u32>(), reg);
            core::ptr::write_volatile((self.base + REG_DATA).to_virt().as_mut_ptr::<u32>(), value);
        }
    }

    fn write_redirection(&self, index: u32, value: u64) {
        self.write(REG_REDIR_BASE + index * 2, value as u32);
        self.write(REG_REDIR_BASE + index * 2 + 1, (value >> 32) as u32);
    }

    fn covers(&self, gsi: u32) -> bool {
        gsi >= self.gsi_base && gsi < self.gsi_base + self.entries
    }
}

#[derive(Debug, Clone, Copy)]
struct Override {
    source: u8,
    gsi: u32,
    flags: u16,
}

struct Routing {
    ioapics: Vec<IoApic>,
    overrides: Vec<Override>,
}

static ROUTING: IrqTicketLock<Routing> = IrqTicketLock::new(Routing {
    ioapics: Vec::new(),
    overrides: Vec::new(),
});

/// Enumerate IOAPICs from the MADT and mask every input.
pub fn init() {
    let madt = acpi::madt().expect("ioapic: no MADT");
    let mut routing = ROUTING.lock();

    for entry in madt.entries() {
        match entry {
            MadtEntry::IoApic {
                id,
                address,
                gsi_base,
            } => {
                let ioapic = IoApic {
                    base: PhysAddr::new(address as u64),
                    gsi_base,
                    entries: 0,
                };
                let entries = ((ioapic.read(REG_VERSION) >> 16) & 0xFF) + 1;
                let ioapic = IoApic { entries, ..ioapic };

                for i in 0..entries {
                    ioapic.write_redirection(i, REDIR_MASKED);
                }

                log::info!(
                    "ioapic: id {} at {:#x}, GSIs {}..{}",
                    id,
                    ioapic.base,
                    gsi_base,
                    gsi_base + entries
                );
                routing.ioapics.push(ioapic);
            }
            MadtEntry::InterruptOverride {
                source, gsi, flags, ..
            } => {
                log::debug!("ioapic: override IRQ {} -> GSI {} ({:#x})", source, gsi, flags);
                routing.overrides.push(Override { source, gsi, flags });
            }
            MadtEntry::ProcessorLapic { .. } => {}
        }
    }
}

/// Point `gsi` at `vector` on the CPU with `lapic_id`.
pub fn route_gsi(gsi: u32, vector: u8, lapic_id: u32, level: bool, active_low: bool) {
    let routing = ROUTING.lock();
    let Some(ioapic) = routing.ioapics.iter().find(|io| io.covers(gsi)) else {
        panic!("ioapic: no IOAPIC covers GSI {}", gsi);
    };

    let mut entry = vector as u64 | ((lapic_id as u64) << 56);
    if level {
        entry |= REDIR_LEVEL_TRIGGERED;
    }
    if active_low {
        entry |= REDIR_ACTIVE_LOW;
    }

    ioapic.write_redirection(gsi - ioapic.gsi_base, entry);
}

/// Route a legacy ISA IRQ, honoring any MADT override for polarity,
/// trigger mode and the actual GSI.
pub fn route_irq(irq: u8, vector: u8, lapic_id: u32) {
    let (gsi, flags) = {
        let routing = ROUTING.lock();
        match routing.overrides.iter().find(|o| o.source == irq) {
            Some(o) => (o.gsi, o.flags),
            None => (irq as u32, 0),
        }
    };

    let active_low = flags & 0b11 == 0b11;
    let level = (flags >> 2) & 0b11 == 0b11;
    route_gsi(gsi, vector, lapic_id, level, active_low);
}

pub fn mask_gsi(gsi: u32) {
    let routing = ROUTING.lock();
    if let Some(ioapic) = routing.ioapics.iter().find(|io| io.covers(gsi)) {
        ioapic.write_redirection(gsi - ioapic.gsi_base, REDIR_MASKED);
    }
}
