//! PCI configuration access and the driver match registry.
//!
//! Two access paths coexist: the legacy CF8/CFC address/data window and
//! ECAM segments discovered through the ACPI MCFG. Whichever covers a
//! device's segment wins; segment 0 always has the legacy fallback.
//!
//! Drivers register a match record, either explicit (vendor, device)
//! pairs or a (class, subclass, prog if) triple, and get their probe
//! callback invoked for every enumerated function that matches.

use alloc::vec::Vec;
use conquer_once::spin::OnceCell;
use spin::Mutex;
use x86_64::instructions::port::Port;

use crate::acpi;
use crate::memory::paging::{kernel_space, CacheMode};
use crate::memory::{PhysAddr, PAGE_SIZE};
use crate::sync::TicketLock;

const CONFIG_ADDRESS: u16 = 0xCF8;
const CONFIG_DATA: u16 = 0xCFC;

const REG_VENDOR_ID: u16 = 0x00;
const REG_COMMAND: u16 = 0x04;
const REG_CLASS: u16 = 0x08;
const REG_HEADER_TYPE: u16 = 0x0E;
const REG_BAR0: u16 = 0x10;

/// (segment, bus, slot, function).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Address {
    pub seg: u16,
    pub bus: u8,
    pub slot: u8,
    pub func: u8,
}

impl Address {
    pub const fn new(seg: u16, bus: u8, slot: u8, func: u8) -> Self {
        Self {
            seg,
            bus,
            slot,
            func,
        }
    }

    /// Dense key for registry maps.
    pub const fn raw(self) -> u32 {
        (self.seg as u32) << 16 | (self.bus as u32) << 8 | (self.slot as u32) << 3 | self.func as u32
    }
}

impl core::fmt::Display for Address {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "{:04x}:{:02x}:{:02x}.{}",
            self.seg, self.bus, self.slot, self.func
        )
    }
}

#[derive(Debug, Clone, Copy)]
struct EcamRegion {
    base: PhysAddr,
    segment: u16,
    bus_start: u8,
    bus_end: u8,
}

impl EcamRegion {
    fn mmio_for(&self, addr: Address, offset: u16) -> *mut u8 {
        let offset = ((addr.bus - self.bus_start) as u64) << 20
            | (addr.slot as u64) << 15
            | (addr.func as u64) << 12
            | offset as u64;
        (self.base + offset).to_virt().as_mut_ptr()
    }
}

static ECAM_REGIONS: OnceCell<Vec<EcamRegion>> = OnceCell::uninit();
static LEGACY_PORTS: Mutex<(Port<u32>, Port<u32>)> =
    Mutex::new((Port::new(CONFIG_ADDRESS), Port::new(CONFIG_DATA)));

fn ecam_for(addr: Address) -> Option<EcamRegion> {
    ECAM_REGIONS
        .get()?
        .iter()
        .find(|r| r.segment == addr.seg && (r.bus_start..=r.bus_end).contains(&addr.bus))
        .copied()
}

fn legacy_read(addr: Address, offset: u16, width: u8) -> u32 {
    let register = 0x8000_0000
        | (addr.bus as u32) << 16
        | (addr.slot as u32) << 11
        | (addr.func as u32) << 8
        | (offset as u32 & 0xFC);

    let mut ports = LEGACY_PORTS.lock();
    unsafe {
        ports.0.write(register);
        let value = ports.1.read();
        let shift = (offset as u32 & 3) * 8;
        match width {
            1 => (value >> shift) & 0xFF,
            2 => (value >> shift) & 0xFFFF,
            4 => value,
            _ => unreachable!("bad PCI access width"),
        }
    }
}

fn legacy_write(addr: Address, offset: u16, value: u32, width: u8) {
    let register = 0x8000_0000
        | (addr.bus as u32) << 16
        | (addr.slot as u32) << 11
        | (addr.func as u32) << 8
        | (offset as u32 & 0xFC);

    let mut ports = LEGACY_PORTS.lock();
    unsafe {
        ports.0.write(register);
        match width {
            4 => ports.1.write(value),
            _ => {
                // Read-modify-write the containing dword.
                let old = ports.1.read();
                let shift = (offset as u32 & 3) * 8;
                let mask = (if width == 1 { 0xFFu32 } else { 0xFFFF }) << shift;
                let merged = (old & !mask) | ((value << shift) & mask);
                ports.0.write(register);
                ports.1.write(merged);
            }
        }
    }
}

pub fn read(addr: Address, offset: u16, width: u8) -> u32 {
    match ecam_for(addr) {
        Some(region) => unsafe {
            let ptr = region.mmio_for(addr, offset);
            match width {
                1 => core::ptr::read_volatile(ptr) as u32,
                2 => core::ptr::read_volatile(ptr as *const u16) as u32,
                4 => core::ptr::read_volatile(ptr as *const u32),
                _ => unreachable!("bad PCI access width"),
            }
        },
        None => legacy_read(addr, offset, width),
    }
}

pub fn write(addr: Address, offset: u16, value: u32, width: u8) {
    match ecam_for(addr) {
        Some(region) => unsafe {
            let ptr = region.mmio_for(addr, offset);
            match width {
                1 => core::ptr::write_volatile(ptr, value as u8),
                2 => core::ptr::write_volatile(ptr as *mut u16, value as u16),
                4 => core::ptr::write_volatile(ptr as *mut u32, value),
                _ => unreachable!("bad PCI access width"),
            }
        },
        None => legacy_write(addr, offset, value, width),
    }
}

/// Decoded base address register.
#[derive(Debug, Clone, Copy)]
pub enum Bar {
    Mmio { base: PhysAddr, size: u64 },
    Pio { base: u16 },
    None,
}

/// One enumerated PCI function.
#[derive(Debug, Clone, Copy)]
pub struct Device {
    pub addr: Address,
    pub vendor_id: u16,
    pub device_id: u16,
    pub class: u8,
    pub subclass: u8,
    pub prog_if: u8,
}

impl Device {
    pub fn read8(&self, offset: u16) -> u8 {
        read(self.addr, offset, 1) as u8
    }

    pub fn read16(&self, offset: u16) -> u16 {
        read(self.addr, offset, 2) as u16
    }

    pub fn read32(&self, offset: u16) -> u32 {
        read(self.addr, offset, 4)
    }

    pub fn write8(&self, offset: u16, value: u8) {
        write(self.addr, offset, value as u32, 1)
    }

    pub fn write16(&self, offset: u16, value: u16) {
        write(self.addr, offset, value as u32, 2)
    }

    pub fn write32(&self, offset: u16, value: u32) {
        write(self.addr, offset, value, 4)
    }

    /// Decode BAR `index`, size-probing MMIO BARs the usual way (write
    /// all-ones, read back the mask, restore).
    pub fn read_bar(&self, index: u8) -> Bar {
        let offset = REG_BAR0 + index as u16 * 4;
        let raw = self.read32(offset);

        if raw == 0 {
            return Bar::None;
        }

        if raw & 1 != 0 {
            return Bar::Pio {
                base: (raw & !0x3) as u16,
            };
        }

        let is_64bit = raw & 0b110 == 0b100;
        let mut base = (raw & !0xF) as u64;
        if is_64bit {
            base |= (self.read32(offset + 4) as u64) << 32;
        }

        self.write32(offset, u32::MAX);
        let mask = self.read32(offset) & !0xF;
        self.write32(offset, raw);
        let size = (!(mask as u64) & 0xFFFF_FFFF) + 1;

        Bar::Mmio {
            base: PhysAddr::new(base),
            size,
        }
    }
}

/// How a driver claims devices.
#[derive(Debug, Clone, Copy)]
pub enum DriverMatch {
    /// Explicit (vendor, device) pairs.
    VendorDevice(&'static [(u16, u16)]),
    /// Programming-interface match; `prog_if` of `None` matches any.
    Class {
        class: u8,
        subclass: u8,
        prog_if: Option<u8>,
    },
}

pub struct Driver {
    pub name: &'static str,
    pub matches: DriverMatch,
    pub probe: fn(&Device),
}

impl DriverMatch {
    fn matches(&self, dev: &Device) -> bool {
        match *self {
            DriverMatch::VendorDevice(pairs) => pairs
                .iter()
                .any(|&(v, d)| v == dev.vendor_id && d == dev.device_id),
            DriverMatch::Class {
                class,
                subclass,
                prog_if,
            } => {
                class == dev.class
                    && subclass == dev.subclass
                    && prog_if.map_or(true, |p| p == dev.prog_if)
            }
        }
    }
}

static DRIVERS: TicketLock<Vec<&'static Driver>> = TicketLock::new(Vec::new());
static DEVICES: OnceCell<Vec<Device>> = OnceCell::uninit();

/// Register before `init()`; late registrations simply miss enumeration.
pub fn register_driver(driver: &'static Driver) {
    DRIVERS.lock().push(driver);
}

pub fn devices() -> &'static [Device] {
    DEVICES.get().map(|v| &v[..]).unwrap_or(&[])
}

fn probe_function(addr: Address, found: &mut Vec<Device>) {
    let vendor = read(addr, REG_VENDOR_ID, 2) as u16;
    if vendor == 0xFFFF {
        return;
    }

    let class_reg = read(addr, REG_CLASS, 4);
    let device = Device {
        addr,
        vendor_id: vendor,
        device_id: read(addr, REG_VENDOR_ID + 2, 2) as u16,
        class: (class_reg >> 24) as u8,
        subclass: (class_reg >> 16) as u8,
        prog_if: (class_reg >> 8) as u8,
    };

    log::info!(
        "pci: {} {:04x}:{:04x} class {:02x}.{:02x}.{:02x}",
        device.addr,
        device.vendor_id,
        device.device_id,
        device.class,
        device.subclass,
        device.prog_if
    );
    found.push(device);
}

fn scan_bus(seg: u16, bus: u8, found: &mut Vec<Device>) {
    for slot in 0..32 {
        let addr = Address::new(seg, bus, slot, 0);
        if read(addr, REG_VENDOR_ID, 2) as u16 == 0xFFFF {
            continue;
        }

        let multifunction = read(addr, REG_HEADER_TYPE, 1) & 0x80 != 0;
        let functions = if multifunction { 8 } else { 1 };
        for func in 0..functions {
            probe_function(Address::new(seg, bus, slot, func), found);
        }
    }
}

/// Map ECAM windows, enumerate every function, then run driver matching.
pub fn init() {
    let mut regions = Vec::new();
    if let Some(mcfg) = acpi::mcfg() {
        for entry in mcfg.entries() {
            let region = EcamRegion {
                base: PhysAddr::new(entry.base_address),
                segment: entry.segment,
                bus_start: entry.bus_start,
                bus_end: entry.bus_end,
            };
            log::info!(
                "pci: ECAM segment {} buses {}..={} at {:#x}",
                region.segment,
                region.bus_start,
                region.bus_end,
                region.base
            );

            // Config space must be uncached.
            let buses = (region.bus_end - region.bus_start) as u64 + 1;
            let mut offset = 0;
            while offset < buses << 20 {
                kernel_space()
                    .lock()
                    .set_caching((region.base + offset).to_virt(), CacheMode::Uncacheable);
                offset += PAGE_SIZE;
            }

            regions.push(region);
        }
    }
    let have_ecam = !regions.is_empty();
    ECAM_REGIONS.init_once(|| regions);

    let mut found = Vec::new();
    if have_ecam {
        for region in ECAM_REGIONS.get().unwrap() {
            for bus in region.bus_start..=region.bus_end {
                scan_bus(region.segment, bus, &mut found);
            }
        }
    } else {
        for bus in 0..=255u8 {
            scan_bus(0, bus, &mut found);
        }
    }

    let drivers = DRIVERS.lock();
    for device in &found {
        if let Some(driver) = drivers.iter().find(|d| d.matches.matches(device)) {
            log::info!("pci: {} claimed by {}", device.addr, driver.name);
            (driver.probe)(device);
        }
    }

    log::info!("pci: {} functions enumerated", found.len());
    DEVICES.init_once(|| found);
}

/// Bus-master + memory/IO decode enable, the bit every DMA-capable
/// driver wants.
pub fn enable_device(device: &Device) {
    let command = device.read16(REG_COMMAND);
    device.write16(REG_COMMAND, command | 0b111);
}
