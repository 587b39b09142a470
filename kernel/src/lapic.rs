//! Local APIC access, xAPIC (MMIO) or x2APIC (MSR).
//!
//! The mode is whatever the loader/firmware left enabled in
//! `IA32_APIC_BASE`; we only switch the LAPIC on and use it for EOI, ID
//! reads and startup IPIs. Interrupt routing policy lives in `ioapic`.

use x86_64::registers::model_specific::Msr;

use crate::memory::PhysAddr;

const IA32_APIC_BASE: u32 = 0x1B;
const APIC_BASE_X2_ENABLE: u64 = 1 << 10;
const APIC_BASE_GLOBAL_ENABLE: u64 = 1 << 11;

const REG_ID: u32 = 0x20;
const REG_EOI: u32 = 0xB0;
const REG_SPURIOUS: u32 = 0xF0;
const REG_ICR_LOW: u32 = 0x300;
const REG_ICR_HIGH: u32 = 0x310;

const X2APIC_MSR_BASE: u32 = 0x800;

const SPURIOUS_VECTOR: u32 = 0xFF;
const SPURIOUS_ENABLE: u32 = 1 << 8;

pub struct Lapic {
    x2apic: bool,
    mmio_base: PhysAddr,
}

impl Lapic {
    pub fn new() -> Self {
        let base = unsafe { Msr::new(IA32_APIC_BASE).read() };
        Self {
            x2apic: base & APIC_BASE_X2_ENABLE != 0,
            mmio_base: PhysAddr::new(base & 0xF_FFFF_F000),
        }
    }

    fn read(&self, reg: u32) -> u64 {
        if self.x2apic {
            unsafe { Msr::new(X2APIC_MSR_BASE + (reg >> 4)).read() }
        } else {
            let ptr = (self.mmio_base + reg as u64).to_virt().as_ptr::<u32>();
            unsafe { core::ptr::read_volatile(ptr) as u64 }
        }
    }

    fn write(&self, reg: u32, value: u64) {
        if self.x2apic {
            unsafe { Msr::new(X2APIC_MSR_BASE + (reg >> 4)).write(value) };
        } else {
            let ptr = (self.mmio_base + reg as u64).to_virt().as_mut_ptr::<u32>();
            unsafe { core::ptr::write_volatile(ptr, value as u32) };
        }
    }

    /// Globally enable the LAPIC and unmask the spurious vector.
    pub fn enable(&self) {
        unsafe {
            let base = Msr::new(IA32_APIC_BASE).read();
            Msr::new(IA32_APIC_BASE).write(base | APIC_BASE_GLOBAL_ENABLE);
        }
        self.write(REG_SPURIOUS, (SPURIOUS_VECTOR | SPURIOUS_ENABLE) as u64);
    }

    pub fn id(&self) -> u32 {
        if self.x2apic {
            self.read(REG_ID) as u32
        } else {
            (self.read(REG_ID) >> 24) as u32
        }
    }

    pub fn eoi(&self) {
        self.write(REG_EOI, 0);
    }

    /// Fixed-delivery IPI to one LAPIC.
    pub fn send_ipi(&self, dest: u32, vector: u8) {
        if self.x2apic {
            self.write(REG_ICR_LOW, ((dest as u64) << 32) | vector as u64);
        } else {
            self.write(REG_ICR_HIGH, (dest as u64) << 24);
            self.write(REG_ICR_LOW, vector as u64);
        }
    }
}
