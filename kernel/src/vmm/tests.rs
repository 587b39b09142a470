//! Dispatch fabric self tests. Pure table logic; no VM entry required.

use alloc::sync::Arc;

use core::sync::atomic::{AtomicU64, Ordering};

use crate::pci::Address as DeviceId;

use super::{DispatchTables, MmioDevice, PciDevice, PioDevice, RegisterState};

struct NullMmio;

impl MmioDevice for NullMmio {
    fn mmio_read(&self, _addr: u64, _size: u8) -> u64 {
        0
    }
    fn mmio_write(&self, _addr: u64, _value: u64, _size: u8) {}
}

struct CountingPio {
    reads: AtomicU64,
}

impl PioDevice for CountingPio {
    fn pio_read(&self, port: u16, _size: u8) -> u32 {
        self.reads.fetch_add(1, Ordering::SeqCst);
        port as u32
    }
    fn pio_write(&self, _port: u16, _value: u32, _size: u8) {}
}

struct OnesPci;

impl PciDevice for OnesPci {
    fn pci_read(&self, _dev: DeviceId, _reg: u16, _size: u8) -> u32 {
        u32::MAX
    }
    fn pci_write(&self, _dev: DeviceId, _reg: u16, _value: u32, _size: u8) {}
}

fn test_mmio_range_lookup() {
    let mut tables = DispatchTables::new();
    tables.mmio.insert(
        0x1000,
        super::MmioRange {
            device: Arc::new(NullMmio),
            len: 0x100,
        },
    );
    tables.mmio.insert(
        0x8000,
        super::MmioRange {
            device: Arc::new(NullMmio),
            len: 0x1000,
        },
    );

    // Inside, edges, and the gaps between regions.
    assert!(tables.mmio_lookup(0x1000).is_some());
    assert!(tables.mmio_lookup(0x10FF).is_some());
    assert!(tables.mmio_lookup(0x1100).is_none());
    assert!(tables.mmio_lookup(0x0FFF).is_none());

    let (base, len, _) = tables.mmio_lookup(0x8ABC).unwrap();
    assert_eq!(base, 0x8000);
    assert_eq!(len, 0x1000);

    log::info!("vmm tests: mmio lookup ok");
}

fn test_pio_flat_map() {
    let mut tables = DispatchTables::new();
    assert_eq!(tables.pio.len(), 65536);

    let device = Arc::new(CountingPio {
        reads: AtomicU64::new(0),
    });
    for port in [0x70u16, 0x71] {
        tables.pio[port as usize] = Some(device.clone());
    }

    assert!(tables.pio[0x70].is_some());
    assert!(tables.pio[0x72].is_none());

    let value = tables.pio[0x71].as_ref().unwrap().pio_read(0x71, 1);
    assert_eq!(value, 0x71);
    assert_eq!(device.reads.load(Ordering::SeqCst), 1);

    log::info!("vmm tests: pio map ok");
}

fn test_host_bridge_keys() {
    let mut tables = DispatchTables::new();
    let id = DeviceId::new(0, 0, 0x1F, 3);
    tables.bridge.insert(id.raw(), Arc::new(OnesPci));

    assert!(tables.bridge.contains_key(&id.raw()));
    assert!(!tables
        .bridge
        .contains_key(&DeviceId::new(0, 0, 0x1F, 2).raw()));

    // Absent functions read all-ones by convention; present ones answer.
    let device = tables.bridge.get(&id.raw()).unwrap();
    assert_eq!(device.pci_read(id, 0, 4), u32::MAX);

    log::info!("vmm tests: host bridge ok");
}

fn test_reset_state() {
    let regs = RegisterState::reset();
    assert_eq!(regs.cs.selector, 0xF000);
    assert_eq!(regs.cs.base, 0xF_0000);
    assert_eq!(regs.rip, 0xFFF0);
    assert!(regs.rflags & 0x2 != 0);

    log::info!("vmm tests: reset state ok");
}

pub fn run() {
    test_mmio_range_lookup();
    test_pio_flat_map();
    test_host_bridge_keys();
    test_reset_state();
}
