//! Guest PCI configuration front-ends.
//!
//! Two doors into the same host-bridge map: the legacy CF8/CFC
//! address/data port pair and a relocatable ECAM window. Both decode the
//! access into a (seg, bus, slot, func) key and forward to whatever
//! `PciDevice` the VM registered there. Reads from functions nobody
//! registered return all-ones, like real config space.

use alloc::sync::Arc;

use bitfield_struct::bitfield;

use crate::pci::Address as DeviceId;
use crate::sync::IrqTicketLock;

use super::{MmioDevice, PioDevice, Vm, VmShared};

pub const CONFIG_ADDRESS_PORT: u16 = 0xCF8;
pub const CONFIG_DATA_PORT: u16 = 0xCFC;

/// The CF8 address latch.
#[bitfield(u32)]
struct ConfigAddress {
    #[bits(8)]
    register: u8,
    #[bits(3)]
    func: u8,
    #[bits(5)]
    slot: u8,
    #[bits(8)]
    bus: u8,
    #[bits(7)]
    reserved: u8,
    enable: bool,
}

/// Legacy CF8/CFC front-end.
pub struct ConfigPio {
    shared: Arc<VmShared>,
    segment: u16,
    address: IrqTicketLock<u32>,
}

impl ConfigPio {
    /// Build and claim the eight ports of the address/data window.
    pub fn register(vm: &Vm, segment: u16) -> Arc<Self> {
        let frontend = Arc::new(Self {
            shared: vm.shared(),
            segment,
            address: IrqTicketLock::new(0),
        });

        let ports: [u16; 8] = core::array::from_fn(|i| {
            if i < 4 {
                CONFIG_ADDRESS_PORT + i as u16
            } else {
                CONFIG_DATA_PORT + (i - 4) as u16
            }
        });
        vm.register_pio(&ports, frontend.clone());

        frontend
    }

    fn current_target(&self) -> Option<(DeviceId, u16)> {
        let latch = ConfigAddress::from(*self.address.lock());
        if !latch.enable() {
            return None;
        }

        let id = DeviceId::new(self.segment, latch.bus(), latch.slot(), latch.func());
        Some((id, (latch.register() & 0xFC) as u16))
    }
}

impl PioDevice for ConfigPio {
    fn pio_read(&self, port: u16, size: u8) -> u32 {
        if port == CONFIG_ADDRESS_PORT && size == 4 {
            return *self.address.lock();
        }

        if (CONFIG_DATA_PORT..CONFIG_DATA_PORT + 4).contains(&port) {
            let Some((id, register)) = self.current_target() else {
                return 0;
            };
            let offset = port - CONFIG_DATA_PORT;

            let device = self.shared.tables.lock().bridge.get(&id.raw()).cloned();
            return match device {
                Some(device) => device.pci_read(id, register + offset, size),
                // Nonexistent functions read all-ones.
                None => u32::MAX,
            };
        }

        log::debug!("pci-host: unhandled read from port {:#x}", port);
        0
    }

    fn pio_write(&self, port: u16, value: u32, size: u8) {
        if port == CONFIG_ADDRESS_PORT && size == 4 {
            *self.address.lock() = value;
            return;
        }

        if (CONFIG_DATA_PORT..CONFIG_DATA_PORT + 4).contains(&port) {
            let Some((id, register)) = self.current_target() else {
                return;
            };
            let offset = port - CONFIG_DATA_PORT;

            let device = self.shared.tables.lock().bridge.get(&id.raw()).cloned();
            if let Some(device) = device {
                device.pci_write(id, register + offset, value, size);
            }
            return;
        }

        log::debug!(
            "pci-host: unhandled write to port {:#x}: {:#x}",
            port,
            value
        );
    }
}

/// An ECAM address is just the offset inside the window.
#[bitfield(u64)]
struct EcamAddress {
    #[bits(12)]
    register: u16,
    #[bits(3)]
    func: u8,
    #[bits(5)]
    slot: u8,
    #[bits(8)]
    bus: u8,
    #[bits(36)]
    reserved: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct EcamWindow {
    pub base: u64,
    pub size: u64,
    pub bus_start: u8,
    pub bus_end: u8,
    pub enabled: bool,
}

/// ECAM front-end. The chipset emulation moves the window by calling
/// `update_window` when the guest reprograms the bridge.
pub struct ConfigEcam {
    shared: Arc<VmShared>,
    segment: u16,
    window: IrqTicketLock<EcamWindow>,
}

impl ConfigEcam {
    pub fn new(vm: &Vm, segment: u16) -> Arc<Self> {
        Arc::new(Self {
            shared: vm.shared(),
            segment,
            window: IrqTicketLock::new(EcamWindow {
                base: 0,
                size: 0,
                bus_start: 0,
                bus_end: 0,
                enabled: false,
            }),
        })
    }

    /// (De)register the MMIO range to match the new window.
    pub fn update_window(self: &Arc<Self>, vm: &Vm, window: EcamWindow) {
        let mut current = self.window.lock();

        if current.enabled {
            vm.unregister_mmio(current.base);
        }
        if window.enabled {
            vm.register_mmio(window.base, window.size, self.clone());
        }

        *current = window;
    }

    fn decode(&self, addr: u64) -> Option<(DeviceId, u16)> {
        let window = self.window.lock();
        if !window.enabled {
            return None;
        }

        let ecam = EcamAddress::from(addr - window.base);
        if !(window.bus_start..=window.bus_end).contains(&ecam.bus()) {
            return None;
        }

        let id = DeviceId::new(self.segment, ecam.bus(), ecam.slot(), ecam.func());
        Some((id, ecam.register()))
    }
}

impl MmioDevice for ConfigEcam {
    fn mmio_read(&self, addr: u64, size: u8) -> u64 {
        debug_assert!(size == 1 || size == 2 || size == 4);
        let Some((id, register)) = self.decode(addr) else {
            return 0;
        };

        let device = self.shared.tables.lock().bridge.get(&id.raw()).cloned();
        match device {
            Some(device) => device.pci_read(id, register, size) as u64,
            None => u64::MAX,
        }
    }

    fn mmio_write(&self, addr: u64, value: u64, size: u8) {
        debug_assert!(size == 1 || size == 2 || size == 4);
        let Some((id, register)) = self.decode(addr) else {
            return;
        };

        let device = self.shared.tables.lock().bridge.get(&id.raw()).cloned();
        if let Some(device) = device {
            device.pci_write(id, register, value as u32, size);
        }
    }
}
