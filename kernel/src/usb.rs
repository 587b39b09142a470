//! USB driver match registry.
//!
//! Host controller drivers are collaborators; what lives here is the
//! table tying their discovered devices to class drivers. A driver
//! registers a match record and gets handed every device that fits.

use alloc::vec::Vec;

use crate::sync::TicketLock;

/// Match record; `None` fields match anything.
#[derive(Debug, Clone, Copy, Default)]
pub struct Match {
    pub class: Option<u8>,
    pub subclass: Option<u8>,
    pub protocol: Option<u8>,
    pub version: Option<u16>,
    pub vendor: Option<u16>,
    pub product: Option<u16>,
}

/// What a host controller knows about a discovered device.
#[derive(Debug, Clone, Copy)]
pub struct DeviceInfo {
    pub class: u8,
    pub subclass: u8,
    pub protocol: u8,
    /// bcdUSB of the device descriptor.
    pub version: u16,
    pub vendor: u16,
    pub product: u16,
}

impl Match {
    fn matches(&self, dev: &DeviceInfo) -> bool {
        self.class.map_or(true, |v| v == dev.class)
            && self.subclass.map_or(true, |v| v == dev.subclass)
            && self.protocol.map_or(true, |v| v == dev.protocol)
            && self.version.map_or(true, |v| v == dev.version)
            && self.vendor.map_or(true, |v| v == dev.vendor)
            && self.product.map_or(true, |v| v == dev.product)
    }
}

pub struct Driver {
    pub name: &'static str,
    pub matches: Match,
    pub probe: fn(DeviceInfo),
}

static DRIVERS: TicketLock<Vec<&'static Driver>> = TicketLock::new(Vec::new());

pub fn register_driver(driver: &'static Driver) {
    DRIVERS.lock().push(driver);
}

/// Called by host controller drivers for every new device. The first
/// matching driver wins; an unmatched device is just logged.
pub fn device_discovered(device: DeviceInfo) {
    let drivers = DRIVERS.lock();
    match drivers.iter().find(|d| d.matches.matches(&device)) {
        Some(driver) => {
            log::info!(
                "usb: {:04x}:{:04x} claimed by {}",
                device.vendor,
                device.product,
                driver.name
            );
            (driver.probe)(device);
        }
        None => log::info!(
            "usb: no driver for {:04x}:{:04x} class {:02x}.{:02x}.{:02x}",
            device.vendor,
            device.product,
            device.class,
            device.subclass,
            device.protocol
        ),
    }
}
