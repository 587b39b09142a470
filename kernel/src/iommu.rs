//! IOMMU facade: one DMA address space per passthrough device.
//!
//! The hardware drivers (AMD-Vi device tables, VT-d root/context tables
//! and their IOTLB invalidation queues) are collaborators; they register
//! each device's second-level context here, and the Iovmm maps DMA pages
//! through this table without caring which vendor is underneath.

use alloc::collections::BTreeMap;

use crate::memory::io_paging::IoContext;
use crate::memory::sl_paging::SlContext;
use crate::memory::walker::PageFlags;
use crate::memory::{PhysAddr, VirtAddr};
use crate::pci;
use crate::sync::TicketLock;

/// A device's translation context, tagged by the IOMMU flavor owning it.
pub enum DeviceContext {
    AmdVi(IoContext),
    VtD(SlContext),
}

impl DeviceContext {
    fn map(&mut self, pa: PhysAddr, iova: u64, flags: PageFlags) {
        match self {
            DeviceContext::AmdVi(ctx) => ctx.map(pa, VirtAddr::new(iova), flags),
            DeviceContext::VtD(ctx) => ctx.map(pa, VirtAddr::new(iova), flags),
        }
    }

    fn unmap(&mut self, iova: u64) -> PhysAddr {
        match self {
            DeviceContext::AmdVi(ctx) => ctx.unmap(VirtAddr::new(iova)),
            DeviceContext::VtD(ctx) => ctx.unmap(VirtAddr::new(iova)),
        }
    }

    fn get_phys(&self, iova: u64) -> PhysAddr {
        match self {
            DeviceContext::AmdVi(ctx) => ctx.get_phys(VirtAddr::new(iova)),
            DeviceContext::VtD(ctx) => ctx.get_phys(VirtAddr::new(iova)),
        }
    }

    pub fn root_pa(&self) -> PhysAddr {
        match self {
            DeviceContext::AmdVi(ctx) => ctx.root_pa(),
            DeviceContext::VtD(ctx) => ctx.root_pa(),
        }
    }
}

static DOMAINS: TicketLock<BTreeMap<u32, DeviceContext>> = TicketLock::new(BTreeMap::new());

/// Adopt `ctx` as `device`'s DMA address space. Called by the IOMMU
/// hardware driver when it wires the device's table entry.
pub fn register_device(device: pci::Address, ctx: DeviceContext) {
    let previous = DOMAINS.lock().insert(device.raw(), ctx);
    assert!(
        previous.is_none(),
        "iommu: {} registered twice",
        device
    );
    log::info!("iommu: device {} has a DMA address space", device);
}

pub fn is_registered(device: pci::Address) -> bool {
    DOMAINS.lock().contains_key(&device.raw())
}

/// Map one 4 KiB page into the device's DMA space. The caller (or the
/// hardware driver) is responsible for the IOTLB flush.
pub fn map(device: pci::Address, pa: PhysAddr, iova: u64, flags: PageFlags) {
    let mut domains = DOMAINS.lock();
    let ctx = domains
        .get_mut(&device.raw())
        .unwrap_or_else(|| panic!("iommu: {} has no DMA address space", device));
    ctx.map(pa, iova, flags);
}

pub fn unmap(device: pci::Address, iova: u64) -> PhysAddr {
    let mut domains = DOMAINS.lock();
    let ctx = domains
        .get_mut(&device.raw())
        .unwrap_or_else(|| panic!("iommu: {} has no DMA address space", device));
    ctx.unmap(iova)
}

pub fn get_phys(device: pci::Address, iova: u64) -> PhysAddr {
    let domains = DOMAINS.lock();
    let ctx = domains
        .get(&device.raw())
        .unwrap_or_else(|| panic!("iommu: {} has no DMA address space", device));
    ctx.get_phys(iova)
}

/// Drop a device's context (hot-unplug path); frees its whole table tree.
pub fn unregister_device(device: pci::Address) {
    DOMAINS.lock().remove(&device.raw());
}
