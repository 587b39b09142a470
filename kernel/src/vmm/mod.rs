//! The VM runtime.
//!
//! A [`Vm`] is guest-physical memory behind an EPT or NPT context plus
//! the dispatch fabric for guest-side accesses: a flat 64 K port map, a
//! range-keyed MMIO map, and the PCI host bridge keyed by
//! (seg, bus, slot, func). Emulated devices implement the capability
//! traits below with `&self` entry points and their own interior locking;
//! registration happens under the VM-wide lock, dispatch is read-mostly.
//!
//! Each vCPU runs inside one kernel thread: restore guest state, enter,
//! classify the exit, route it, inject any pending interrupt, loop.

pub mod emulate;
pub mod pci_host;
pub mod svm;
pub mod vmx;

#[cfg(feature = "testing")]
pub mod emulate_tests;
#[cfg(feature = "testing")]
pub mod tests;

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;

use core::arch::x86_64::__cpuid;

use crate::memory::ept::{self, EptContext};
use crate::memory::npt::{self, NptContext};
use crate::memory::walker::PageFlags;
use crate::memory::{paging_levels, PhysAddr};
use crate::pci::Address as DeviceId;
use crate::sync::IrqTicketLock;

/// Longest legal x86 instruction.
pub const MAX_INSTRUCTION_SIZE: usize = 15;

/// An emulated device claiming I/O ports. Sizes are 1, 2 or 4.
pub trait PioDevice: Send + Sync {
    fn pio_read(&self, port: u16, size: u8) -> u32;
    fn pio_write(&self, port: u16, value: u32, size: u8);
}

/// An emulated device claiming a guest-physical range. Sizes are 1, 2, 4
/// or 8. Addresses are offsets into guest-physical space, not the region.
pub trait MmioDevice: Send + Sync {
    fn mmio_read(&self, addr: u64, size: u8) -> u64;
    fn mmio_write(&self, addr: u64, value: u64, size: u8);
}

/// An emulated PCI function behind the host bridge. Sizes are 1, 2 or 4.
pub trait PciDevice: Send + Sync {
    fn pci_read(&self, dev: DeviceId, reg: u16, size: u8) -> u32;
    fn pci_write(&self, dev: DeviceId, reg: u16, value: u32, size: u8);
}

/// An interrupt aggregator (emulated PIC or IOAPIC+LAPIC front).
/// Emulated devices raise lines through `irq_set`; the vCPU loop consults
/// the pin before every entry and injects the advertised vector.
pub trait IrqListener: Send + Sync {
    fn irq_set(&self, vector: u8, level: bool);
    fn read_irq_pin(&self) -> bool;
    fn read_irq_vector(&self) -> u8;
}

/// One guest segment register.
#[derive(Debug, Clone, Copy, Default)]
pub struct Segment {
    pub selector: u16,
    pub base: u64,
    pub limit: u32,
    pub attrib: u16,
}

/// Architectural vCPU state shuttled across VM entries.
#[derive(Debug, Clone, Copy, Default)]
pub struct RegisterState {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub rsp: u64,
    pub rbp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rip: u64,
    pub rflags: u64,

    pub cs: Segment,
    pub ds: Segment,
    pub es: Segment,
    pub ss: Segment,
    pub fs: Segment,
    pub gs: Segment,

    pub cr0: u64,
    pub cr3: u64,
    pub cr4: u64,
    pub efer: u64,
}

/// Why the guest stopped running.
#[derive(Debug, Clone, Copy)]
pub enum VmExit {
    Pio {
        port: u16,
        size: u8,
        write: bool,
    },
    Mmio {
        gpa: u64,
    },
    Cpuid,
    Msr {
        write: bool,
    },
    Hlt,
    /// A host interrupt punched through; nothing guest-visible happened.
    Interrupted,
    Shutdown,
    Unknown(u64),
}

#[derive(Debug)]
pub enum VmError {
    /// Triple fault or an explicit shutdown: the VM is gone.
    Shutdown,
    /// The emulator met an instruction it cannot handle.
    UnsupportedInstruction,
    /// Guest state made no sense (e.g. unmapped instruction fetch).
    BadGuestState,
}

/// Hardware virtualization backend for one vCPU.
pub trait VcpuBackend: Send {
    /// Enter the guest with `regs` and bring the post-exit state back.
    fn run(&mut self, regs: &mut RegisterState) -> VmExit;

    /// Queue an external interrupt for the next entry.
    fn inject_interrupt(&mut self, vector: u8);

    /// Instruction length of the current exit, when hardware reports it.
    fn exit_instruction_len(&self) -> u64;
}

/// Guest-physical memory behind whichever second level the CPU offers.
pub enum GuestMemory {
    Ept(EptContext),
    Npt(NptContext),
}

impl GuestMemory {
    pub fn map(&mut self, pa: PhysAddr, gpa: u64, flags: PageFlags) {
        match self {
            GuestMemory::Ept(ctx) => ctx.map(pa, crate::memory::VirtAddr::new(gpa), flags),
            GuestMemory::Npt(ctx) => ctx.map(pa, crate::memory::VirtAddr::new(gpa), flags),
        }
    }

    pub fn unmap(&mut self, gpa: u64) -> PhysAddr {
        match self {
            GuestMemory::Ept(ctx) => ctx.unmap(crate::memory::VirtAddr::new(gpa)),
            GuestMemory::Npt(ctx) => ctx.unmap(crate::memory::VirtAddr::new(gpa)),
        }
    }

    pub fn get_phys(&self, gpa: u64) -> PhysAddr {
        match self {
            GuestMemory::Ept(ctx) => ctx.get_phys(crate::memory::VirtAddr::new(gpa)),
            GuestMemory::Npt(ctx) => ctx.get_phys(crate::memory::VirtAddr::new(gpa)),
        }
    }

    pub fn root_pa(&self) -> PhysAddr {
        match self {
            GuestMemory::Ept(ctx) => ctx.root_pa(),
            GuestMemory::Npt(ctx) => ctx.root_pa(),
        }
    }
}

struct MmioRange {
    device: Arc<dyn MmioDevice>,
    len: u64,
}

/// The registration side of the fabric, mutated only at device setup.
pub struct DispatchTables {
    pio: Vec<Option<Arc<dyn PioDevice>>>,
    mmio: BTreeMap<u64, MmioRange>,
    bridge: BTreeMap<u32, Arc<dyn PciDevice>>,
    irq_listeners: Vec<Arc<dyn IrqListener>>,
}

impl DispatchTables {
    fn new() -> Self {
        let mut pio = Vec::new();
        pio.resize_with(65536, || None);
        Self {
            pio,
            mmio: BTreeMap::new(),
            bridge: BTreeMap::new(),
            irq_listeners: Vec::new(),
        }
    }

    fn mmio_lookup(&self, gpa: u64) -> Option<(u64, u64, Arc<dyn MmioDevice>)> {
        let (&base, range) = self.mmio.range(..=gpa).next_back()?;
        (gpa < base + range.len).then(|| (base, range.len, range.device.clone()))
    }
}

/// Everything the vCPUs share.
pub struct VmShared {
    pub memory: IrqTicketLock<GuestMemory>,
    tables: IrqTicketLock<DispatchTables>,
}

pub struct Vm {
    shared: Arc<VmShared>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CpuVendor {
    Intel,
    Amd,
}

fn cpu_vendor() -> CpuVendor {
    let leaf0 = unsafe { __cpuid(0) };
    let mut vendor = [0u8; 12];
    vendor[0..4].copy_from_slice(&leaf0.ebx.to_le_bytes());
    vendor[4..8].copy_from_slice(&leaf0.edx.to_le_bytes());
    vendor[8..12].copy_from_slice(&leaf0.ecx.to_le_bytes());

    match &vendor {
        b"GenuineIntel" => CpuVendor::Intel,
        b"AuthenticAMD" => CpuVendor::Amd,
        other => panic!(
            "unknown CPU vendor {:?}",
            core::str::from_utf8(other).unwrap_or("<garbage>")
        ),
    }
}

impl Vm {
    /// Create a VM with empty guest-physical memory on whichever
    /// virtualization extension this host has.
    pub fn new() -> Self {
        let memory = match cpu_vendor() {
            CpuVendor::Intel => {
                vmx::init();
                GuestMemory::Ept(ept::new_context(paging_levels()))
            }
            CpuVendor::Amd => {
                svm::init();
                GuestMemory::Npt(npt::new_context(paging_levels(), svm::allocate_asid()))
            }
        };

        Self {
            shared: Arc::new(VmShared {
                memory: IrqTicketLock::new(memory),
                tables: IrqTicketLock::new(DispatchTables::new()),
            }),
        }
    }

    pub fn shared(&self) -> Arc<VmShared> {
        self.shared.clone()
    }

    /// Back `gpa` with a fresh zeroed frame. Panics on host exhaustion
    /// during VM construction.
    pub fn map_new_page(&self, gpa: u64) -> PhysAddr {
        let pa = crate::memory::pmm::alloc_block().expect("vmm: out of frames for guest memory");
        unsafe {
            core::ptr::write_bytes(pa.to_virt().as_mut_ptr::<u8>(), 0, 4096);
        }
        self.shared.memory.lock().map(
            pa,
            gpa,
            PageFlags::PRESENT | PageFlags::WRITE | PageFlags::EXECUTE,
        );
        pa
    }

    /// Copy bytes into guest-physical memory (firmware/kernel loading).
    pub fn write_guest(&self, gpa: u64, data: &[u8]) {
        let memory = self.shared.memory.lock();
        for (i, &byte) in data.iter().enumerate() {
            let pa = memory.get_phys(gpa + i as u64);
            assert!(!pa.is_null(), "vmm: write to unbacked guest page {:#x}", gpa + i as u64);
            unsafe { core::ptr::write_volatile(pa.to_virt().as_mut_ptr::<u8>(), byte) };
        }
    }

    /// Claim one I/O port for `device`. Last registration wins; at most
    /// one driver serves a port.
    pub fn register_pio(&self, ports: &[u16], device: Arc<dyn PioDevice>) {
        let mut tables = self.shared.tables.lock();
        for &port in ports {
            tables.pio[port as usize] = Some(device.clone());
        }
    }

    pub fn register_mmio(&self, base: u64, len: u64, device: Arc<dyn MmioDevice>) {
        self.shared
            .tables
            .lock()
            .mmio
            .insert(base, MmioRange { device, len });
    }

    /// Drop a region (devices move their BARs by deregistering and
    /// re-registering).
    pub fn unregister_mmio(&self, base: u64) {
        self.shared.tables.lock().mmio.remove(&base);
    }

    pub fn register_pci(&self, id: DeviceId, device: Arc<dyn PciDevice>) {
        self.shared.tables.lock().bridge.insert(id.raw(), device);
    }

    pub fn register_irq_listener(&self, listener: Arc<dyn IrqListener>) {
        self.shared.tables.lock().irq_listeners.push(listener);
    }

    /// Build the vCPU for `index`. One owning kernel thread per vCPU.
    pub fn create_vcpu(&self, index: usize) -> VCpu {
        let backend: alloc::boxed::Box<dyn VcpuBackend> = {
            let memory = self.shared.memory.lock();
            match &*memory {
                GuestMemory::Ept(ctx) => alloc::boxed::Box::new(vmx::VmxVcpu::new(
                    ept::eptp_for(ctx.root_pa(), ctx.levels()),
                )),
                GuestMemory::Npt(ctx) => {
                    alloc::boxed::Box::new(svm::SvmVcpu::new(ctx.root_pa(), ctx.asid()))
                }
            }
        };

        log::info!("vmm: vCPU {} created", index);
        VCpu {
            shared: self.shared.clone(),
            regs: RegisterState::reset(),
            backend,
            index,
        }
    }
}

impl RegisterState {
    /// Post-RESET x86 state: real mode at F000:FFF0.
    pub fn reset() -> Self {
        let mut regs = Self::default();
        regs.rflags = 0x2;
        regs.rip = 0xFFF0;
        regs.cs = Segment {
            selector: 0xF000,
            base: 0xF_0000,
            limit: 0xFFFF,
            attrib: 0x9B,
        };
        let data = Segment {
            selector: 0,
            base: 0,
            limit: 0xFFFF,
            attrib: 0x93,
        };
        regs.ds = data;
        regs.es = data;
        regs.ss = data;
        regs.fs = data;
        regs.gs = data;
        regs.cr0 = 0x6000_0010;
        regs
    }
}

pub struct VCpu {
    shared: Arc<VmShared>,
    pub regs: RegisterState,
    backend: alloc::boxed::Box<dyn VcpuBackend>,
    index: usize,
}

impl VCpu {
    /// The vCPU main loop. Returns only when the guest is done for.
    pub fn run(&mut self) -> Result<(), VmError> {
        loop {
            self.inject_pending_irq();

            let exit = {
                let cpu = crate::per_cpu::get_cpu();
                let simd = unsafe { &mut *cpu.simd_scratch.get() };
                simd.save();
                let exit = self.backend.run(&mut self.regs);
                simd.restore();
                exit
            };

            match exit {
                VmExit::Pio { port, size, write } => self.handle_pio(port, size, write),
                VmExit::Mmio { gpa } => self.handle_mmio(gpa)?,
                VmExit::Cpuid => self.handle_cpuid(),
                VmExit::Msr { write } => self.handle_msr(write),
                VmExit::Hlt => self.handle_hlt(),
                VmExit::Interrupted => {
                    // Let the scheduler breathe before re-entering.
                    crate::task::yield_now();
                }
                VmExit::Shutdown => {
                    log::warn!("vmm: vCPU {} shutdown (triple fault?)", self.index);
                    return Err(VmError::Shutdown);
                }
                VmExit::Unknown(reason) => {
                    log::error!("vmm: vCPU {} unhandled exit {:#x}", self.index, reason);
                    return Err(VmError::BadGuestState);
                }
            }
        }
    }

    fn inject_pending_irq(&mut self) {
        if self.regs.rflags & 0x200 == 0 {
            // Guest has interrupts off; try again next entry.
            return;
        }

        let vector = {
            let tables = self.shared.tables.lock();
            tables
                .irq_listeners
                .iter()
                .find(|l| l.read_irq_pin())
                .map(|l| l.read_irq_vector())
        };

        if let Some(vector) = vector {
            self.backend.inject_interrupt(vector);
        }
    }

    fn handle_pio(&mut self, port: u16, size: u8, write: bool) {
        let device = self.shared.tables.lock().pio[port as usize].clone();
        let mask = match size {
            1 => 0xFF,
            2 => 0xFFFF,
            _ => 0xFFFF_FFFF,
        };

        match device {
            Some(device) => {
                if write {
                    device.pio_write(port, (self.regs.rax & mask) as u32, size);
                } else {
                    let value = device.pio_read(port, size) as u64;
                    self.regs.rax = (self.regs.rax & !mask) | (value & mask);
                }
            }
            None => {
                if write {
                    log::debug!(
                        "vmm: unhandled PIO write to {:#x}, size {}, value {:#x}",
                        port,
                        size,
                        self.regs.rax & mask
                    );
                } else {
                    log::debug!("vmm: unhandled PIO read from {:#x}, size {}", port, size);
                    self.regs.rax &= !mask;
                }
            }
        }

        self.regs.rip += self.backend.exit_instruction_len();
    }

    fn handle_mmio(&mut self, gpa: u64) -> Result<(), VmError> {
        let region = self.shared.tables.lock().mmio_lookup(gpa);
        let Some((base, len, device)) = region else {
            log::error!(
                "vmm: vCPU {} EPT/NPT fault on unbacked guest address {:#x}",
                self.index,
                gpa
            );
            return Err(VmError::BadGuestState);
        };

        // Hardware decode info is not sufficient for MMIO operands in
        // general; fetch the faulting instruction and emulate it.
        let mut instruction = [0u8; MAX_INSTRUCTION_SIZE];
        self.fetch_instruction(&mut instruction)?;

        let env = RamEnv {
            shared: &self.shared,
            cr0: self.regs.cr0,
            cr3: self.regs.cr3,
            efer: self.regs.efer,
        };

        emulate::emulate_instruction(
            &mut self.regs,
            &instruction,
            gpa,
            (base, len),
            &*device,
            &env,
        )
        .map_err(|err| {
            if cfg!(debug_assertions) {
                panic!("vmm: emulator rejected instruction: {:?}", err);
            }
            log::error!("vmm: emulator rejected instruction: {:?}", err);
            VmError::UnsupportedInstruction
        })
    }

    /// Translate the guest's RIP and copy out up to 15 bytes. Guest
    /// paging is honored when CR0.PG is on; otherwise the fetch is
    /// physical at cs.base + rip. A fetch that runs off mapped memory is
    /// truncated (the real instruction may be shorter); only an
    /// unmappable first byte is an error.
    fn fetch_instruction(&self, buf: &mut [u8; MAX_INSTRUCTION_SIZE]) -> Result<(), VmError> {
        let va = self.regs.cs.base + self.regs.rip;
        let memory = self.shared.memory.lock();

        for (i, slot) in buf.iter_mut().enumerate() {
            let translated = translate_guest(
                &memory,
                self.regs.cr0,
                self.regs.cr3,
                self.regs.efer,
                va + i as u64,
            )
            .map(|gpa| memory.get_phys(gpa))
            .filter(|pa| !pa.is_null());

            match translated {
                Some(pa) => {
                    *slot = unsafe { core::ptr::read_volatile(pa.to_virt().as_ptr::<u8>()) }
                }
                None if i == 0 => return Err(VmError::BadGuestState),
                None => break,
            }
        }

        Ok(())
    }

    fn handle_cpuid(&mut self) {
        let leaf = self.regs.rax as u32;
        let result = unsafe { core::arch::x86_64::__cpuid_count(leaf, self.regs.rcx as u32) };

        let (mut a, mut b, mut c, d) = (result.eax, result.ebx, result.ecx, result.edx);
        match leaf {
            1 => {
                // Hide VMX/SVM from the guest, advertise a hypervisor.
                c &= !(1 << 5);
                c |= 1 << 31;
            }
            0x4000_0000 => {
                a = 0x4000_0000;
                b = u32::from_le_bytes(*b"luna");
                c = u32::from_le_bytes(*b"luna");
            }
            0x8000_0001 => {
                c &= !(1 << 2); // No nested SVM either.
            }
            _ => {}
        }

        self.regs.rax = a as u64;
        self.regs.rbx = b as u64;
        self.regs.rcx = c as u64;
        self.regs.rdx = d as u64;
        self.regs.rip += self.backend.exit_instruction_len();
    }

    fn handle_msr(&mut self, write: bool) {
        const MSR_EFER: u32 = 0xC000_0080;
        const MSR_APIC_BASE: u32 = 0x1B;

        let msr = self.regs.rcx as u32;
        if write {
            let value = (self.regs.rdx << 32) | (self.regs.rax & 0xFFFF_FFFF);
            match msr {
                MSR_EFER => self.regs.efer = value,
                _ => log::debug!("vmm: ignored WRMSR {:#x} = {:#x}", msr, value),
            }
        } else {
            let value = match msr {
                MSR_EFER => self.regs.efer,
                MSR_APIC_BASE => 0xFEE0_0900,
                _ => {
                    log::debug!("vmm: RDMSR of unknown {:#x} reads 0", msr);
                    0
                }
            };
            self.regs.rax = value & 0xFFFF_FFFF;
            self.regs.rdx = value >> 32;
        }

        self.regs.rip += self.backend.exit_instruction_len();
    }

    fn handle_hlt(&mut self) {
        self.regs.rip += self.backend.exit_instruction_len();

        // Cooperative idle: let other threads run until an interrupt
        // source raises its pin.
        loop {
            let pending = {
                let tables = self.shared.tables.lock();
                tables.irq_listeners.iter().any(|l| l.read_irq_pin())
            };
            if pending {
                break;
            }
            crate::task::yield_now();
        }
    }
}

/// Guest-virtual to guest-physical through the guest's own tables.
///
/// Long-mode 4-level paging is walked for real, huge pages included.
/// With paging off the address is already physical; legacy 32-bit
/// paging guests get flat treatment of the 4 GiB they can address.
fn translate_guest(memory: &GuestMemory, cr0: u64, cr3: u64, efer: u64, va: u64) -> Option<u64> {
    const CR0_PG: u64 = 1 << 31;
    const EFER_LME: u64 = 1 << 8;
    const ENTRY_FRAME_MASK: u64 = 0x000F_FFFF_FFFF_F000;

    if cr0 & CR0_PG == 0 {
        return Some(va);
    }
    if efer & EFER_LME == 0 {
        return Some(va & 0xFFFF_FFFF);
    }

    let mut table = cr3 & !0xFFF;
    for level in (1..=4u64).rev() {
        let index = (va >> (9 * (level - 1) + 12)) & 0x1FF;
        let entry_pa = memory.get_phys(table + index * 8);
        if entry_pa.is_null() {
            return None;
        }

        let entry = unsafe { core::ptr::read_volatile(entry_pa.to_virt().as_ptr::<u64>()) };
        if entry & 1 == 0 {
            return None;
        }

        if level > 1 && entry & (1 << 7) != 0 {
            let page_shift = 9 * (level - 1) + 12;
            let frame = entry & ENTRY_FRAME_MASK & !((1 << page_shift) - 1);
            return Some(frame | (va & ((1 << page_shift) - 1)));
        }

        table = entry & ENTRY_FRAME_MASK;
    }

    Some(table | (va & 0xFFF))
}

/// Guest-RAM access for the emulator's string operations.
struct RamEnv<'a> {
    shared: &'a Arc<VmShared>,
    cr0: u64,
    cr3: u64,
    efer: u64,
}

impl emulate::EmulateEnv for RamEnv<'_> {
    fn translate(&self, va: u64) -> Option<u64> {
        let memory = self.shared.memory.lock();
        translate_guest(&memory, self.cr0, self.cr3, self.efer, va)
    }

    fn read_ram(&self, gpa: u64, buf: &mut [u8]) -> Result<(), emulate::EmulateError> {
        let memory = self.shared.memory.lock();
        for (i, slot) in buf.iter_mut().enumerate() {
            let pa = memory.get_phys(gpa + i as u64);
            if pa.is_null() {
                return Err(emulate::EmulateError::BadAddress);
            }
            *slot = unsafe { core::ptr::read_volatile(pa.to_virt().as_ptr::<u8>()) };
        }
        Ok(())
    }

    fn write_ram(&self, gpa: u64, data: &[u8]) -> Result<(), emulate::EmulateError> {
        let memory = self.shared.memory.lock();
        for (i, &byte) in data.iter().enumerate() {
            let pa = memory.get_phys(gpa + i as u64);
            if pa.is_null() {
                return Err(emulate::EmulateError::BadAddress);
            }
            unsafe { core::ptr::write_volatile(pa.to_virt().as_mut_ptr::<u8>(), byte) };
        }
        Ok(())
    }
}
