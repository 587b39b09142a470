//! Intel VT-x vCPU backend.
//!
//! One VMCS per vCPU; guest GPRs live in a plain struct shuttled by the
//! entry/exit assembly, everything else goes through vmread/vmwrite. No
//! I/O or MSR bitmaps are installed, so every port and MSR access exits,
//! which is exactly what the dispatch fabric wants.

use core::arch::global_asm;
use core::sync::atomic::{AtomicBool, Ordering};

use x86_64::registers::model_specific::Msr;

use crate::memory::{pmm, PhysAddr, PAGE_SIZE};

use super::{RegisterState, Segment, VcpuBackend, VmExit};

const IA32_FEATURE_CONTROL: u32 = 0x3A;
const IA32_VMX_BASIC: u32 = 0x480;
const IA32_VMX_PINBASED_CTLS: u32 = 0x481;
const IA32_VMX_PROCBASED_CTLS: u32 = 0x482;
const IA32_VMX_EXIT_CTLS: u32 = 0x483;
const IA32_VMX_ENTRY_CTLS: u32 = 0x484;
const IA32_VMX_PROCBASED_CTLS2: u32 = 0x48B;
const IA32_VMX_EPT_VPID_CAP: u32 = 0x48C;

// VMCS field encodings, the subset this backend touches.
const VMCS_EPT_POINTER: u64 = 0x201A;
const VMCS_GUEST_PHYSICAL_ADDRESS: u64 = 0x2400;
const VMCS_GUEST_EFER: u64 = 0x2806;
const VMCS_PIN_BASED_CONTROLS: u64 = 0x4000;
const VMCS_PROC_BASED_CONTROLS: u64 = 0x4002;
const VMCS_EXIT_CONTROLS: u64 = 0x400C;
const VMCS_ENTRY_CONTROLS: u64 = 0x4012;
const VMCS_ENTRY_INTR_INFO: u64 = 0x4016;
const VMCS_PROC_BASED_CONTROLS2: u64 = 0x401E;
const VMCS_INSTRUCTION_ERROR: u64 = 0x4400;
const VMCS_EXIT_REASON: u64 = 0x4402;
const VMCS_EXIT_INSTRUCTION_LEN: u64 = 0x440C;
const VMCS_GUEST_CR0: u64 = 0x6800;
const VMCS_GUEST_CR3: u64 = 0x6802;
const VMCS_GUEST_CR4: u64 = 0x6804;
const VMCS_GUEST_RSP: u64 = 0x681C;
const VMCS_GUEST_RIP: u64 = 0x681E;
const VMCS_GUEST_RFLAGS: u64 = 0x6820;
const VMCS_EXIT_QUALIFICATION: u64 = 0x6400;
const VMCS_HOST_CR0: u64 = 0x6C00;
const VMCS_HOST_CR3: u64 = 0x6C02;
const VMCS_HOST_CR4: u64 = 0x6C04;
const VMCS_HOST_RSP: u64 = 0x6C14;
const VMCS_HOST_RIP: u64 = 0x6C16;
const VMCS_HOST_CS_SELECTOR: u64 = 0x0C02;
const VMCS_HOST_SS_SELECTOR: u64 = 0x0C04;
const VMCS_HOST_DS_SELECTOR: u64 = 0x0C06;
const VMCS_HOST_ES_SELECTOR: u64 = 0x0C00;
const VMCS_HOST_FS_SELECTOR: u64 = 0x0C08;
const VMCS_HOST_GS_SELECTOR: u64 = 0x0C0A;
const VMCS_HOST_TR_SELECTOR: u64 = 0x0C0C;
const VMCS_HOST_FS_BASE: u64 = 0x6C06;
const VMCS_HOST_GS_BASE: u64 = 0x6C08;
const VMCS_HOST_TR_BASE: u64 = 0x6C0A;
const VMCS_HOST_GDTR_BASE: u64 = 0x6C0C;
const VMCS_HOST_IDTR_BASE: u64 = 0x6C0E;

// Guest segment encodings: selector, base, limit, access rights; ES is
// the base of each block and the others follow in steps of 2.
const VMCS_GUEST_ES_SELECTOR: u64 = 0x0800;
const VMCS_GUEST_ES_BASE: u64 = 0x6806;
const VMCS_GUEST_ES_LIMIT: u64 = 0x4800;
const VMCS_GUEST_ES_AR: u64 = 0x4814;

const EXIT_REASON_EXTERNAL_INTERRUPT: u64 = 1;
const EXIT_REASON_TRIPLE_FAULT: u64 = 2;
const EXIT_REASON_CPUID: u64 = 10;
const EXIT_REASON_HLT: u64 = 12;
const EXIT_REASON_IO: u64 = 30;
const EXIT_REASON_RDMSR: u64 = 31;
const EXIT_REASON_WRMSR: u64 = 32;
const EXIT_REASON_EPT_VIOLATION: u64 = 48;

static VMX_READY: AtomicBool = AtomicBool::new(false);

fn vmread(field: u64) -> u64 {
    let value: u64;
    unsafe {
        core::arch::asm!("vmread {}, {}", out(reg) value, in(reg) field, options(nostack));
    }
    value
}

fn vmwrite(field: u64, value: u64) {
    unsafe {
        core::arch::asm!("vmwrite {}, {}", in(reg) field, in(reg) value, options(nostack));
    }
}

fn alloc_vmx_frame() -> PhysAddr {
    let pa = pmm::alloc_block().expect("vmx: out of frames for VMX structures");
    unsafe {
        core::ptr::write_bytes(pa.to_virt().as_mut_ptr::<u8>(), 0, PAGE_SIZE as usize);
        // Both VMXON regions and VMCSs start with the revision identifier.
        let revision = Msr::new(IA32_VMX_BASIC).read() as u32 & 0x7FFF_FFFF;
        core::ptr::write_volatile(pa.to_virt().as_mut_ptr::<u32>(), revision);
    }
    pa
}

/// Adjust a control word by the allowed-0/allowed-1 MSR for its field.
fn adjust_controls(msr: u32, desired: u32) -> u32 {
    let caps = unsafe { Msr::new(msr).read() };
    let allowed0 = caps as u32;
    let allowed1 = (caps >> 32) as u32;
    (desired | allowed0) & allowed1
}

/// Enter VMX root operation on this CPU. Idempotent per host.
pub fn init() {
    if VMX_READY.swap(true, Ordering::SeqCst) {
        return;
    }

    let leaf1 = unsafe { core::arch::x86_64::__cpuid(1) };
    assert!(leaf1.ecx & (1 << 5) != 0, "vmx: CPU has no VMX");

    unsafe {
        // Lock bit + VMXON-outside-SMX enable, if the firmware left it open.
        let mut feature_control = Msr::new(IA32_FEATURE_CONTROL);
        let value = feature_control.read();
        if value & 1 == 0 {
            feature_control.write(value | 0b101);
        } else {
            assert!(value & 0b100 != 0, "vmx: disabled by firmware");
        }

        use x86_64::registers::control::{Cr4, Cr4Flags};
        Cr4::update(|cr4| cr4.insert(Cr4Flags::VIRTUAL_MACHINE_EXTENSIONS));
    }

    // Single-context INVEPT is a prerequisite for the EPT engine's
    // invalidation strategy.
    let ept_caps = unsafe { Msr::new(IA32_VMX_EPT_VPID_CAP).read() };
    assert!(ept_caps & (1 << 25) != 0, "vmx: no single-context INVEPT");

    let vmxon = alloc_vmx_frame();
    let pa = vmxon.as_u64();
    unsafe {
        core::arch::asm!("vmxon [{}]", in(reg) &pa, options(nostack));
    }

    log::info!("vmx: VMX root operation entered");
}

/// Guest GPRs the hardware does not context-switch. THIS STRUCT IS
/// ACCESSED FROM ASSEMBLY; field order is load-bearing.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
struct GuestRegs {
    rax: u64,
    rbx: u64,
    rcx: u64,
    rdx: u64,
    rsi: u64,
    rdi: u64,
    rbp: u64,
    r8: u64,
    r9: u64,
    r10: u64,
    r11: u64,
    r12: u64,
    r13: u64,
    r14: u64,
    r15: u64,
}

global_asm!(
    r#"
.global vmx_enter
.global vmx_exit_stub

// vmx_enter(guest_regs: *mut GuestRegs [rdi], launched: u64 [rsi]) -> u64
// Returns 0 on a clean exit, 1 when the entry itself failed.
vmx_enter:
    push rbx
    push rbp
    push r12
    push r13
    push r14
    push r15
    push rdi                    // guest regs pointer for the exit stub

    mov rdx, 0x6C14             // HOST_RSP
    vmwrite rdx, rsp

    mov rax, rdi
    mov rbx, [rax + 0x08]
    mov rcx, [rax + 0x10]
    mov rdx, [rax + 0x18]
    mov rbp, [rax + 0x30]
    mov r8,  [rax + 0x38]
    mov r9,  [rax + 0x40]
    mov r10, [rax + 0x48]
    mov r11, [rax + 0x50]
    mov r12, [rax + 0x58]
    mov r13, [rax + 0x60]
    mov r14, [rax + 0x68]
    mov r15, [rax + 0x70]
    mov rdi, [rax + 0x28]
    // Branch on the launched flag while it is still in rsi; plain moves
    // leave the flags alone.
    test rsi, rsi
    mov rsi, [rax + 0x20]
    mov rax, [rax + 0x00]
    jnz 2f
    vmlaunch
    jmp 3f
2:
    vmresume
3:
    // Reached only if the entry itself failed.
    pop rdi
    pop r15
    pop r14
    pop r13
    pop r12
    pop rbp
    pop rbx
    mov rax, 1
    ret

// VM-exit lands here (HOST_RIP). Stack top is the guest regs pointer.
vmx_exit_stub:
    xchg rax, [rsp]             // rax = pointer, guest rax parked
    mov [rax + 0x08], rbx
    mov [rax + 0x10], rcx
    mov [rax + 0x18], rdx
    mov [rax + 0x20], rsi
    mov [rax + 0x28], rdi
    mov [rax + 0x30], rbp
    mov [rax + 0x38], r8
    mov [rax + 0x40], r9
    mov [rax + 0x48], r10
    mov [rax + 0x50], r11
    mov [rax + 0x58], r12
    mov [rax + 0x60], r13
    mov [rax + 0x68], r14
    mov [rax + 0x70], r15
    pop rbx                     // parked guest rax
    mov [rax + 0x00], rbx
    pop r15
    pop r14
    pop r13
    pop r12
    pop rbp
    pop rbx
    xor rax, rax
    ret
"#
);

extern "C" {
    fn vmx_enter(guest_regs: *mut GuestRegs, launched: u64) -> u64;
    fn vmx_exit_stub();
}

pub struct VmxVcpu {
    vmcs: PhysAddr,
    launched: bool,
    guest_regs: GuestRegs,
    pending_injection: Option<u8>,
    exit_instruction_len: u64,
}

impl VmxVcpu {
    pub fn new(eptp: u64) -> Self {
        init();

        let vmcs = alloc_vmx_frame();
        let pa = vmcs.as_u64();
        unsafe {
            core::arch::asm!("vmclear [{}]", in(reg) &pa, options(nostack));
            core::arch::asm!("vmptrld [{}]", in(reg) &pa, options(nostack));
        }

        let vcpu = Self {
            vmcs,
            launched: false,
            guest_regs: GuestRegs::default(),
            pending_injection: None,
            exit_instruction_len: 0,
        };
        vcpu.setup_controls(eptp);
        vcpu.setup_host_state();
        vcpu
    }

    fn setup_controls(&self, eptp: u64) {
        // Pin: exit on external interrupts so the host keeps breathing.
        vmwrite(
            VMCS_PIN_BASED_CONTROLS,
            adjust_controls(IA32_VMX_PINBASED_CTLS, 1 << 0) as u64,
        );

        // Proc: HLT exiting, unconditional I/O exiting, secondary controls.
        vmwrite(
            VMCS_PROC_BASED_CONTROLS,
            adjust_controls(IA32_VMX_PROCBASED_CTLS, (1 << 7) | (1 << 24) | (1 << 31)) as u64,
        );

        // Proc2: EPT + unrestricted guest (real-mode boot flows).
        vmwrite(
            VMCS_PROC_BASED_CONTROLS2,
            adjust_controls(IA32_VMX_PROCBASED_CTLS2, (1 << 1) | (1 << 7)) as u64,
        );

        // Exit to a 64-bit host, acknowledge interrupts on exit, and
        // swap EFER both ways so the guest field is honored.
        vmwrite(
            VMCS_EXIT_CONTROLS,
            adjust_controls(IA32_VMX_EXIT_CTLS, (1 << 9) | (1 << 15) | (1 << 20) | (1 << 21))
                as u64,
        );

        vmwrite(
            VMCS_ENTRY_CONTROLS,
            adjust_controls(IA32_VMX_ENTRY_CTLS, 1 << 15) as u64,
        );

        vmwrite(VMCS_EPT_POINTER, eptp);
    }

    fn setup_host_state(&self) {
        use x86_64::instructions::tables::{sgdt, sidt};
        use x86_64::registers::control::{Cr0, Cr3, Cr4};
        use x86_64::registers::model_specific::{FsBase, GsBase};
        use x86_64::registers::segmentation::{Segment as _, CS, DS, ES, FS, GS, SS};

        vmwrite(VMCS_HOST_CR0, Cr0::read_raw());
        vmwrite(VMCS_HOST_CR3, Cr3::read_raw().0.start_address().as_u64());
        vmwrite(VMCS_HOST_CR4, Cr4::read_raw());

        vmwrite(VMCS_HOST_CS_SELECTOR, CS::get_reg().0 as u64);
        vmwrite(VMCS_HOST_SS_SELECTOR, SS::get_reg().0 as u64);
        vmwrite(VMCS_HOST_DS_SELECTOR, DS::get_reg().0 as u64);
        vmwrite(VMCS_HOST_ES_SELECTOR, ES::get_reg().0 as u64);
        vmwrite(VMCS_HOST_FS_SELECTOR, FS::get_reg().0 as u64);
        vmwrite(VMCS_HOST_GS_SELECTOR, GS::get_reg().0 as u64);
        // Host TR: reuse the per-CPU TSS selector loaded at GDT init.
        vmwrite(VMCS_HOST_TR_SELECTOR, {
            let tr: u16;
            unsafe { core::arch::asm!("str {0:x}", out(reg) tr, options(nostack, nomem)) };
            tr as u64
        });

        vmwrite(VMCS_HOST_FS_BASE, FsBase::read().as_u64());
        vmwrite(VMCS_HOST_GS_BASE, GsBase::read().as_u64());
        vmwrite(VMCS_HOST_TR_BASE, 0);
        vmwrite(VMCS_HOST_GDTR_BASE, sgdt().base.as_u64());
        vmwrite(VMCS_HOST_IDTR_BASE, sidt().base.as_u64());

        vmwrite(VMCS_HOST_RIP, vmx_exit_stub as usize as u64);
    }

    fn segment_fields(index: u64) -> (u64, u64, u64, u64) {
        (
            VMCS_GUEST_ES_SELECTOR + index * 2,
            VMCS_GUEST_ES_BASE + index * 2,
            VMCS_GUEST_ES_LIMIT + index * 2,
            VMCS_GUEST_ES_AR + index * 2,
        )
    }

    fn write_segment(index: u64, segment: &Segment) {
        let (sel, base, limit, ar) = Self::segment_fields(index);
        vmwrite(sel, segment.selector as u64);
        vmwrite(base, segment.base);
        vmwrite(limit, segment.limit as u64);
        vmwrite(ar, segment.attrib as u64);
    }

    fn read_segment(index: u64) -> Segment {
        let (sel, base, limit, ar) = Self::segment_fields(index);
        Segment {
            selector: vmread(sel) as u16,
            base: vmread(base),
            limit: vmread(limit) as u32,
            attrib: vmread(ar) as u16,
        }
    }

    fn load_guest_state(&mut self, regs: &RegisterState) {
        let pa = self.vmcs.as_u64();
        unsafe {
            core::arch::asm!("vmptrld [{}]", in(reg) &pa, options(nostack));
        }

        vmwrite(VMCS_GUEST_RIP, regs.rip);
        vmwrite(VMCS_GUEST_RSP, regs.rsp);
        vmwrite(VMCS_GUEST_RFLAGS, regs.rflags | 0x2);
        vmwrite(VMCS_GUEST_CR0, regs.cr0);
        vmwrite(VMCS_GUEST_CR3, regs.cr3);
        vmwrite(VMCS_GUEST_CR4, regs.cr4);
        vmwrite(VMCS_GUEST_EFER, regs.efer);

        // ES, CS, SS, DS, FS, GS in encoding order.
        Self::write_segment(0, &regs.es);
        Self::write_segment(1, &regs.cs);
        Self::write_segment(2, &regs.ss);
        Self::write_segment(3, &regs.ds);
        Self::write_segment(4, &regs.fs);
        Self::write_segment(5, &regs.gs);

        self.guest_regs = GuestRegs {
            rax: regs.rax,
            rbx: regs.rbx,
            rcx: regs.rcx,
            rdx: regs.rdx,
            rsi: regs.rsi,
            rdi: regs.rdi,
            rbp: regs.rbp,
            r8: regs.r8,
            r9: regs.r9,
            r10: regs.r10,
            r11: regs.r11,
            r12: regs.r12,
            r13: regs.r13,
            r14: regs.r14,
            r15: regs.r15,
        };

        if let Some(vector) = self.pending_injection.take() {
            // External interrupt, valid.
            vmwrite(VMCS_ENTRY_INTR_INFO, (1 << 31) | vector as u64);
        }
    }

    fn store_guest_state(&self, regs: &mut RegisterState) {
        regs.rax = self.guest_regs.rax;
        regs.rbx = self.guest_regs.rbx;
        regs.rcx = self.guest_regs.rcx;
        regs.rdx = self.guest_regs.rdx;
        regs.rsi = self.guest_regs.rsi;
        regs.rdi = self.guest_regs.rdi;
        regs.rbp = self.guest_regs.rbp;
        regs.r8 = self.guest_regs.r8;
        regs.r9 = self.guest_regs.r9;
        regs.r10 = self.guest_regs.r10;
        regs.r11 = self.guest_regs.r11;
        regs.r12 = self.guest_regs.r12;
        regs.r13 = self.guest_regs.r13;
        regs.r14 = self.guest_regs.r14;
        regs.r15 = self.guest_regs.r15;

        regs.rip = vmread(VMCS_GUEST_RIP);
        regs.rsp = vmread(VMCS_GUEST_RSP);
        regs.rflags = vmread(VMCS_GUEST_RFLAGS);
        regs.cr0 = vmread(VMCS_GUEST_CR0);
        regs.cr3 = vmread(VMCS_GUEST_CR3);
        regs.cr4 = vmread(VMCS_GUEST_CR4);
        regs.efer = vmread(VMCS_GUEST_EFER);

        regs.es = Self::read_segment(0);
        regs.cs = Self::read_segment(1);
        regs.ss = Self::read_segment(2);
        regs.ds = Self::read_segment(3);
        regs.fs = Self::read_segment(4);
        regs.gs = Self::read_segment(5);
    }
}

impl VcpuBackend for VmxVcpu {
    fn run(&mut self, regs: &mut RegisterState) -> VmExit {
        self.load_guest_state(regs);

        let failed = unsafe { vmx_enter(&mut self.guest_regs, self.launched as u64) };
        if failed != 0 {
            panic!(
                "vmx: VM entry failed, instruction error {}",
                vmread(VMCS_INSTRUCTION_ERROR)
            );
        }
        self.launched = true;

        self.store_guest_state(regs);
        self.exit_instruction_len = vmread(VMCS_EXIT_INSTRUCTION_LEN);

        let reason = vmread(VMCS_EXIT_REASON) & 0xFFFF;
        match reason {
            EXIT_REASON_EXTERNAL_INTERRUPT => {
                // Host interrupt while the guest ran; with acknowledge-
                // on-exit the host already took it. Just re-enter.
                VmExit::Interrupted
            }
            EXIT_REASON_TRIPLE_FAULT => VmExit::Shutdown,
            EXIT_REASON_CPUID => VmExit::Cpuid,
            EXIT_REASON_HLT => VmExit::Hlt,
            EXIT_REASON_IO => {
                let qualification = vmread(VMCS_EXIT_QUALIFICATION);
                let size = (qualification & 0b111) as u8 + 1;
                let write = qualification & (1 << 3) == 0;
                let port = (qualification >> 16) as u16;
                VmExit::Pio { port, size, write }
            }
            EXIT_REASON_RDMSR => VmExit::Msr { write: false },
            EXIT_REASON_WRMSR => VmExit::Msr { write: true },
            EXIT_REASON_EPT_VIOLATION => VmExit::Mmio {
                gpa: vmread(VMCS_GUEST_PHYSICAL_ADDRESS),
            },
            other => VmExit::Unknown(other),
        }
    }

    fn inject_interrupt(&mut self, vector: u8) {
        self.pending_injection = Some(vector);
    }

    fn exit_instruction_len(&self) -> u64 {
        self.exit_instruction_len
    }
}
