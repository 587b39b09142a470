//! AMD SVM vCPU backend.
//!
//! One VMCB per vCPU plus a second page for the host's vmsave state.
//! All-ones IOPM/MSRPM bitmaps make every port and MSR access exit, and
//! nested paging points at the VM's NPT context. Guest rAX and rSP live
//! in the VMCB save area; the remaining GPRs are shuttled by the entry
//! assembly.

use core::arch::global_asm;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use x86_64::registers::model_specific::Msr;

use crate::memory::{pmm, PhysAddr, PAGE_SIZE};

use super::{RegisterState, Segment, VcpuBackend, VmExit};

const MSR_EFER: u32 = 0xC000_0080;
const EFER_SVME: u64 = 1 << 12;
const MSR_VM_HSAVE_PA: u32 = 0xC001_0117;

// Intercept vector 3 bits.
const INTERCEPT_INTR: u32 = 1 << 0;
const INTERCEPT_CPUID: u32 = 1 << 18;
const INTERCEPT_HLT: u32 = 1 << 24;
const INTERCEPT_IOIO_PROT: u32 = 1 << 27;
const INTERCEPT_MSR_PROT: u32 = 1 << 28;
const INTERCEPT_SHUTDOWN: u32 = 1 << 31;

// Intercept vector 4 bits.
const INTERCEPT_VMRUN: u32 = 1 << 0;

const EXIT_INTR: u64 = 0x60;
const EXIT_CPUID: u64 = 0x72;
const EXIT_HLT: u64 = 0x78;
const EXIT_IOIO: u64 = 0x7B;
const EXIT_MSR: u64 = 0x7C;
const EXIT_SHUTDOWN: u64 = 0x7F;
const EXIT_NPF: u64 = 0x400;
const EXIT_INVALID: u64 = u64::MAX;

#[repr(C)]
struct ControlArea {
    intercept_cr: u32,
    intercept_dr: u32,
    intercept_exceptions: u32,
    intercept_misc1: u32,
    intercept_misc2: u32,
    intercept_misc3: u32,
    reserved_1: [u8; 0x3C - 0x18],
    pause_filter_threshold: u16,
    pause_filter_count: u16,
    iopm_base_pa: u64,
    msrpm_base_pa: u64,
    tsc_offset: u64,
    guest_asid: u32,
    tlb_control: u32,
    vintr: u64,
    interrupt_shadow: u64,
    exitcode: u64,
    exitinfo1: u64,
    exitinfo2: u64,
    exitintinfo: u64,
    np_enable: u64,
    avic_apic_bar: u64,
    guest_pa_ghcb: u64,
    event_injection: u64,
    n_cr3: u64,
    lbr_virt_enable: u64,
    vmcb_clean: u64,
    nrip: u64,
    guest_instruction_count: u8,
    guest_instruction_bytes: [u8; 15],
    reserved_2: [u8; 0x400 - 0xE0],
}

#[repr(C)]
#[derive(Clone, Copy, Default)]
struct SegmentSave {
    selector: u16,
    attrib: u16,
    limit: u32,
    base: u64,
}

#[repr(C)]
struct SaveArea {
    es: SegmentSave,
    cs: SegmentSave,
    ss: SegmentSave,
    ds: SegmentSave,
    fs: SegmentSave,
    gs: SegmentSave,
    gdtr: SegmentSave,
    ldtr: SegmentSave,
    idtr: SegmentSave,
    tr: SegmentSave,
    reserved_1: [u8; 0xCB - 0xA0],
    cpl: u8,
    reserved_2: u32,
    efer: u64,
    reserved_3: [u8; 0x148 - 0xD8],
    cr4: u64,
    cr3: u64,
    cr0: u64,
    dr7: u64,
    dr6: u64,
    rflags: u64,
    rip: u64,
    reserved_4: [u8; 0x1D8 - 0x180],
    rsp: u64,
    s_cet: u64,
    ssp: u64,
    isst_addr: u64,
    rax: u64,
    star: u64,
    lstar: u64,
    cstar: u64,
    sfmask: u64,
    kernel_gs_base: u64,
    sysenter_cs: u64,
    sysenter_esp: u64,
    sysenter_eip: u64,
    cr2: u64,
    reserved_5: [u8; 0x268 - 0x248],
    g_pat: u64,
}

#[repr(C)]
struct Vmcb {
    control: ControlArea,
    save: SaveArea,
}

const _: () = assert!(core::mem::size_of::<ControlArea>() == 0x400);

static SVM_READY: AtomicBool = AtomicBool::new(false);
static NEXT_ASID: AtomicU32 = AtomicU32::new(1);

/// ASIDs tag nested TLB entries; each VM gets its own.
pub fn allocate_asid() -> u32 {
    NEXT_ASID.fetch_add(1, Ordering::SeqCst)
}

fn alloc_zeroed_frames(n: usize) -> PhysAddr {
    let pa = pmm::alloc_n_blocks(n).expect("svm: out of frames for SVM structures");
    unsafe {
        core::ptr::write_bytes(pa.to_virt().as_mut_ptr::<u8>(), 0, n * PAGE_SIZE as usize);
    }
    pa
}

/// Enable SVM on this CPU and give vmrun its host save area.
pub fn init() {
    if SVM_READY.swap(true, Ordering::SeqCst) {
        return;
    }

    let ext = unsafe { core::arch::x86_64::__cpuid(0x8000_0001) };
    assert!(ext.ecx & (1 << 2) != 0, "svm: CPU has no SVM");

    unsafe {
        let mut efer = Msr::new(MSR_EFER);
        efer.write(efer.read() | EFER_SVME);

        let hsave = alloc_zeroed_frames(1);
        Msr::new(MSR_VM_HSAVE_PA).write(hsave.as_u64());
    }

    log::info!("svm: SVM enabled");
}

/// Guest GPRs not held in the VMCB. THIS STRUCT IS ACCESSED FROM
/// ASSEMBLY; field order is load-bearing.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
struct GuestRegs {
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
.global svm_run_asm

// svm_run_asm(guest_regs: *mut GuestRegs [rdi],
//             guest_vmcb_pa [rsi], host_vmcb_pa [rdx])
svm_run_asm:
    push rbx
    push rbp
    push r12
    push r13
    push r14
    push r15
    push rdi                    // [rsp+0x10] guest regs
    push rdx                    // [rsp+0x08] host vmcb
    push rsi                    // [rsp+0x00] guest vmcb

    clgi

    mov rax, rdx
    vmsave rax                  // park host fs/gs/tr/syscall state

    mov rax, rdi
    mov rbx, [rax + 0x00]
    mov rcx, [rax + 0x08]
    mov rdx, [rax + 0x10]
    mov rbp, [rax + 0x28]
    mov r8,  [rax + 0x30]
    mov r9,  [rax + 0x38]
    mov r10, [rax + 0x40]
    mov r11, [rax + 0x48]
    mov r12, [rax + 0x50]
    mov r13, [rax + 0x58]
    mov r14, [rax + 0x60]
    mov r15, [rax + 0x68]
    mov rsi, [rax + 0x18]
    mov rdi, [rax + 0x20]

    mov rax, [rsp]              // guest vmcb
    vmload rax
    vmrun rax
    vmsave rax

    // Store guest GPRs back; rax/rsp are in the VMCB save area.
    mov rax, [rsp + 0x10]
    mov [rax + 0x00], rbx
    mov [rax + 0x08], rcx
    mov [rax + 0x10], rdx
    mov [rax + 0x18], rsi
    mov [rax + 0x20], rdi
    mov [rax + 0x28], rbp
    mov [rax + 0x30], r8
    mov [rax + 0x38], r9
    mov [rax + 0x40], r10
    mov [rax + 0x48], r11
    mov [rax + 0x50], r12
    mov [rax + 0x58], r13
    mov [rax + 0x60], r14
    mov [rax + 0x68], r15

    mov rax, [rsp + 0x08]       // host vmcb
    vmload rax

    stgi

    add rsp, 0x18
    pop r15
    pop r14
    pop r13
    pop r12
    pop rbp
    pop rbx
    ret
"#
);

extern "C" {
    fn svm_run_asm(guest_regs: *mut GuestRegs, guest_vmcb_pa: u64, host_vmcb_pa: u64);
}

/// VMX-style 16-bit access rights to the VMCB's compressed 12-bit form.
fn attrib_to_svm(attrib: u16) -> u16 {
    (attrib & 0xFF) | ((attrib >> 4) & 0xF00)
}

fn attrib_from_svm(attrib: u16) -> u16 {
    (attrib & 0xFF) | ((attrib & 0xF00) << 4)
}

fn segment_to_svm(segment: &Segment) -> SegmentSave {
    SegmentSave {
        selector: segment.selector,
        attrib: attrib_to_svm(segment.attrib),
        limit: segment.limit,
        base: segment.base,
    }
}

fn segment_from_svm(segment: &SegmentSave) -> Segment {
    Segment {
        selector: segment.selector,
        base: segment.base,
        limit: segment.limit,
        attrib: attrib_from_svm(segment.attrib),
    }
}

pub struct SvmVcpu {
    vmcb: PhysAddr,
    host_vmcb: PhysAddr,
    guest_regs: GuestRegs,
    exit_instruction_len: u64,
}

impl SvmVcpu {
    pub fn new(npt_root: PhysAddr, asid: u32) -> Self {
        init();

        let vmcb_pa = alloc_zeroed_frames(1);
        let host_vmcb = alloc_zeroed_frames(1);
        // All-ones bitmaps: every port (12 KiB) and MSR (8 KiB) exits.
        let iopm = alloc_zeroed_frames(3);
        let msrpm = alloc_zeroed_frames(2);
        unsafe {
            core::ptr::write_bytes(iopm.to_virt().as_mut_ptr::<u8>(), 0xFF, 3 * PAGE_SIZE as usize);
            core::ptr::write_bytes(msrpm.to_virt().as_mut_ptr::<u8>(), 0xFF, 2 * PAGE_SIZE as usize);
        }

        let vcpu = Self {
            vmcb: vmcb_pa,
            host_vmcb,
            guest_regs: GuestRegs::default(),
            exit_instruction_len: 0,
        };

        let vmcb = vcpu.vmcb_mut();
        vmcb.control.intercept_misc1 = INTERCEPT_INTR
            | INTERCEPT_CPUID
            | INTERCEPT_HLT
            | INTERCEPT_IOIO_PROT
            | INTERCEPT_MSR_PROT
            | INTERCEPT_SHUTDOWN;
        vmcb.control.intercept_misc2 = INTERCEPT_VMRUN;
        vmcb.control.iopm_base_pa = iopm.as_u64();
        vmcb.control.msrpm_base_pa = msrpm.as_u64();
        vmcb.control.guest_asid = asid;
        vmcb.control.np_enable = 1;
        vmcb.control.n_cr3 = npt_root.as_u64();
        // Default PAT until the guest writes its own.
        vmcb.save.g_pat = 0x0007_0406_0007_0406;

        vcpu
    }

    #[allow(clippy::mut_from_ref)]
    fn vmcb_mut(&self) -> &'static mut Vmcb {
        unsafe { &mut *self.vmcb.to_virt().as_mut_ptr::<Vmcb>() }
    }

    fn load_guest_state(&mut self, regs: &RegisterState) {
        let vmcb = self.vmcb_mut();

        vmcb.save.rip = regs.rip;
        vmcb.save.rsp = regs.rsp;
        vmcb.save.rax = regs.rax;
        vmcb.save.rflags = regs.rflags | 0x2;
        vmcb.save.cr0 = regs.cr0;
        vmcb.save.cr3 = regs.cr3;
        vmcb.save.cr4 = regs.cr4;
        vmcb.save.efer = regs.efer | EFER_SVME;

        vmcb.save.es = segment_to_svm(&regs.es);
        vmcb.save.cs = segment_to_svm(&regs.cs);
        vmcb.save.ss = segment_to_svm(&regs.ss);
        vmcb.save.ds = segment_to_svm(&regs.ds);
        vmcb.save.fs = segment_to_svm(&regs.fs);
        vmcb.save.gs = segment_to_svm(&regs.gs);

        self.guest_regs = GuestRegs {
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
    }

    fn store_guest_state(&self, regs: &mut RegisterState) {
        let vmcb = self.vmcb_mut();

        regs.rip = vmcb.save.rip;
        regs.rsp = vmcb.save.rsp;
        regs.rax = vmcb.save.rax;
        regs.rflags = vmcb.save.rflags;
        regs.cr0 = vmcb.save.cr0;
        regs.cr3 = vmcb.save.cr3;
        regs.cr4 = vmcb.save.cr4;
        regs.efer = vmcb.save.efer & !EFER_SVME;

        regs.es = segment_from_svm(&vmcb.save.es);
        regs.cs = segment_from_svm(&vmcb.save.cs);
        regs.ss = segment_from_svm(&vmcb.save.ss);
        regs.ds = segment_from_svm(&vmcb.save.ds);
        regs.fs = segment_from_svm(&vmcb.save.fs);
        regs.gs = segment_from_svm(&vmcb.save.gs);

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
    }
}

impl VcpuBackend for SvmVcpu {
    fn run(&mut self, regs: &mut RegisterState) -> VmExit {
        self.load_guest_state(regs);

        unsafe {
            svm_run_asm(
                &mut self.guest_regs,
                self.vmcb.as_u64(),
                self.host_vmcb.as_u64(),
            );
        }

        self.store_guest_state(regs);

        let vmcb = self.vmcb_mut();
        // nRIP is valid for the intercepts this backend arms.
        self.exit_instruction_len = vmcb.control.nrip.saturating_sub(vmcb.save.rip);

        match vmcb.control.exitcode {
            EXIT_INVALID => panic!("svm: invalid guest state in VMCB"),
            EXIT_INTR => {
                // Host interrupt; it was handled after stgi. Re-enter.
                VmExit::Interrupted
            }
            EXIT_CPUID => VmExit::Cpuid,
            EXIT_HLT => VmExit::Hlt,
            EXIT_IOIO => {
                let info = vmcb.control.exitinfo1;
                let size = if info & (1 << 4) != 0 {
                    1
                } else if info & (1 << 5) != 0 {
                    2
                } else {
                    4
                };
                VmExit::Pio {
                    port: (info >> 16) as u16,
                    size,
                    write: info & 1 == 0,
                }
            }
            EXIT_MSR => VmExit::Msr {
                write: vmcb.control.exitinfo1 == 1,
            },
            EXIT_SHUTDOWN => VmExit::Shutdown,
            EXIT_NPF => VmExit::Mmio {
                gpa: vmcb.control.exitinfo2,
            },
            other => VmExit::Unknown(other),
        }
    }

    fn inject_interrupt(&mut self, vector: u8) {
        // External interrupt, valid bit set.
        self.vmcb_mut().control.event_injection = vector as u64 | (1 << 31);
    }

    fn exit_instruction_len(&self) -> u64 {
        self.exit_instruction_len
    }
}
