//! IDT and interrupt dispatch.
//!
//! Every vector from 32 up funnels through a generated stub into a side
//! table of handler records `{function, userptr, is_reserved, is_irq,
//! should_iret}`. Drivers allocate vectors out of the reserved-bit pool
//! and install their record; the common prologue copies the record out
//! under its lock, calls the function, and EOIs IRQ vectors. CPU
//! exceptions keep dedicated handlers that panic with the architectural
//! mnemonic.
//!
//! The legacy PICs are remapped away from the exception range and masked;
//! the IOAPIC does all routing.

use pic8259::ChainedPics;
use spin::Once;
use x86_64::structures::idt::{InterruptDescriptorTable, InterruptStackFrame, PageFaultErrorCode};

use crate::sync::IrqTicketLock;

pub const PIC_1_OFFSET: u8 = 32;
pub const PIC_2_OFFSET: u8 = PIC_1_OFFSET + 8;

/// First vector the allocator may hand out; everything below is CPU
/// exceptions.
const FIRST_ALLOCATABLE_VECTOR: usize = 32;

pub static PICS: spin::Mutex<ChainedPics> =
    spin::Mutex::new(unsafe { ChainedPics::new(PIC_1_OFFSET, PIC_2_OFFSET) });

pub type IrqHandlerFn = fn(vector: u8, frame: &mut InterruptStackFrame, userptr: *mut ());

/// One dispatch record. `is_reserved` doubles as the vector-pool bit.
#[derive(Clone, Copy)]
pub struct Handler {
    pub func: Option<IrqHandlerFn>,
    pub userptr: *mut (),
    pub is_reserved: bool,
    pub is_irq: bool,
    /// When set, the common prologue returns straight to `iretq` without
    /// touching deferred scheduler work.
    pub should_iret: bool,
}

unsafe impl Send for Handler {}

impl Handler {
    pub const fn empty() -> Self {
        Self {
            func: None,
            userptr: core::ptr::null_mut(),
            is_reserved: false,
            is_irq: false,
            should_iret: false,
        }
    }
}

static HANDLERS: [IrqTicketLock<Handler>; 256] =
    [const { IrqTicketLock::new(Handler::empty()) }; 256];

static IDT: Once<InterruptDescriptorTable> = Once::new();

fn common_isr(vector: u8, frame: &mut InterruptStackFrame) {
    let record = *HANDLERS[vector as usize].lock();

    match record.func {
        Some(func) => func(vector, frame, record.userptr),
        None => log::warn!("interrupts: unhandled vector {}", vector),
    }

    if record.is_irq {
        crate::per_cpu::get_cpu().lapic.eoi();
    }
}

macro_rules! irq_stubs {
    ($($vector:literal),* $(,)?) => {
        [
            $(
                {
                    extern "x86-interrupt" fn stub(mut frame: InterruptStackFrame) {
                        common_isr($vector, &mut frame);
                    }
                    stub as extern "x86-interrupt" fn(InterruptStackFrame)
                }
            ),*
        ]
    };
}

/// Stubs for vectors 32..=255, generated at build time.
static ISR_STUBS: [extern "x86-interrupt" fn(InterruptStackFrame); 224] = irq_stubs!(
    32, 33, 34, 35, 36, 37, 38, 39, 40, 41, 42, 43, 44, 45, 46, 47,
    48, 49, 50, 51, 52, 53, 54, 55, 56, 57, 58, 59, 60, 61, 62, 63,
    64, 65, 66, 67, 68, 69, 70, 71, 72, 73, 74, 75, 76, 77, 78, 79,
    80, 81, 82, 83, 84, 85, 86, 87, 88, 89, 90, 91, 92, 93, 94, 95,
    96, 97, 98, 99, 100, 101, 102, 103, 104, 105, 106, 107, 108, 109, 110, 111,
    112, 113, 114, 115, 116, 117, 118, 119, 120, 121, 122, 123, 124, 125, 126, 127,
    128, 129, 130, 131, 132, 133, 134, 135, 136, 137, 138, 139, 140, 141, 142, 143,
    144, 145, 146, 147, 148, 149, 150, 151, 152, 153, 154, 155, 156, 157, 158, 159,
    160, 161, 162, 163, 164, 165, 166, 167, 168, 169, 170, 171, 172, 173, 174, 175,
    176, 177, 178, 179, 180, 181, 182, 183, 184, 185, 186, 187, 188, 189, 190, 191,
    192, 193, 194, 195, 196, 197, 198, 199, 200, 201, 202, 203, 204, 205, 206, 207,
    208, 209, 210, 211, 212, 213, 214, 215, 216, 217, 218, 219, 220, 221, 222, 223,
    224, 225, 226, 227, 228, 229, 230, 231, 232, 233, 234, 235, 236, 237, 238, 239,
    240, 241, 242, 243, 244, 245, 246, 247, 248, 249, 250, 251, 252, 253, 254, 255,
);

macro_rules! exception {
    ($name:ident, $mnemonic:literal, $message:literal) => {
        extern "x86-interrupt" fn $name(frame: InterruptStackFrame) {
            panic!(
                concat!("exception #", $mnemonic, " (", $message, ") at {:?}"),
                frame
            );
        }
    };
    ($name:ident, $mnemonic:literal, $message:literal, err) => {
        extern "x86-interrupt" fn $name(frame: InterruptStackFrame, error_code: u64) {
            panic!(
                concat!(
                    "exception #",
                    $mnemonic,
                    " (",
                    $message,
                    ") error {:#x} at {:?}"
                ),
                error_code, frame
            );
        }
    };
}

exception!(divide_error, "DE", "Division By Zero");
exception!(debug_exception, "DB", "Debug");
exception!(non_maskable, "NMI", "Non Maskable Interrupt");
exception!(breakpoint, "BP", "Breakpoint");
exception!(overflow, "OF", "Overflow");
exception!(bound_range, "BR", "Out of Bounds");
exception!(invalid_opcode, "UD", "Invalid Opcode");
exception!(device_not_available, "NM", "No Coprocessor");
exception!(invalid_tss, "TS", "Invalid TSS", err);
exception!(segment_not_present, "NP", "Segment Not Present", err);
exception!(stack_segment, "SS", "Stack Fault", err);
exception!(general_protection, "GP", "General Protection Fault", err);
exception!(x87_floating_point, "MF", "x87 Floating-Point Exception");
exception!(alignment_check, "AC", "Alignment Check", err);
exception!(simd_floating_point, "XM", "SIMD Floating-Point Exception");
exception!(virtualization, "VE", "Virtualization Exception");

extern "x86-interrupt" fn double_fault(frame: InterruptStackFrame, error_code: u64) -> ! {
    panic!(
        "exception #DF (Double Fault) error {:#x} at {:?}",
        error_code, frame
    );
}

extern "x86-interrupt" fn machine_check(frame: InterruptStackFrame) -> ! {
    panic!("exception #MC (Machine Check) at {:?}", frame);
}

extern "x86-interrupt" fn page_fault(frame: InterruptStackFrame, error_code: PageFaultErrorCode) {
    let cr2 = x86_64::registers::control::Cr2::read_raw();
    panic!(
        "exception #PF (Page Fault) at {:#x}, error {:?}, frame {:?}",
        cr2, error_code, frame
    );
}

/// Build the IDT, point every high vector at its stub, remap and mask the
/// legacy PICs, and load the table on the boot CPU.
pub fn init() {
    let idt = IDT.call_once(|| {
        let mut idt = InterruptDescriptorTable::new();

        idt.divide_error.set_handler_fn(divide_error);
        idt.debug.set_handler_fn(debug_exception);
        idt.non_maskable_interrupt.set_handler_fn(non_maskable);
        idt.breakpoint.set_handler_fn(breakpoint);
        idt.overflow.set_handler_fn(overflow);
        idt.bound_range_exceeded.set_handler_fn(bound_range);
        idt.invalid_opcode.set_handler_fn(invalid_opcode);
        idt.device_not_available.set_handler_fn(device_not_available);
        idt.invalid_tss.set_handler_fn(invalid_tss);
        idt.segment_not_present.set_handler_fn(segment_not_present);
        idt.stack_segment_fault.set_handler_fn(stack_segment);
        idt.general_protection_fault.set_handler_fn(general_protection);
        idt.page_fault.set_handler_fn(page_fault);
        idt.x87_floating_point.set_handler_fn(x87_floating_point);
        idt.alignment_check.set_handler_fn(alignment_check);
        idt.machine_check.set_handler_fn(machine_check);
        idt.simd_floating_point.set_handler_fn(simd_floating_point);
        idt.virtualization.set_handler_fn(virtualization);
        unsafe {
            idt.double_fault
                .set_handler_fn(double_fault)
                .set_stack_index(crate::gdt::DOUBLE_FAULT_IST_INDEX);
        }

        for (i, stub) in ISR_STUBS.iter().enumerate() {
            idt[(FIRST_ALLOCATABLE_VECTOR + i) as u8].set_handler_fn(*stub);
        }

        idt
    });

    idt.load();

    unsafe {
        let mut pics = PICS.lock();
        pics.initialize();
        pics.disable();
    }

    log::info!("interrupts: IDT loaded, legacy PICs remapped and masked");
}

/// Load the already-built IDT on an application processor.
pub fn load_ap() {
    IDT.get().expect("interrupts: IDT not built yet").load();
}

/// Install `handler` for `vector`. The slot must have been reserved.
pub fn set_handler(vector: u8, handler: Handler) {
    let mut slot = HANDLERS[vector as usize].lock();
    debug_assert!(slot.is_reserved, "vector {} was never allocated", vector);
    let reserved = slot.is_reserved;
    *slot = handler;
    slot.is_reserved = reserved;
}

/// Grab a free vector from the pool.
pub fn allocate_vector() -> u8 {
    for vector in FIRST_ALLOCATABLE_VECTOR..256 {
        let mut slot = HANDLERS[vector].lock();
        if !slot.is_reserved {
            slot.is_reserved = true;
            return vector as u8;
        }
    }
    panic!("interrupts: out of IRQ vectors");
}

/// Pin a specific vector (fixed-routing hardware).
pub fn reserve_vector(vector: u8) {
    let mut slot = HANDLERS[vector as usize].lock();
    assert!(!slot.is_reserved, "vector {} already reserved", vector);
    slot.is_reserved = true;
}
