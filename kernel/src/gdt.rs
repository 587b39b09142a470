//! Per-CPU GDT and TSS.
//!
//! Layout: null, kernel code, kernel data, then the CPU's TSS descriptor.
//! Each CPU owns its table inside its `CpuData`, so the descriptors can
//! reference the per-CPU TSS directly.

use alloc::boxed::Box;
use alloc::vec;

use x86_64::instructions::segmentation::{Segment, CS, DS, ES, SS};
use x86_64::instructions::tables::load_tss;
use x86_64::structures::gdt::{Descriptor, GlobalDescriptorTable, SegmentSelector};
use x86_64::structures::tss::TaskStateSegment;
use x86_64::VirtAddr;

pub const DOUBLE_FAULT_IST_INDEX: u16 = 0;

const IST_STACK_SIZE: usize = 16 * 1024;

pub struct CpuGdt {
    gdt: GlobalDescriptorTable,
    tss: TaskStateSegment,
    ist_stack: Box<[u8]>,
    kernel_code: SegmentSelector,
    kernel_data: SegmentSelector,
}

impl CpuGdt {
    pub fn new() -> Self {
        Self {
            gdt: GlobalDescriptorTable::new(),
            tss: TaskStateSegment::new(),
            ist_stack: vec![0u8; IST_STACK_SIZE].into_boxed_slice(),
            kernel_code: SegmentSelector(0),
            kernel_data: SegmentSelector(0),
        }
    }

    pub fn kernel_code_selector(&self) -> SegmentSelector {
        self.kernel_code
    }

    pub fn kernel_data_selector(&self) -> SegmentSelector {
        self.kernel_data
    }

    /// Build and load the table, reload the segment registers and load the
    /// task register.
    ///
    /// # Safety
    /// `self` must never move again (it lives inside the leaked per-CPU
    /// block); the descriptors keep raw references into it.
    pub unsafe fn load(&mut self) {
        let stack_top = self.ist_stack.as_ptr() as u64 + IST_STACK_SIZE as u64;
        self.tss.interrupt_stack_table[DOUBLE_FAULT_IST_INDEX as usize] =
            VirtAddr::new(stack_top & !0xF);
        // No I/O permission bitmap: anything past the TSS limit disables it.
        self.tss.iomap_base = core::mem::size_of::<TaskStateSegment>() as u16;

        let tss: &'static TaskStateSegment = &*(&self.tss as *const TaskStateSegment);

        self.kernel_code = self.gdt.append(Descriptor::kernel_code_segment());
        self.kernel_data = self.gdt.append(Descriptor::kernel_data_segment());
        let tss_selector = self.gdt.append(Descriptor::tss_segment(tss));

        let gdt: &'static GlobalDescriptorTable = &*(&self.gdt as *const GlobalDescriptorTable);
        gdt.load();

        CS::set_reg(self.kernel_code);
        DS::set_reg(self.kernel_data);
        ES::set_reg(self.kernel_data);
        SS::set_reg(self.kernel_data);
        load_tss(tss_selector);
    }
}
