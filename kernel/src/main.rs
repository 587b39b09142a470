//! Kernel entry: the stivale2 header, the boot CPU's path through
//! bring-up, and the panic handler.

#![no_std]
#![no_main]

use kernel::boot::stivale2::{
    HeaderTag, HeaderTagSmp, Parser, StivaleHeader, StivaleStruct, HEADER_TAG_5LV_PAGING_ID,
    HEADER_TAG_SMP_ID,
};
use kernel::{interrupts, lapic, logger, memory, pci, per_cpu, serial, smp, task, time};

const BSP_STACK_SIZE: usize = 0x4000;

/// Boot stack for the BSP. `UnsafeCell` keeps the static in writable
/// memory; only the CPU itself ever touches it.
#[repr(C, align(16))]
struct BspStack(core::cell::UnsafeCell<[u8; BSP_STACK_SIZE]>);

unsafe impl Sync for BspStack {}

static BSP_STACK: BspStack = BspStack(core::cell::UnsafeCell::new([0; BSP_STACK_SIZE]));

static SMP_TAG: HeaderTagSmp = HeaderTagSmp {
    tag: HeaderTag {
        identifier: HEADER_TAG_SMP_ID,
        next: core::ptr::null(),
    },
    // Ask the loader to switch the LAPICs to x2APIC mode.
    flags: 1,
};

static LA57_TAG: HeaderTag = HeaderTag {
    identifier: HEADER_TAG_5LV_PAGING_ID,
    next: &SMP_TAG.tag,
};

#[used]
#[link_section = ".stivale2hdr"]
static STIVALE2_HEADER: StivaleHeader = StivaleHeader {
    entry_point: Some(kernel_main),
    stack: unsafe { (BSP_STACK.0.get() as *const u8).add(BSP_STACK_SIZE) },
    flags: 0,
    tags: &LA57_TAG,
};

#[no_mangle]
extern "C" fn kernel_main(info: &'static StivaleStruct) -> ! {
    serial::init();
    logger::init();

    let boot = unsafe { Parser::new(info) };
    log::info!(
        "Booting Luna; loader {} {}",
        boot.bootloader_brand(),
        boot.bootloader_version()
    );

    memory::init_bsp();
    memory::init(&boot);

    interrupts::init();
    per_cpu::init(lapic::Lapic::new().id());

    let rsdp = boot.acpi_rsdp().expect("no ACPI RSDP from the loader");
    kernel::acpi::init(rsdp);
    kernel::ioapic::init();

    time::init();
    pci::init();

    smp::start_cpus(&boot);

    x86_64::instructions::interrupts::enable();
    log::info!("boot complete, {} CPU(s) online", smp::cpus_online());

    #[cfg(feature = "testing")]
    kernel::post_tests::run();

    loop {
        task::yield_now();
        x86_64::instructions::hlt();
    }
}

#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    x86_64::instructions::interrupts::disable();

    kernel::serial_println!("");
    match info.location() {
        Some(location) => kernel::serial_println!(
            "KERNEL PANIC at {}:{}:{}",
            location.file(),
            location.line(),
            location.column()
        ),
        None => kernel::serial_println!("KERNEL PANIC"),
    }
    kernel::serial_println!("{}", info.message());

    kernel::debug::print_stack_trace();
    kernel::hlt_loop();
}
