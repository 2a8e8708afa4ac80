#![no_std]
#![no_main]
#![feature(custom_test_frameworks)]
#![feature(abi_x86_interrupt)]
#![test_runner(crate::test_runner::test_runner)]
#![reexport_test_harness_main = "test_main"]

extern crate alloc;

pub mod allocator;
pub mod gdt;
pub mod interrupts;
pub mod memory;
pub mod process;
pub mod serial;
pub mod sync;
pub mod test_runner;
#[cfg(test)]
mod tests;

use bootloader::{BootInfo, entry_point};
use core::panic::PanicInfo;

entry_point!(kernel_main);

pub fn init() {
    gdt::init();
    interrupts::init_idt();
    unsafe { interrupts::PICS.lock().initialize() };
    x86_64::instructions::interrupts::enable();
}

fn kernel_main(boot_info: &'static BootInfo) -> ! {
    serial_println!("booting virtual-memory kernel");

    init();
    serial_println!("gdt/idt/pics initialized");

    let mut mapper = memory::init(boot_info);
    serial_println!(
        "frame allocator ready, {} frames free",
        memory::frame::free_count()
    );

    let mut frame_allocator = memory::frame::GlobalFrameAllocator;
    allocator::init_heap(&mut mapper, &mut frame_allocator).expect("heap initialization failed");
    serial_println!("kernel heap mapped at {:#x}", allocator::HEAP_START);

    memory::swap::evict::set_source(&process::PROCESS_TABLE_SOURCE);
    serial_println!("swap engine ready");

    #[cfg(test)]
    test_runner::run_all_tests();

    serial_println!("idle");
    loop {
        x86_64::instructions::hlt();
    }
}

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    serial_println!("KERNEL PANIC: {}", info);
    #[cfg(test)]
    qemu_exit(QemuExitCode::Failed);
    loop {
        x86_64::instructions::hlt();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum QemuExitCode {
    Success = 0x10,
    Failed = 0x11,
}

pub fn qemu_exit(exit_code: QemuExitCode) -> ! {
    use x86_64::instructions::port::Port;
    unsafe {
        let mut port = Port::new(0xf4);
        port.write(exit_code as u32);
    }
    loop {
        x86_64::instructions::hlt();
    }
}
