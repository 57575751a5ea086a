#![cfg_attr(not(test), no_std)]
#![cfg_attr(not(test), no_main)]
#![feature(abi_x86_interrupt, alloc_error_handler)]
#![forbid(unsafe_op_in_unsafe_fn)]

extern crate alloc;

#[cfg(not(test))]
use x86_64::instructions::interrupts;

#[cfg(not(test))]
use self::{boot::BootInfo, per_cpu::PerCpu};

mod apic;
mod boot;
mod error;
mod exception;
mod fs;
mod logging;
mod memory;
#[cfg(not(test))]
mod panic;
mod per_cpu;
mod rt;
mod spin;
mod time;
mod trap;
mod user;

pub const INIT_PATH: &str = "/bin/init";

#[cfg(not(test))]
#[no_mangle]
extern "C" fn _start(boot_info: &'static BootInfo) -> ! {
    unsafe { main(boot_info) }
}

/// # Safety
///
/// This function must only be called once, by the loader, on the bootstrap
/// processor.
#[cfg(not(test))]
unsafe fn main(boot_info: &'static BootInfo) -> ! {
    let _ = log::set_logger(&logging::SerialLogger);
    log::set_max_level(log::LevelFilter::Debug);

    unsafe {
        memory::heap::init(boot_info.heap_start, boot_info.heap_size);
        apic::init(boot_info.lapic_base, boot_info.ioapic_base);
    }
    apic::set_cpu_count(1 + boot_info.ap_count as u32);

    PerCpu::init();

    unsafe {
        memory::frame::FRAME_ALLOCATOR.init(
            x86_64::structures::paging::PhysFrame::from_start_address(boot_info.mem_start)
                .expect("unaligned memory start"),
            boot_info.mem_pages,
        );
        memory::pagetable::init();
    }
    memory::tlb::note_loaded_root(None);
    time::calibrate(boot_info.tsc_khz);

    exception::load_gdt();
    exception::load_idt();
    interrupts::enable();

    exception::switch_stack(init)
}

/// Per-AP bring-up: claim a per-CPU slot and join the worker loop. Called by
/// the AP trampoline after long mode is set up.
#[cfg(not(test))]
#[no_mangle]
pub extern "C" fn ap_entry() -> ! {
    PerCpu::init();
    memory::tlb::note_loaded_root(None);
    exception::load_gdt();
    exception::load_idt();
    interrupts::enable();

    user::run()
}

#[cfg(not(test))]
extern "C" fn init() -> ! {
    // The first CPU does the singleton initialization work.
    if PerCpu::get().is_first() {
        rt::spawn(trap::consume());
        user::syscall::start_init_process(INIT_PATH);
    }

    user::run()
}
