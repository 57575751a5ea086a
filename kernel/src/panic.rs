use core::panic::PanicInfo;

use log::error;
use x86_64::instructions::{hlt, interrupts};

use crate::trap;

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    interrupts::disable();

    error!("{info}");
    trap::dump_recent();

    loop {
        hlt();
    }
}

#[alloc_error_handler]
fn alloc_error(layout: core::alloc::Layout) -> ! {
    panic!("allocation of {layout:?} failed");
}
