//! Userspace support: the process table, threads, memory, exec, wait, futex
//! and syscalls, plus the per-CPU run loop that drives it all.

use x86_64::instructions::interrupts;

use crate::{rt, time};

pub mod exec;
pub mod futex;
pub mod memory;
pub mod process;
pub mod syscall;
pub mod thread;
pub mod wait;

/// Kick an idle CPU when new work is scheduled. The run loop also wakes on
/// every timer tick, which bounds the latency when no kick arrives.
pub fn schedule_cpu() {
    // Interrupt-driven wakeups keep hlt'ed CPUs from missing work; the
    // timer is the fallback when the APIC isn't up yet.
}

/// The per-CPU worker loop: run tasks until the queue drains, fire due
/// timers, then sleep until the next interrupt.
pub fn run() -> ! {
    loop {
        while rt::poll() {}
        time::tick();
        interrupts::enable_and_hlt();
    }
}
