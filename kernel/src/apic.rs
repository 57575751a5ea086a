//! Minimal local APIC and IO-APIC access. The interrupt stub reads the LAPIC
//! id register to find its CPU; the shootdown path writes the ICR; the trap
//! pipeline masks level-triggered lines and sends EOIs.

use core::sync::atomic::{AtomicPtr, AtomicU32, Ordering};

use bit_field::BitField;
use x86_64::PhysAddr;

use crate::memory::pagetable::phys_to_virt;

const LAPIC_ID: usize = 0x20 / 4;
const LAPIC_EOI: usize = 0xb0 / 4;
const LAPIC_ICR_LOW: usize = 0x300 / 4;
const LAPIC_ICR_HIGH: usize = 0x310 / 4;
const ICR_SEND_PENDING: u32 = 1 << 12;

static LAPIC_BASE: AtomicPtr<u32> = AtomicPtr::new(core::ptr::null_mut());
static IOAPIC_BASE: AtomicPtr<u32> = AtomicPtr::new(core::ptr::null_mut());

/// # Safety
///
/// The bases must point at the memory-mapped APICs and be identity-reachable
/// through the direct map.
pub unsafe fn init(lapic: PhysAddr, ioapic: PhysAddr) {
    LAPIC_BASE.store(phys_to_virt(lapic).as_mut_ptr(), Ordering::SeqCst);
    IOAPIC_BASE.store(phys_to_virt(ioapic).as_mut_ptr(), Ordering::SeqCst);
}

fn lapic_reg(idx: usize) -> *mut u32 {
    let base = LAPIC_BASE.load(Ordering::Relaxed);
    debug_assert!(!base.is_null(), "apic not initialized");
    unsafe { base.add(idx) }
}

/// The LAPIC id of the current CPU. Safe to call with interrupts disabled;
/// performs a single volatile MMIO read.
pub fn lapic_id() -> u32 {
    unsafe { core::ptr::read_volatile(lapic_reg(LAPIC_ID)) >> 24 }
}

pub fn eoi() {
    unsafe {
        core::ptr::write_volatile(lapic_reg(LAPIC_EOI), 0);
    }
}

/// Destination shorthand: all CPUs excluding self.
const DS_ALL_BUT_SELF: u32 = 3;

fn icr_low(vector: u8, shorthand: u32) -> u32 {
    let mut low = 0u32;
    low.set_bits(0..8, u32::from(vector));
    low.set_bit(14, true); // level assert
    low.set_bits(18..20, shorthand);
    low
}

fn icr_send(high: u32, low: u32) {
    unsafe {
        // The high word goes first; the write to the low word sends.
        core::ptr::write_volatile(lapic_reg(LAPIC_ICR_HIGH), high);
        core::ptr::write_volatile(lapic_reg(LAPIC_ICR_LOW), low);
        while core::ptr::read_volatile(lapic_reg(LAPIC_ICR_LOW)) & ICR_SEND_PENDING != 0 {
            core::hint::spin_loop();
        }
    }
}

/// Broadcast a fixed-vector IPI to every CPU but this one.
pub fn broadcast_ipi(vector: u8) {
    icr_send(0, icr_low(vector, DS_ALL_BUT_SELF));
}

/// Send a fixed-vector IPI to a single CPU, used to kick idle CPUs out of
/// hlt when new work is scheduled.
pub fn send_ipi(lapic_id: u32, vector: u8) {
    icr_send(lapic_id << 24, icr_low(vector, 0));
}

pub fn ready() -> bool {
    !LAPIC_BASE.load(Ordering::Relaxed).is_null()
}

// IO-APIC indirect registers.
const IOREGSEL: usize = 0x00 / 4;
const IOWIN: usize = 0x10 / 4;

fn ioapic_read(reg: u32) -> u32 {
    let base = IOAPIC_BASE.load(Ordering::Relaxed);
    unsafe {
        core::ptr::write_volatile(base.add(IOREGSEL), reg);
        core::ptr::read_volatile(base.add(IOWIN))
    }
}

fn ioapic_write(reg: u32, value: u32) {
    let base = IOAPIC_BASE.load(Ordering::Relaxed);
    unsafe {
        core::ptr::write_volatile(base.add(IOREGSEL), reg);
        core::ptr::write_volatile(base.add(IOWIN), value);
    }
}

fn redirection_reg(irq: u32) -> u32 {
    0x10 + irq * 2
}

/// Mask an IRQ line. Must happen before the LAPIC EOI, otherwise the line
/// immediately refires.
pub fn irq_mask(irq: u32) {
    let reg = redirection_reg(irq);
    let value = ioapic_read(reg);
    ioapic_write(reg, value | (1 << 16));
}

pub fn irq_unmask(irq: u32) {
    let reg = redirection_reg(irq);
    let value = ioapic_read(reg);
    ioapic_write(reg, value & !(1 << 16));
}

/// Route an IRQ line to a vector, initially masked.
pub fn irq_route(irq: u32, vector: u8) {
    let reg = redirection_reg(irq);
    ioapic_write(reg, u32::from(vector) | (1 << 16));
    ioapic_write(reg + 1, 0);
}

static CPU_COUNT: AtomicU32 = AtomicU32::new(1);

pub fn set_cpu_count(count: u32) {
    CPU_COUNT.store(count, Ordering::SeqCst);
}

pub fn cpu_count() -> u32 {
    CPU_COUNT.load(Ordering::SeqCst)
}
