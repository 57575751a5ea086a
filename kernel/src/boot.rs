//! The contract with the loader. Bootstrap (AP startup, CPU probing, the
//! early page tables) happens before the kernel entry point; everything the
//! core needs from it arrives in this record.

use x86_64::{PhysAddr, VirtAddr};

#[repr(C)]
pub struct BootInfo {
    /// First usable physical frame.
    pub mem_start: PhysAddr,
    /// Number of usable 4 KiB frames starting at `mem_start`.
    pub mem_pages: usize,
    /// Premapped kernel heap region.
    pub heap_start: VirtAddr,
    pub heap_size: usize,
    pub lapic_base: PhysAddr,
    pub ioapic_base: PhysAddr,
    /// Application processors in addition to the bootstrap processor.
    pub ap_count: usize,
    pub tsc_khz: u64,
}
