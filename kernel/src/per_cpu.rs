use core::{
    arch::asm,
    cell::{Cell, OnceCell},
    mem::offset_of,
    ptr::null_mut,
    sync::atomic::{AtomicUsize, Ordering},
};

use x86_64::{
    registers::segmentation::{Segment64, GS},
    structures::{gdt::GlobalDescriptorTable, paging::PhysFrame, tss::TaskStateSegment},
    VirtAddr,
};

use crate::{exception::TrapFrame, trap::TrapRing};

pub const MAX_CPUS: usize = 32;

static COUNT: AtomicUsize = AtomicUsize::new(0);
static mut STORAGE: [PerCpu; MAX_CPUS] = [const { PerCpu::new() }; MAX_CPUS];

/// Maps a LAPIC id to the logical CPU number; filled in as CPUs come up. The
/// interrupt stub indexes this with the LAPIC id register.
static LAPIC_TO_CPU: [AtomicUsize; 256] = [const { AtomicUsize::new(0) }; 256];

#[repr(C, align(64))]
pub struct PerCpu {
    this: *mut PerCpu,
    /// Register spill slot for the trap return path.
    pub scratch: Cell<u64>,
    /// User RSP parked here by the syscall entry stub.
    pub user_rsp_scratch: Cell<u64>,
    /// Kernel stack pointer to restore when a trap ends the userspace visit.
    pub kernel_rsp: Cell<u64>,
    /// The running thread's trap frame; user register state is spilled here.
    pub trap_frame: Cell<*mut TrapFrame>,
    /// CR2 captured by the page-fault path before interrupts could clobber it.
    pub cr2_scratch: Cell<u64>,
    /// Physical address of the root currently loaded in CR3 (0 while the CPU
    /// runs on the boot tables); the shootdown receiver filters on this.
    pub loaded_root: Cell<u64>,

    pub idx: usize,
    pub lapic_id: Cell<u32>,
    /// Root this CPU holds a transient reference on while executing user
    /// code; dropping it tears the address space down if the owning process
    /// already exited.
    pub held_root: Cell<Option<PhysFrame>>,
    pub tss: OnceCell<TaskStateSegment>,
    pub gdt: OnceCell<GlobalDescriptorTable>,
    pub ring: TrapRing,
}

// Offsets the trap return path uses from assembly.
pub const PER_CPU_SCRATCH: usize = offset_of!(PerCpu, scratch);
pub const PER_CPU_USER_RSP_SCRATCH: usize = offset_of!(PerCpu, user_rsp_scratch);
pub const PER_CPU_KERNEL_RSP: usize = offset_of!(PerCpu, kernel_rsp);
pub const PER_CPU_TRAP_FRAME: usize = offset_of!(PerCpu, trap_frame);
pub const PER_CPU_CR2_SCRATCH: usize = offset_of!(PerCpu, cr2_scratch);

impl PerCpu {
    pub const fn new() -> Self {
        Self {
            this: null_mut(),
            scratch: Cell::new(0),
            user_rsp_scratch: Cell::new(0),
            kernel_rsp: Cell::new(0),
            trap_frame: Cell::new(null_mut()),
            cr2_scratch: Cell::new(0),
            loaded_root: Cell::new(0),
            idx: 0,
            lapic_id: Cell::new(0),
            held_root: Cell::new(None),
            tss: OnceCell::new(),
            gdt: OnceCell::new(),
            ring: TrapRing::new(),
        }
    }

    pub fn get() -> &'static Self {
        let addr: u64;
        unsafe {
            // SAFETY: If the GS segment wasn't programmed yet, this will cause
            // a page fault, which is a safe thing to do.
            asm!(
                "mov {}, gs:[{THIS_OFFSET}]",
                out(reg) addr,
                THIS_OFFSET = const offset_of!(Self, this),
                options(pure, nomem, preserves_flags, nostack),
            );
        }
        let ptr = addr as *const Self;
        unsafe { &*ptr }
    }

    pub fn by_index(idx: usize) -> &'static Self {
        assert!(idx < COUNT.load(Ordering::SeqCst));
        unsafe { &*core::ptr::addr_of!(STORAGE[idx]) }
    }

    pub fn count() -> usize {
        COUNT.load(Ordering::SeqCst)
    }

    /// The ring of the CPU the caller runs on, located by the LAPIC id
    /// register. The only lookup the interrupt stub is allowed to do.
    pub fn current_by_lapic() -> &'static Self {
        let lapic_id = crate::apic::lapic_id();
        let idx = LAPIC_TO_CPU[lapic_id as usize].load(Ordering::Relaxed);
        unsafe { &*core::ptr::addr_of!(STORAGE[idx]) }
    }

    /// Claim a per-CPU slot and install it in GS. Called once on every CPU
    /// during bring-up.
    pub fn init() {
        let addr = GS::read_base();
        assert_eq!(addr, VirtAddr::new(0), "GS segment was already initialized");

        let idx = COUNT.fetch_add(1, Ordering::SeqCst);
        let ptr = unsafe { &mut *core::ptr::addr_of_mut!(STORAGE[idx]) };
        ptr.this = ptr;
        ptr.idx = idx;

        if crate::apic::ready() {
            let lapic_id = crate::apic::lapic_id();
            ptr.lapic_id.set(lapic_id);
            LAPIC_TO_CPU[lapic_id as usize].store(idx, Ordering::SeqCst);
        }

        let addr = VirtAddr::from_ptr(ptr);
        unsafe {
            GS::write_base(addr);
        }
    }

    pub fn is_first(&self) -> bool {
        self.idx == 0
    }
}
