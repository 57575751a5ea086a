//! Generation-based cross-CPU TLB shootdown. The initiating CPU registers a
//! generation describing the root and range, broadcasts the shootdown vector
//! and waits until every other CPU has acknowledged. Receivers invalidate
//! only if the dying translation could be in their TLB, then acknowledge.

use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use usize_conversions::FromUsize;
use x86_64::{structures::paging::PhysFrame, VirtAddr};

use crate::{apic, memory::pagetable, per_cpu::PerCpu, spin::mutex::Mutex};

pub const TLBSHOOT_VECTOR: u8 = 70;

/// Ranges past this size flush the whole pmap instead of page by page.
const FLUSH_ALL_THRESHOLD: u64 = 32;

struct Generation {
    root: AtomicU64,
    start: AtomicU64,
    pgcount: AtomicU64,
    pending: AtomicU32,
    generation: AtomicU64,
}

static CURRENT: Generation = Generation {
    root: AtomicU64::new(0),
    start: AtomicU64::new(0),
    pgcount: AtomicU64::new(0),
    pending: AtomicU32::new(0),
    generation: AtomicU64::new(0),
};

/// Serializes initiators; only one shootdown generation is in flight.
static INITIATOR: Mutex<()> = Mutex::new(());

/// Flush `[start_va, start_va + pgcount pages)` under `root` from every CPU.
///
/// `pgcount == 0` is a no-op. `pgcount == 1` with `start_va == 0` means
/// "flush the whole pmap"; the fork path uses this after demoting the entire
/// address space to COW. The PTE writes that made the translations stale must
/// be visible before this is called.
pub fn shoot(root: PhysFrame, start_va: VirtAddr, pgcount: usize) {
    if pgcount == 0 {
        return;
    }

    // Drop our own stale translations regardless of the CPU count.
    flush_local(start_va, u64::from_usize(pgcount));

    let others = apic::cpu_count() - 1;
    if others == 0 {
        return;
    }

    let guard = INITIATOR.lock();
    CURRENT.root.store(root.start_address().as_u64(), Ordering::SeqCst);
    CURRENT.start.store(start_va.as_u64(), Ordering::SeqCst);
    CURRENT
        .pgcount
        .store(u64::from_usize(pgcount), Ordering::SeqCst);
    CURRENT.pending.store(others, Ordering::SeqCst);
    CURRENT.generation.fetch_add(1, Ordering::SeqCst);

    apic::broadcast_ipi(TLBSHOOT_VECTOR);

    // Wait until the runtime reports every CPU has observed the generation.
    while CURRENT.pending.load(Ordering::SeqCst) != 0 {
        core::hint::spin_loop();
    }
    drop(guard);
}

/// The receiving side, called from the shootdown vector on every other CPU.
/// Runs in interrupt context: no allocation, no locks.
pub fn handle_ipi() {
    let root = CURRENT.root.load(Ordering::SeqCst);
    let start = CURRENT.start.load(Ordering::SeqCst);
    let pgcount = CURRENT.pgcount.load(Ordering::SeqCst);

    let current_root = PerCpu::get().loaded_root.get();
    if current_root == root {
        flush_local(VirtAddr::new(start), pgcount);
    }

    CURRENT.pending.fetch_sub(1, Ordering::SeqCst);
}

fn flush_local(start: VirtAddr, pgcount: u64) {
    let flush_all = (start.as_u64() == 0 && pgcount == 1) || pgcount > FLUSH_ALL_THRESHOLD;
    if flush_all {
        // Reloading CR3 drops all non-global translations.
        let (frame, flags) = x86_64::registers::control::Cr3::read();
        unsafe {
            x86_64::registers::control::Cr3::write(frame, flags);
        }
        return;
    }

    for i in 0..pgcount {
        pagetable::invlpg(start + i * 0x1000);
    }
}

/// Physical address of the root currently loaded on this CPU, for the
/// receiver-side filter.
pub fn note_loaded_root(root: Option<PhysFrame>) {
    let raw = root.map_or(0, |frame| frame.start_address().as_u64());
    PerCpu::get().loaded_root.set(raw);
}
