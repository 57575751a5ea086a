//! The physical page allocator. Every usable frame has a descriptor holding
//! a reference count and a freelist link; the freelist is a single-linked
//! stack of descriptor indices behind one mutex. Reference counts move with
//! atomics so `incref`/`decref` stay off the freelist lock until a count
//! actually drops to zero.

use core::sync::atomic::{AtomicI32, AtomicU32, Ordering};

use alloc::vec::Vec;
use usize_conversions::usize_from;
use x86_64::{
    structures::paging::{PhysFrame, Size4KiB},
    PhysAddr, VirtAddr,
};

use crate::{
    error::{ensure, Result},
    memory::pagetable::phys_to_virt,
    spin::{lazy::Lazy, mutex::Mutex, once::Once},
};

pub const PAGE_SIZE: usize = 0x1000;

/// Freelist terminator.
const NO_FRAME: u32 = !0;
/// Refcount of a descriptor that does not cover a usable frame.
const UNRESERVED: i32 = -10;

pub static FRAME_ALLOCATOR: FrameAllocator = FrameAllocator::new();

struct Descriptor {
    refcnt: AtomicI32,
    /// Index of the next free descriptor. Only valid while this frame is on
    /// the freelist; guarded by the freelist mutex.
    next_free: AtomicU32,
}

struct Table {
    descriptors: Vec<Descriptor>,
    start_frame: u64,
}

struct FreeList {
    head: u32,
}

pub struct FrameAllocator {
    free: Mutex<FreeList>,
    table: Once<Table>,
}

impl FrameAllocator {
    const fn new() -> Self {
        Self {
            free: Mutex::new(FreeList { head: NO_FRAME }),
            table: Once::new(),
        }
    }

    /// Hand the usable memory run over to the allocator.
    ///
    /// # Safety
    ///
    /// The frames must be unused and must only be handed over once.
    pub unsafe fn init(&self, start: PhysFrame, count: usize) {
        let table = self.table.call_once(|| {
            let mut descriptors = Vec::with_capacity(count);
            descriptors.resize_with(count, || Descriptor {
                refcnt: AtomicI32::new(UNRESERVED),
                next_free: AtomicU32::new(NO_FRAME),
            });
            Table {
                descriptors,
                start_frame: start.start_address().as_u64() >> 12,
            }
        });

        let mut free = self.free.lock();
        for idx in (0..count as u32).rev() {
            let descriptor = &table.descriptors[idx as usize];
            descriptor.refcnt.store(0, Ordering::Relaxed);
            descriptor.next_free.store(free.head, Ordering::Relaxed);
            free.head = idx;
        }
    }

    fn table(&self) -> &Table {
        self.table.get().expect("frame allocator not initialized")
    }

    fn descriptor(&self, frame: PhysFrame) -> &Descriptor {
        let table = self.table();
        let frame_number = frame.start_address().as_u64() >> 12;
        let idx = usize_from(frame_number - table.start_frame);
        &table.descriptors[idx]
    }

    /// Pop a frame off the freelist without touching its contents. The
    /// returned frame has a refcount of zero; it is usually claimed via
    /// `incref` by `page_insert`.
    pub fn alloc_raw(&self) -> Result<(VirtAddr, PhysFrame)> {
        let table = self.table();

        let mut free = self.free.lock();
        ensure!(free.head != NO_FRAME, NoMem);

        let idx = free.head;
        let descriptor = &table.descriptors[idx as usize];
        free.head = descriptor.next_free.load(Ordering::Relaxed);
        drop(free);

        let refcnt = descriptor.refcnt.load(Ordering::Relaxed);
        assert_eq!(refcnt, 0, "frame on freelist with refcount {refcnt}");

        let paddr = PhysAddr::new((table.start_frame + u64::from(idx)) << 12);
        let frame = PhysFrame::from_start_address(paddr).unwrap();
        Ok((phys_to_virt(paddr), frame))
    }

    /// Allocate a frame and clear it through the direct map.
    pub fn alloc_zeroed(&self) -> Result<(VirtAddr, PhysFrame)> {
        let (kaddr, frame) = self.alloc_raw()?;
        unsafe {
            core::ptr::write_bytes(kaddr.as_mut_ptr::<u8>(), 0, PAGE_SIZE);
        }
        Ok((kaddr, frame))
    }

    pub fn incref(&self, frame: PhysFrame) {
        let count = self.descriptor(frame).refcnt.fetch_add(1, Ordering::SeqCst) + 1;
        assert!(count > 0, "incref on free frame {frame:?}");
    }

    /// Drop a reference; the frame goes back on the freelist when the count
    /// reaches zero.
    pub fn decref(&self, frame: PhysFrame) {
        if self.decref_deferred(frame) {
            self.free_deferred(frame);
        }
    }

    /// Drop a reference without freeing. Returns true when the count reached
    /// zero; the caller must then call `free_deferred` after any remaining
    /// cleanup that needs the frame contents (the pmap teardown scans the
    /// dying root before releasing it).
    pub fn decref_deferred(&self, frame: PhysFrame) -> bool {
        let count = self.descriptor(frame).refcnt.fetch_sub(1, Ordering::SeqCst) - 1;
        assert!(count >= 0, "negative refcount on {frame:?}");
        count == 0
    }

    pub fn free_deferred(&self, frame: PhysFrame) {
        let table = self.table();
        let frame_number = frame.start_address().as_u64() >> 12;
        let idx = usize_from(frame_number - table.start_frame) as u32;

        let mut free = self.free.lock();
        table.descriptors[idx as usize]
            .next_free
            .store(free.head, Ordering::Relaxed);
        free.head = idx;
    }

    pub fn refcount(&self, frame: PhysFrame) -> i32 {
        self.descriptor(frame).refcnt.load(Ordering::SeqCst)
    }

    /// Number of frames currently on the freelist. Walks the list; only used
    /// for diagnostics.
    pub fn free_frames(&self) -> usize {
        let table = self.table();
        let free = self.free.lock();
        let mut count = 0;
        let mut idx = free.head;
        while idx != NO_FRAME {
            count += 1;
            idx = table.descriptors[idx as usize]
                .next_free
                .load(Ordering::Relaxed);
        }
        count
    }
}

/// The shared zero page backing read faults on anonymous regions. The
/// allocator holds one reference for the static itself so the frame can
/// never return to the freelist.
static ZERO_FRAME: Lazy<PhysFrame<Size4KiB>> = Lazy::new(|| {
    let (_kaddr, frame) = FRAME_ALLOCATOR.alloc_zeroed().expect("out of frames at boot");
    FRAME_ALLOCATOR.incref(frame);
    frame
});

pub fn zero_frame() -> PhysFrame {
    *ZERO_FRAME
}

#[cfg(test)]
mod tests {
    use super::*;

    // The global allocator is shared by every test in the process, so all
    // refcount scenarios run inside one body.
    #[test]
    fn refcounts_and_freelist() {
        unsafe {
            FRAME_ALLOCATOR.init(
                PhysFrame::from_start_address(PhysAddr::new(0x10_0000)).unwrap(),
                8,
            );
        }
        assert_eq!(FRAME_ALLOCATOR.free_frames(), 8);

        // Fresh frames come back with a zero refcount and are off the list.
        let (_kaddr, frame) = FRAME_ALLOCATOR.alloc_raw().unwrap();
        assert_eq!(FRAME_ALLOCATOR.refcount(frame), 0);
        assert_eq!(FRAME_ALLOCATOR.free_frames(), 7);

        // Two references; the frame is only released on the last decref.
        FRAME_ALLOCATOR.incref(frame);
        FRAME_ALLOCATOR.incref(frame);
        FRAME_ALLOCATOR.decref(frame);
        assert_eq!(FRAME_ALLOCATOR.refcount(frame), 1);
        assert_eq!(FRAME_ALLOCATOR.free_frames(), 7);
        FRAME_ALLOCATOR.decref(frame);
        assert_eq!(FRAME_ALLOCATOR.free_frames(), 8);

        // Deferred release keeps the frame off the list until freed.
        let (_kaddr, frame) = FRAME_ALLOCATOR.alloc_raw().unwrap();
        FRAME_ALLOCATOR.incref(frame);
        assert!(FRAME_ALLOCATOR.decref_deferred(frame));
        assert_eq!(FRAME_ALLOCATOR.free_frames(), 7);
        FRAME_ALLOCATOR.free_deferred(frame);
        assert_eq!(FRAME_ALLOCATOR.free_frames(), 8);

        // Draining the freelist reports out-of-memory.
        let mut held = alloc::vec::Vec::new();
        while let Ok((_, frame)) = FRAME_ALLOCATOR.alloc_raw() {
            held.push(frame);
        }
        assert_eq!(held.len(), 8);
        for frame in held {
            FRAME_ALLOCATOR.incref(frame);
            FRAME_ALLOCATOR.decref(frame);
        }
        assert_eq!(FRAME_ALLOCATOR.free_frames(), 8);
    }
}
