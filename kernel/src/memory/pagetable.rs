//! Page-table primitives: the four-level walk, the recursive slot, kernel
//! entry seeding for fresh roots and the depth-4 teardown scan. All table
//! memory is reached through the direct map; mutations to a process's tables
//! are serialized by that process's pmap lock.

use core::ops::{Index, IndexMut};

use bitflags::bitflags;
use usize_conversions::FromUsize;
use x86_64::{
    registers::control::Cr3,
    structures::paging::{Page, PhysFrame},
    PhysAddr, VirtAddr,
};

use crate::{
    error::{ensure, Result},
    memory::frame::FRAME_ALLOCATOR,
    spin::once::Once,
};

/// PML4 slot of the recursive self-map. Reserved in every root.
pub const VREC: usize = 510;
/// PML4 slot where the direct map of all physical memory lives.
const DMAP_SLOT: u64 = 272;
/// Base of the direct map (slot 272, sign bit set).
const DIRECT_MAP_BASE: u64 = 0xffff_0000_0000_0000 | (DMAP_SLOT << 39);

/// Lowest userspace address (PML4 slot 8).
pub const USERMIN: u64 = 8 << 39;
/// End of userspace; the stack region sits just below.
pub const USEREND: u64 = 0x100 << 39;
/// Fixed high virtual address user stacks end at (slot 0xff).
pub const USTACK_TOP: u64 = 0xff << 39;

pub fn phys_to_virt(paddr: PhysAddr) -> VirtAddr {
    VirtAddr::new(DIRECT_MAP_BASE + paddr.as_u64())
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageTableFlags: u64 {
        const PRESENT = 1 << 0;
        const WRITABLE = 1 << 1;
        const USER = 1 << 2;
        const WRITE_THROUGH = 1 << 3;
        const CACHE_DISABLE = 1 << 4;
        const ACCESSED = 1 << 5;
        const DIRTY = 1 << 6;
        const HUGE_PAGE = 1 << 7;
        const GLOBAL = 1 << 8;
        /// The mapping is shared read-only and must be copied before the
        /// first write.
        const COW = 1 << 9;
        /// The mapping was COW at some point; a present, writable entry with
        /// this flag has already been resolved.
        const WASCOW = 1 << 10;
    }
}

const ADDR_MASK: u64 = 0x000f_ffff_ffff_f000;

#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct PageTableEntry(u64);

impl PageTableEntry {
    pub const EMPTY: Self = Self(0);

    pub fn new(frame: PhysFrame, flags: PageTableFlags) -> Self {
        Self(frame.start_address().as_u64() | flags.bits())
    }

    pub fn is_present(self) -> bool {
        self.flags().contains(PageTableFlags::PRESENT)
    }

    pub fn flags(self) -> PageTableFlags {
        PageTableFlags::from_bits_truncate(self.0)
    }

    pub fn frame(self) -> PhysFrame {
        PhysFrame::from_start_address(PhysAddr::new(self.0 & ADDR_MASK)).unwrap()
    }

    pub fn raw(self) -> u64 {
        self.0
    }
}

impl core::fmt::Debug for PageTableEntry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PageTableEntry")
            .field("frame", &(self.0 & ADDR_MASK))
            .field("flags", &self.flags())
            .finish()
    }
}

#[repr(C, align(4096))]
pub struct PageTable {
    entries: [PageTableEntry; 512],
}

impl Index<usize> for PageTable {
    type Output = PageTableEntry;

    fn index(&self, idx: usize) -> &Self::Output {
        &self.entries[idx]
    }
}

impl IndexMut<usize> for PageTable {
    fn index_mut(&mut self, idx: usize) -> &mut Self::Output {
        &mut self.entries[idx]
    }
}

/// Dereference a table frame through the direct map.
///
/// # Safety
///
/// The caller must hold the pmap lock of the address space the table belongs
/// to (kernel tables are read-only after init).
unsafe fn table_mut(frame: PhysFrame) -> &'static mut PageTable {
    let addr = phys_to_virt(frame.start_address());
    unsafe { &mut *addr.as_mut_ptr::<PageTable>() }
}

/// Kernel half of the PML4, captured from the boot page tables. Every fresh
/// root is seeded with these entries.
static KERNEL_ENTRIES: Once<[(usize, PageTableEntry); 256]> = Once::new();

/// # Safety
///
/// Must be called once at init, before the first `new_root`.
pub unsafe fn init() {
    KERNEL_ENTRIES.call_once(|| {
        let (boot_root, _) = Cr3::read();
        let table = unsafe { table_mut(boot_root) };
        let mut entries = [(0, PageTableEntry::EMPTY); 256];
        for (slot, entry) in entries.iter_mut().enumerate() {
            *entry = (slot + 256, table[slot + 256]);
        }
        entries
    });
}

/// Allocate a fresh root seeded with the kernel entries and its recursive
/// self-map. The returned root carries one reference for the caller.
pub fn new_root() -> Result<PhysFrame> {
    let (_kaddr, frame) = FRAME_ALLOCATOR.alloc_zeroed()?;
    FRAME_ALLOCATOR.incref(frame);

    let table = unsafe { table_mut(frame) };
    for &(slot, entry) in KERNEL_ENTRIES.get().expect("pagetables not initialized") {
        table[slot] = entry;
    }
    table[VREC] = PageTableEntry::new(
        frame,
        PageTableFlags::PRESENT | PageTableFlags::WRITABLE,
    );

    Ok(frame)
}

fn table_indices(va: VirtAddr) -> [usize; 4] {
    let page = Page::<x86_64::structures::paging::Size4KiB>::containing_address(va);
    [
        usize::from(page.p4_index()),
        usize::from(page.p3_index()),
        usize::from(page.p2_index()),
        usize::from(page.p1_index()),
    ]
}

/// Return the leaf PTE for `va`, creating intermediate tables as needed.
/// Newly created table frames take a reference. The returned reference is
/// only valid while the pmap lock is held.
pub fn walk(root: PhysFrame, va: VirtAddr) -> Result<&'static mut PageTableEntry> {
    let indices = table_indices(va);
    assert_ne!(indices[0], VREC, "walk into the recursive slot");

    let mut table = unsafe { table_mut(root) };
    for &idx in &indices[..3] {
        let entry = &mut table[idx];
        if !entry.is_present() {
            let (_kaddr, frame) = FRAME_ALLOCATOR.alloc_zeroed()?;
            FRAME_ALLOCATOR.incref(frame);
            *entry = PageTableEntry::new(
                frame,
                PageTableFlags::PRESENT | PageTableFlags::WRITABLE | PageTableFlags::USER,
            );
        }
        table = unsafe { table_mut(entry.frame()) };
    }
    Ok(&mut table[indices[3]])
}

/// Return the leaf PTE for `va` only if all intermediate entries are present.
pub fn lookup(root: PhysFrame, va: VirtAddr) -> Option<&'static mut PageTableEntry> {
    let indices = table_indices(va);

    let mut table = unsafe { table_mut(root) };
    for &idx in &indices[..3] {
        let entry = table[idx];
        if !entry.is_present() {
            return None;
        }
        table = unsafe { table_mut(entry.frame()) };
    }
    Some(&mut table[indices[3]])
}

/// Invalidate a single TLB entry on the current CPU.
pub fn invlpg(va: VirtAddr) {
    x86_64::instructions::tlb::flush(va);
}

fn scan_user_frames(frame: PhysFrame, depth: usize, drop_list: &mut alloc::vec::Vec<PhysFrame>) {
    if depth == 0 {
        return;
    }
    let table = unsafe { table_mut(frame) };
    for entry in table.entries.iter() {
        let flags = entry.flags();
        if !flags.contains(PageTableFlags::PRESENT | PageTableFlags::USER)
            || flags.contains(PageTableFlags::HUGE_PAGE)
        {
            continue;
        }
        drop_list.push(entry.frame());
        scan_user_frames(entry.frame(), depth - 1, drop_list);
    }
}

/// Drop a reference on a root. On the final release, walk every valid entry
/// to depth 4 and drop the frames it reaches, intermediate tables included.
/// This is the sole authority for tearing down an address space.
pub fn decref_root(root: PhysFrame) {
    if !FRAME_ALLOCATOR.decref_deferred(root) {
        return;
    }

    let mut drop_list = alloc::vec::Vec::new();
    scan_user_frames(root, 4, &mut drop_list);
    for frame in drop_list {
        FRAME_ALLOCATOR.decref(frame);
    }
    FRAME_ALLOCATOR.free_deferred(root);
}

/// The CPU entry path takes a transient reference on the root it loads.
pub fn incref_root(root: PhysFrame) {
    FRAME_ALLOCATOR.incref(root);
}

/// Check that `[addr, addr+len)` lies entirely in userspace.
pub fn check_user_address(addr: VirtAddr, len: usize) -> Result<()> {
    let start = addr.as_u64();
    let end = start.checked_add(u64::from_usize(len)).ok_or(crate::error::err!(Fault))?;
    ensure!(start >= USERMIN, Fault);
    ensure!(end <= USEREND, Fault);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_packs_frame_and_flags() {
        let frame = PhysFrame::from_start_address(PhysAddr::new(0x1234_5000)).unwrap();
        let entry = PageTableEntry::new(
            frame,
            PageTableFlags::PRESENT | PageTableFlags::USER | PageTableFlags::COW,
        );
        assert_eq!(entry.frame(), frame);
        assert!(entry.is_present());
        assert!(entry.flags().contains(PageTableFlags::COW));
        assert!(!entry.flags().contains(PageTableFlags::WRITABLE));
    }

    #[test]
    fn cow_flags_sit_in_ignored_bits() {
        // Bits 9-11 are ignored by the MMU in 4 KiB mappings.
        assert_eq!(PageTableFlags::COW.bits(), 1 << 9);
        assert_eq!(PageTableFlags::WASCOW.bits(), 1 << 10);
    }

    #[test]
    fn user_address_bounds() {
        assert!(check_user_address(VirtAddr::new(USERMIN), 0x1000).is_ok());
        assert!(check_user_address(VirtAddr::new(USERMIN - 0x1000), 0x1000).is_err());
        assert!(check_user_address(VirtAddr::new(USEREND - 0x1000), 0x1001).is_err());
    }

    #[test]
    fn indices_of_the_stack_top() {
        let [p4, ..] = table_indices(VirtAddr::new(USTACK_TOP - 0x1000));
        assert_eq!(p4, 0xfe);
        assert_ne!(p4, VREC);
    }
}
