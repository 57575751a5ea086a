//! Per-process virtual memory: the ordered region map, the page-fault/COW
//! engine and the user⇄kernel access layer. Everything here runs under the
//! owning process's pmap lock; the lock covers the region map, the page
//! table root and the mmap cursor together.

use alloc::{string::String, sync::Arc, vec::Vec};
use core::cmp;

use log::debug;
use usize_conversions::{usize_from, FromUsize};
use x86_64::{
    structures::paging::{Page, PhysFrame},
    VirtAddr,
};

use crate::{
    error::{bail, ensure, err, Result},
    fs::fd::{FdOps, MmapInfo},
    memory::{
        frame::{zero_frame, FRAME_ALLOCATOR, PAGE_SIZE},
        pagetable::{
            self, check_user_address, phys_to_virt, PageTableFlags, USEREND, USERMIN,
        },
        tlb,
    },
    user::process::Process,
};

pub fn round_up_page(len: u64) -> u64 {
    len.next_multiple_of(PAGE_SIZE as u64)
}

/// One contiguous virtual memory area.
#[derive(Clone)]
pub struct VmInfo {
    pub start: Page,
    pub pglen: usize,
    /// Only `USER` and `WRITABLE` are meaningful; empty perms mean nothing
    /// may be mapped here (guard pages).
    pub perms: PageTableFlags,
    pub kind: VmKind,
}

#[derive(Clone)]
pub enum VmKind {
    Anon,
    File {
        fops: Arc<dyn FdOps>,
        foff: usize,
        mapcount: usize,
    },
}

impl VmInfo {
    pub fn anon(start: Page, pglen: usize, perms: PageTableFlags) -> Self {
        Self {
            start,
            pglen,
            perms,
            kind: VmKind::Anon,
        }
    }

    pub fn file(
        start: Page,
        pglen: usize,
        perms: PageTableFlags,
        fops: Arc<dyn FdOps>,
        foff: usize,
    ) -> Self {
        Self {
            start,
            pglen,
            perms,
            kind: VmKind::File {
                fops,
                foff,
                mapcount: pglen,
            },
        }
    }

    pub fn end(&self) -> Page {
        self.start + u64::from_usize(self.pglen)
    }

    pub fn contains(&self, va: VirtAddr) -> bool {
        let page = Page::containing_address(va);
        (self.start..self.end()).contains(&page)
    }

    /// The backing frame for a file page. The core installs the frame the
    /// filesystem returns; it never copies the data itself.
    fn file_page(&self, va: VirtAddr) -> Result<MmapInfo> {
        let VmKind::File { fops, foff, .. } = &self.kind else {
            bail!(Inval);
        };
        let page = Page::containing_address(va);
        let offset = foff + usize_from(page - self.start) * PAGE_SIZE;
        let mut infos = fops.mmapi(offset, 1)?;
        ensure!(!infos.is_empty(), Io);
        Ok(infos.remove(0))
    }
}

/// The per-process ordered map of address-range descriptors. Regions never
/// overlap and are never empty.
#[derive(Default)]
pub struct VmRegion {
    regions: alloc::collections::BTreeMap<Page, VmInfo>,
}

impl VmRegion {
    pub const fn new() -> Self {
        Self {
            regions: alloc::collections::BTreeMap::new(),
        }
    }

    pub fn insert(&mut self, vmi: VmInfo) {
        assert!(vmi.pglen > 0, "empty vm region");
        // The new region must not overlap an existing one.
        if let Some((_, prev)) = self.regions.range(..=vmi.start).next_back() {
            assert!(prev.end() <= vmi.start, "vm region overlap");
        }
        if let Some((&next_start, _)) = self.regions.range(vmi.start..).next() {
            assert!(vmi.end() <= next_start, "vm region overlap");
        }
        self.regions.insert(vmi.start, vmi);
    }

    pub fn lookup(&self, va: VirtAddr) -> Option<&VmInfo> {
        let page = Page::containing_address(va);
        let (_, vmi) = self.regions.range(..=page).next_back()?;
        vmi.contains(va).then_some(vmi)
    }

    /// Remove `[va, va + len)`; regions straddling the boundary are
    /// trimmed or split.
    pub fn remove(&mut self, va: VirtAddr, len: usize) {
        if len == 0 {
            return;
        }
        let start = Page::containing_address(va);
        let end = Page::containing_address(va + u64::from_usize(len) - 1) + 1;

        let mut affected = Vec::new();
        for (&key, vmi) in self.regions.range(..end) {
            if vmi.end() > start {
                affected.push(key);
            }
        }

        for key in affected {
            let vmi = self.regions.remove(&key).unwrap();
            // Pages of this region that survive below the removed range.
            if vmi.start < start {
                let mut head = vmi.clone();
                head.pglen = usize_from(start - vmi.start);
                if let VmKind::File { mapcount, .. } = &mut head.kind {
                    *mapcount = head.pglen;
                }
                self.regions.insert(head.start, head);
            }
            // Pages that survive above it.
            if vmi.end() > end {
                let mut tail = vmi.clone();
                let skipped = usize_from(end - vmi.start);
                tail.start = end;
                tail.pglen = vmi.pglen - skipped;
                if let VmKind::File { foff, mapcount, .. } = &mut tail.kind {
                    *foff += skipped * PAGE_SIZE;
                    *mapcount = tail.pglen;
                }
                self.regions.insert(tail.start, tail);
            }
        }
    }

    /// First gap of at least `len` bytes at or after `start`.
    pub fn empty(&self, start: VirtAddr, len: usize) -> VirtAddr {
        let pages = usize_from(round_up_page(u64::from_usize(len))) / PAGE_SIZE;
        let mut candidate = Page::containing_address(VirtAddr::new(cmp::max(
            start.as_u64(),
            USERMIN,
        )));

        for (_, vmi) in self.regions.range(..) {
            if vmi.end() <= candidate {
                continue;
            }
            if vmi.start >= candidate + u64::from_usize(pages) {
                break;
            }
            candidate = vmi.end();
        }
        let addr = candidate.start_address();
        assert!(addr.as_u64() + u64::from_usize(len) <= USEREND, "user address space exhausted");
        addr
    }

    pub fn iter(&self) -> impl Iterator<Item = &VmInfo> {
        self.regions.values()
    }

    /// Deep copy for fork.
    pub fn copy(&self) -> Self {
        Self {
            regions: self.regions.clone(),
        }
    }

    pub fn clear(&mut self) {
        self.regions.clear();
    }

    /// Total mapped pages, for the ulimit check.
    pub fn pglen(&self) -> usize {
        self.regions.values().map(|vmi| vmi.pglen).sum()
    }
}

/// Everything the pmap lock protects.
pub struct Vm {
    pub region: VmRegion,
    /// Physical address of the root table.
    pub root: PhysFrame,
    pub mmap_cursor: VirtAddr,
}

impl Vm {
    pub fn new(root: PhysFrame) -> Self {
        Self {
            region: VmRegion::new(),
            root,
            mmap_cursor: VirtAddr::new(USERMIN),
        }
    }

    /// Install `frame` at `va`, taking a reference on it. `vempty` asserts
    /// the slot was empty; replacing an existing mapping invalidates the
    /// local TLB entry and drops the old frame's reference.
    pub fn page_insert(
        &mut self,
        va: VirtAddr,
        frame: PhysFrame,
        perms: PageTableFlags,
        vempty: bool,
    ) -> Result<()> {
        FRAME_ALLOCATOR.incref(frame);
        let pte = pagetable::walk(self.root, va)?;

        let mut old = None;
        if pte.is_present() {
            assert!(!vempty, "pte not empty");
            old = Some(pte.frame());
        }
        *pte = pagetable::PageTableEntry::new(frame, perms | PageTableFlags::PRESENT);
        if let Some(old) = old {
            pagetable::invlpg(va);
            FRAME_ALLOCATOR.decref(old);
        }
        Ok(())
    }

    /// Clear the mapping at `va`. The caller is responsible for the
    /// shootdown and for dropping the returned frame's reference afterwards.
    pub fn page_remove(&mut self, va: VirtAddr) -> Option<PhysFrame> {
        let pte = pagetable::lookup(self.root, va)?;
        if !pte.is_present() {
            return None;
        }
        let old = pte.frame();
        *pte = pagetable::PageTableEntry::EMPTY;
        pagetable::invlpg(va);
        Some(old)
    }

    /// Shoot down `[start, start + pgcount)` on the other CPUs if the
    /// process can be running there.
    pub fn tlbshoot(&self, start: VirtAddr, pgcount: usize, multi_threaded: bool) {
        if pgcount == 0 {
            return;
        }
        if multi_threaded {
            tlb::shoot(self.root, start, pgcount);
        }
    }

    /// The page-fault/COW engine. The hardware error code has been reduced
    /// to "was this a write"; user-mode was already checked (a kernel-mode
    /// fault arriving here is a kernel bug and panics in the trap path).
    ///
    /// The caller has verified that a region covers the address and that
    /// write faults hit a writable region.
    pub fn resolve_fault(
        &mut self,
        fault_addr: VirtAddr,
        is_write: bool,
        multi_threaded: bool,
    ) -> Result<()> {
        let pte = pagetable::walk(self.root, fault_addr)?;
        let flags = pte.flags();

        if (is_write && flags.contains(PageTableFlags::WASCOW))
            || (!is_write && flags.contains(PageTableFlags::PRESENT))
        {
            // Another thread faulted on the same page first.
            return Ok(());
        }

        let vmi = self
            .region
            .lookup(fault_addr)
            .ok_or(err!(Fault))?
            .clone();

        let mut perms = PageTableFlags::USER;
        if is_write {
            assert!(
                !flags.contains(PageTableFlags::WRITABLE),
                "impossible pte state {flags:?}"
            );

            // The new private copy; the source is the COW page, the zero
            // page or the file page, depending on how far this mapping got.
            let (kaddr, new_frame) = FRAME_ALLOCATOR.alloc_raw()?;
            let cow = flags.contains(PageTableFlags::COW);
            let src = if cow {
                phys_to_virt(pte.frame().start_address())
            } else {
                assert_eq!(pte.raw(), 0, "impossible pte state {flags:?}");
                match &vmi.kind {
                    VmKind::Anon => phys_to_virt(zero_frame().start_address()),
                    VmKind::File { .. } => vmi.file_page(fault_addr)?.kaddr,
                }
            };
            unsafe {
                core::ptr::copy_nonoverlapping(
                    src.as_ptr::<u8>(),
                    kaddr.as_mut_ptr::<u8>(),
                    PAGE_SIZE,
                );
            }

            perms |= PageTableFlags::WRITABLE | PageTableFlags::WASCOW;
            self.page_insert(fault_addr, new_frame, perms, !cow)?;
            if cow {
                // The old shared mapping may still be cached on other CPUs.
                self.tlbshoot(fault_addr, 1, multi_threaded);
            }
        } else {
            assert_eq!(pte.raw(), 0, "impossible pte state {flags:?}");
            let frame = match &vmi.kind {
                VmKind::Anon => zero_frame(),
                VmKind::File { .. } => vmi.file_page(fault_addr)?.frame,
            };
            if vmi.perms.contains(PageTableFlags::WRITABLE) {
                perms |= PageTableFlags::COW;
            }
            self.page_insert(fault_addr, frame, perms, true)?;
        }

        Ok(())
    }

    /// Resolve COW for a kernel write to user memory; mirrors the write
    /// fault the user would have taken.
    fn cowfault(&mut self, va: VirtAddr, multi_threaded: bool) -> Result<()> {
        if va.as_u64() < USERMIN {
            return Ok(());
        }
        if let Some(pte) = pagetable::lookup(self.root, va) {
            let flags = pte.flags();
            if flags.contains(PageTableFlags::PRESENT) && !flags.contains(PageTableFlags::COW) {
                return Ok(());
            }
        }
        if self.region.lookup(va).is_none() {
            return Ok(());
        }
        self.resolve_fault(va, true, multi_threaded)
    }

    /// A byte slice of the direct-mapped frame backing `va`, from `va` to
    /// the end of its page. `k2u` means the kernel writes and user memory is
    /// the destination, so COW must be resolved first. Faults the page in
    /// through the region map if it was not mapped yet.
    pub fn userdmap8(
        &mut self,
        va: VirtAddr,
        k2u: bool,
        multi_threaded: bool,
    ) -> Result<&'static mut [u8]> {
        ensure!(va.as_u64() >= USERMIN, Fault);
        if k2u {
            self.cowfault(va, multi_threaded)?;
        }

        let voff = usize_from(va.as_u64() & 0xfff);
        let mut pte = pagetable::lookup(self.root, va);
        if pte.as_ref().is_none_or(|pte| !pte.is_present()) {
            // The page may simply not have been faulted in yet.
            ensure!(self.region.lookup(va).is_some(), Fault);
            self.resolve_fault(va, false, multi_threaded)?;
            pte = pagetable::lookup(self.root, va);
        }
        let pte = pte.ok_or(err!(Fault))?;
        ensure!(pte.flags().contains(PageTableFlags::USER), Fault);

        let kaddr = phys_to_virt(pte.frame().start_address());
        let page = unsafe { core::slice::from_raw_parts_mut(kaddr.as_mut_ptr::<u8>(), PAGE_SIZE) };
        Ok(&mut page[voff..])
    }
}

// The user access layer: every entry point takes the pmap lock exactly once
// so concurrent fork/exec cannot change the mapping mid-copy.
impl Process {
    pub async fn k2user(&self, src: &[u8], uva: u64) -> Result<()> {
        check_user_address(VirtAddr::new(uva), src.len())?;
        let multi = self.thread_count() > 1;
        let mut vm = self.vm_lock().await;
        k2user_inner(&mut vm, src, uva, multi)
    }

    pub async fn user2k(&self, dst: &mut [u8], uva: u64) -> Result<()> {
        check_user_address(VirtAddr::new(uva), dst.len())?;
        let multi = self.thread_count() > 1;
        let mut vm = self.vm_lock().await;
        user2k_inner(&mut vm, dst, uva, multi)
    }

    /// Read a small little-endian integer of `n` bytes.
    pub async fn userreadn(&self, uva: u64, n: usize) -> Result<u64> {
        assert!(n <= 8, "large n");
        let mut buf = [0u8; 8];
        self.user2k(&mut buf[..n], uva).await?;
        Ok(u64::from_le_bytes(buf))
    }

    pub async fn userwriten(&self, uva: u64, n: usize, value: u64) -> Result<()> {
        assert!(n <= 8, "large n");
        self.k2user(&value.to_le_bytes()[..n], uva).await
    }

    /// Read a null-terminated string of at most `lenmax` bytes.
    pub async fn userstr(&self, uva: u64, lenmax: usize) -> Result<String> {
        let multi = self.thread_count() > 1;
        let mut vm = self.vm_lock().await;

        let mut bytes = Vec::new();
        let mut va = uva;
        loop {
            let chunk = vm.userdmap8(VirtAddr::new(va), false, multi)?;
            for &byte in chunk.iter() {
                if byte == 0 {
                    drop(vm);
                    return String::from_utf8(bytes).map_err(|_| err!(Inval));
                }
                ensure!(bytes.len() < lenmax, NameTooLong);
                bytes.push(byte);
            }
            va += u64::from_usize(chunk.len());
        }
    }

    /// Read a NULL-terminated vector of string pointers: at most 64 entries
    /// of at most 128 bytes each.
    pub async fn userargs(&self, uva: u64) -> Result<Vec<String>> {
        const MAX_ARGS: usize = 64;
        const MAX_ARG_LEN: usize = 128;

        if uva == 0 {
            return Ok(Vec::new());
        }

        let mut ptrs = Vec::new();
        for i in 0..=MAX_ARGS {
            ensure!(i < MAX_ARGS, NameTooLong);
            let ptr = self.userreadn(uva + u64::from_usize(i * 8), 8).await?;
            if ptr == 0 {
                break;
            }
            ptrs.push(ptr);
        }

        let mut args = Vec::with_capacity(ptrs.len());
        for ptr in ptrs {
            args.push(self.userstr(ptr, MAX_ARG_LEN).await?);
        }
        Ok(args)
    }

    pub async fn usermapped(&self, uva: u64, len: usize) -> bool {
        if check_user_address(VirtAddr::new(uva), len).is_err() {
            return false;
        }
        let vm = self.vm_lock().await;
        vm.region.lookup(VirtAddr::new(uva)).is_some()
    }
}

pub fn k2user_inner(vm: &mut Vm, src: &[u8], uva: u64, multi: bool) -> Result<()> {
    let mut off = 0;
    while off < src.len() {
        let chunk = vm.userdmap8(VirtAddr::new(uva + u64::from_usize(off)), true, multi)?;
        let n = cmp::min(chunk.len(), src.len() - off);
        chunk[..n].copy_from_slice(&src[off..off + n]);
        off += n;
    }
    Ok(())
}

pub fn user2k_inner(vm: &mut Vm, dst: &mut [u8], uva: u64, multi: bool) -> Result<()> {
    let mut off = 0;
    while off < dst.len() {
        let chunk = vm.userdmap8(VirtAddr::new(uva + u64::from_usize(off)), false, multi)?;
        let n = cmp::min(chunk.len(), dst.len() - off);
        dst[off..off + n].copy_from_slice(&chunk[..n]);
        off += n;
    }
    Ok(())
}

/// The uniform scatter interface fd operations consume for user data
/// transfer. Each chunk resolves pages under a single pmap-lock
/// acquisition; the kernel-backed variant serves in-kernel callers and
/// tests.
pub enum UserBuf<'a> {
    User {
        proc: &'a Process,
        va: u64,
        len: usize,
        off: usize,
    },
    Kernel {
        buf: &'a mut [u8],
        off: usize,
    },
}

impl<'a> UserBuf<'a> {
    pub fn new(proc: &'a Process, va: u64, len: usize) -> Self {
        Self::User {
            proc,
            va,
            len,
            off: 0,
        }
    }

    pub fn kernel(buf: &'a mut [u8]) -> Self {
        Self::Kernel { buf, off: 0 }
    }

    pub fn remain(&self) -> usize {
        match self {
            Self::User { len, off, .. } => len - off,
            Self::Kernel { buf, off } => buf.len() - off,
        }
    }

    /// Drain bytes out of the buffer into `dst`.
    pub async fn read(&mut self, dst: &mut [u8]) -> Result<usize> {
        match self {
            Self::User { proc, va, len, off } => {
                let n = cmp::min(dst.len(), *len - *off);
                let multi = proc.thread_count() > 1;
                let mut vm = proc.vm_lock().await;
                let mut done = 0;
                while done < n {
                    let chunk =
                        vm.userdmap8(VirtAddr::new(*va + u64::from_usize(*off)), false, multi)?;
                    let step = cmp::min(chunk.len(), n - done);
                    dst[done..done + step].copy_from_slice(&chunk[..step]);
                    done += step;
                    *off += step;
                }
                Ok(n)
            }
            Self::Kernel { buf, off } => {
                let n = cmp::min(dst.len(), buf.len() - *off);
                dst[..n].copy_from_slice(&buf[*off..*off + n]);
                *off += n;
                Ok(n)
            }
        }
    }

    /// Push bytes from `src` into the buffer.
    pub async fn write(&mut self, src: &[u8]) -> Result<usize> {
        match self {
            Self::User { proc, va, len, off } => {
                let n = cmp::min(src.len(), *len - *off);
                let multi = proc.thread_count() > 1;
                let mut vm = proc.vm_lock().await;
                let mut done = 0;
                while done < n {
                    let chunk =
                        vm.userdmap8(VirtAddr::new(*va + u64::from_usize(*off)), true, multi)?;
                    let step = cmp::min(chunk.len(), n - done);
                    chunk[..step].copy_from_slice(&src[done..done + step]);
                    done += step;
                    *off += step;
                }
                Ok(n)
            }
            Self::Kernel { buf, off } => {
                let n = cmp::min(src.len(), buf.len() - *off);
                buf[*off..*off + n].copy_from_slice(&src[..n]);
                *off += n;
                Ok(n)
            }
        }
    }
}

/// Debug aid: log the region map of a process.
pub fn dump_regions(region: &VmRegion) {
    for vmi in region.iter() {
        let kind = match vmi.kind {
            VmKind::Anon => "anon",
            VmKind::File { .. } => "file",
        };
        debug!(
            "  {:#x}..{:#x} {:?} {kind}",
            vmi.start.start_address().as_u64(),
            vmi.end().start_address().as_u64(),
            vmi.perms
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page(va: u64) -> Page {
        Page::containing_address(VirtAddr::new(va))
    }

    fn anon(start: u64, pages: usize) -> VmInfo {
        VmInfo::anon(
            page(start),
            pages,
            PageTableFlags::USER | PageTableFlags::WRITABLE,
        )
    }

    #[test]
    fn insert_and_lookup() {
        let mut region = VmRegion::new();
        region.insert(anon(USERMIN, 4));

        assert!(region.lookup(VirtAddr::new(USERMIN)).is_some());
        assert!(region.lookup(VirtAddr::new(USERMIN + 4 * 0x1000 - 1)).is_some());
        assert!(region.lookup(VirtAddr::new(USERMIN + 4 * 0x1000)).is_none());
        assert!(region.lookup(VirtAddr::new(USERMIN - 1)).is_none());
    }

    #[test]
    #[should_panic = "overlap"]
    fn overlapping_insert_is_fatal() {
        let mut region = VmRegion::new();
        region.insert(anon(USERMIN, 4));
        region.insert(anon(USERMIN + 3 * 0x1000, 1));
    }

    #[test]
    fn empty_finds_first_gap() {
        let mut region = VmRegion::new();
        region.insert(anon(USERMIN, 2));
        region.insert(anon(USERMIN + 4 * 0x1000, 2));

        // The two-page hole between the regions fits two pages.
        let addr = region.empty(VirtAddr::new(USERMIN), 2 * 0x1000);
        assert_eq!(addr.as_u64(), USERMIN + 2 * 0x1000);

        // Three pages only fit after the second region.
        let addr = region.empty(VirtAddr::new(USERMIN), 3 * 0x1000);
        assert_eq!(addr.as_u64(), USERMIN + 6 * 0x1000);
    }

    #[test]
    fn remove_splits_regions() {
        let mut region = VmRegion::new();
        region.insert(anon(USERMIN, 6));

        region.remove(VirtAddr::new(USERMIN + 2 * 0x1000), 2 * 0x1000);

        assert!(region.lookup(VirtAddr::new(USERMIN)).is_some());
        assert!(region.lookup(VirtAddr::new(USERMIN + 2 * 0x1000)).is_none());
        assert!(region.lookup(VirtAddr::new(USERMIN + 3 * 0x1000)).is_none());
        let tail = region.lookup(VirtAddr::new(USERMIN + 4 * 0x1000)).unwrap();
        assert_eq!(tail.pglen, 2);
        assert_eq!(region.pglen(), 4);
    }

    #[test]
    fn copy_is_deep() {
        let mut region = VmRegion::new();
        region.insert(anon(USERMIN, 2));
        let copied = region.copy();
        region.clear();
        assert_eq!(copied.pglen(), 2);
        assert_eq!(region.pglen(), 0);
    }

    #[test]
    fn kernel_userbuf_roundtrip() {
        let mut backing = [0u8; 8];
        let mut ub = UserBuf::kernel(&mut backing);
        assert_eq!(ub.remain(), 8);
        assert_eq!(crate::rt::block_on(ub.write(b"abc")).unwrap(), 3);
        assert_eq!(ub.remain(), 5);

        let mut ub = UserBuf::kernel(&mut backing);
        let mut out = [0u8; 3];
        assert_eq!(crate::rt::block_on(ub.read(&mut out)).unwrap(), 3);
        assert_eq!(&out, b"abc");
    }
}
