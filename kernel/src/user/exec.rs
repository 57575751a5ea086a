//! execv: replace the calling process's image. Everything up to the commit
//! point is revertible; once the old address space is freed the exec has
//! happened and only the register image remains to be written.

use alloc::{string::String, sync::Arc, vec, vec::Vec};

use bytemuck::{Pod, Zeroable};
use usize_conversions::{usize_from, FromUsize};
use warren_abi::{tf, OpenFlags};
use x86_64::{structures::paging::Page, VirtAddr};

use crate::{
    error::{bail, ensure, err, Result},
    exception::{TrapFrame, USER_CS, USER_DS},
    fs::{self, fd::FdPerms},
    memory::{
        frame::{FRAME_ALLOCATOR, PAGE_SIZE},
        pagetable::{self, PageTableFlags, USERMIN, USTACK_TOP},
    },
    time,
    user::{
        memory::{k2user_inner, round_up_page, Vm, VmInfo, VmRegion},
        process::Process,
    },
};

const ELF_MAGIC: [u8; 4] = [0x7f, b'E', b'L', b'F'];
const PT_LOAD: u32 = 1;
const PT_TLS: u32 = 7;
const PF_W: u32 = 2;

#[derive(Clone, Copy, Pod, Zeroable)]
#[repr(C)]
struct Elf64Ehdr {
    ident: [u8; 16],
    etype: u16,
    machine: u16,
    version: u32,
    entry: u64,
    phoff: u64,
    shoff: u64,
    flags: u32,
    ehsize: u16,
    phentsize: u16,
    phnum: u16,
    shentsize: u16,
    shnum: u16,
    shstrndx: u16,
}

#[derive(Clone, Copy, Pod, Zeroable)]
#[repr(C)]
struct Elf64Phdr {
    ptype: u32,
    flags: u32,
    offset: u64,
    vaddr: u64,
    paddr: u64,
    filesz: u64,
    memsz: u64,
    align: u64,
}

struct ElfImage {
    entry: u64,
    headers: Vec<Elf64Phdr>,
}

/// Verify the magic and that the header block we read actually covers the
/// ELF header and every program header.
fn parse_elf(block: &[u8]) -> Result<ElfImage> {
    ensure!(block.len() >= core::mem::size_of::<Elf64Ehdr>(), NoExec);
    ensure!(block[..4] == ELF_MAGIC, NoExec);

    let ehdr: Elf64Ehdr = bytemuck::pod_read_unaligned(&block[..core::mem::size_of::<Elf64Ehdr>()]);
    ensure!(usize::from(ehdr.ehsize) <= block.len(), NoExec);

    let phoff = usize_from(ehdr.phoff);
    let phentsize = usize::from(ehdr.phentsize);
    let phnum = usize::from(ehdr.phnum);
    ensure!(phentsize >= core::mem::size_of::<Elf64Phdr>(), NoExec);
    let phend = phoff
        .checked_add(phentsize.checked_mul(phnum).ok_or(err!(NoExec))?)
        .ok_or(err!(NoExec))?;
    ensure!(phend <= block.len(), NoExec);

    let headers = (0..phnum)
        .map(|i| {
            let off = phoff + i * phentsize;
            bytemuck::pod_read_unaligned(&block[off..off + core::mem::size_of::<Elf64Phdr>()])
        })
        .collect();

    Ok(ElfImage {
        entry: ehdr.entry,
        headers,
    })
}

/// Map one PT_LOAD segment: file-backed pages for the file-sized part,
/// anonymous pages for the bss, the partial bss page zeroed in place. The
/// entry page is faulted eagerly.
fn segload(vm: &mut Vm, entry: u64, hdr: &Elf64Phdr, fops: &Arc<dyn crate::fs::fd::FdOps>) -> Result<()> {
    ensure!(
        hdr.vaddr % PAGE_SIZE as u64 == hdr.offset % PAGE_SIZE as u64,
        NoExec
    );
    let mut perms = PageTableFlags::USER;
    if hdr.flags & PF_W != 0 {
        perms |= PageTableFlags::WRITABLE;
    }

    // The segment may share its first page with the previous one (a bss
    // landing mid-page). Copy that overlap by hand.
    let mut did = 0usize;
    if vm.region.lookup(VirtAddr::new(hdr.vaddr)).is_some() {
        let chunk = vm.userdmap8(VirtAddr::new(hdr.vaddr), true, false)?;
        let infos = fops.mmapi(usize_from(hdr.offset), 1)?;
        ensure!(!infos.is_empty(), NoExec);
        let src = unsafe {
            core::slice::from_raw_parts(infos[0].kaddr.as_ptr::<u8>(), PAGE_SIZE)
        };
        let src = &src[usize_from(hdr.vaddr) & 0xfff..];
        let n = chunk
            .len()
            .min(src.len())
            .min(usize_from(hdr.filesz));
        chunk[..n].copy_from_slice(&src[..n]);
        did = n;
    }

    let mut file_len = round_up_page(hdr.vaddr + hdr.filesz - u64::from_usize(did))
        - (hdr.vaddr & !(PAGE_SIZE as u64 - 1));
    if u64::from_usize(did) >= hdr.filesz {
        // The hand copy above consumed the whole file part.
        file_len = 0;
    }
    if file_len > 0 {
        let start = Page::containing_address(VirtAddr::new(hdr.vaddr + u64::from_usize(did)));
        vm.region.insert(VmInfo::file(
            start,
            usize_from(file_len) / PAGE_SIZE,
            perms,
            fops.clone(),
            usize_from(hdr.offset) + did,
        ));
    }

    // Fault the page at the entry point now; the first user instruction
    // fetch should not have to take the slow path.
    if (hdr.vaddr..hdr.vaddr + hdr.memsz).contains(&entry) {
        vm.resolve_fault(VirtAddr::new(entry), false, false)?;
    }

    if hdr.filesz == hdr.memsz {
        return Ok(());
    }

    // bss: zero the tail of the last file page, then back the rest with
    // anonymous pages.
    let mut bssva = hdr.vaddr + hdr.filesz;
    let mut bsslen = usize_from(hdr.memsz - hdr.filesz);
    if bssva % PAGE_SIZE as u64 != 0 {
        let chunk = vm.userdmap8(VirtAddr::new(bssva), true, false)?;
        let n = chunk.len().min(bsslen);
        chunk[..n].fill(0);
        bssva += u64::from_usize(n);
        bsslen -= n;
    }
    if bsslen > 0 {
        let pages = usize_from(round_up_page(u64::from_usize(bsslen))) / PAGE_SIZE;
        vm.region.insert(VmInfo::anon(
            Page::containing_address(VirtAddr::new(bssva)),
            pages,
            perms,
        ));
    }

    Ok(())
}

struct TlsImage {
    fresh: u64,
    thread0: u64,
    size: usize,
}

/// Reserve the read-only "fresh" TLS image and a COW thread-0 copy, then
/// fill the fresh image from the file.
fn load_tls(vm: &mut Vm, tls: &Elf64Phdr) -> Result<TlsImage> {
    let tlssize = usize_from(tls.memsz.next_multiple_of(8));
    let copylen = usize_from(tls.filesz);

    let len = usize_from(
        round_up_page(tls.vaddr + u64::from_usize(tlssize))
            - (tls.vaddr & !(PAGE_SIZE as u64 - 1)),
    );
    let pages = len / PAGE_SIZE;

    let fresh = vm.region.empty(VirtAddr::new(USERMIN), 2 * len);
    let thread0 = fresh + u64::from_usize(len);
    vm.region.insert(VmInfo::anon(
        Page::containing_address(fresh),
        pages,
        PageTableFlags::USER,
    ));
    vm.region.insert(VmInfo::anon(
        Page::containing_address(thread0),
        pages,
        PageTableFlags::USER | PageTableFlags::WRITABLE,
    ));

    for i in 0..pages {
        let (_kaddr, frame) = FRAME_ALLOCATOR.alloc_zeroed()?;
        let off = u64::from_usize(i * PAGE_SIZE);
        vm.page_insert(fresh + off, frame, PageTableFlags::USER, true)?;
        // Thread 0 shares the fresh image copy-on-write.
        vm.page_insert(
            thread0 + off,
            frame,
            PageTableFlags::USER | PageTableFlags::COW,
            true,
        )?;
    }

    // Copy the initialized TLS data out of the loaded segments.
    let mut copied = 0;
    while copied < copylen {
        let src_va = VirtAddr::new(tls.vaddr + u64::from_usize(copied));
        ensure!(vm.region.lookup(src_va).is_some(), NoExec);
        let vmi = vm.region.lookup(src_va).unwrap().clone();
        let info = match &vmi.kind {
            crate::user::memory::VmKind::File { .. } => vmi_file_page(&vmi, src_va)?,
            crate::user::memory::VmKind::Anon => bail!(NoExec),
        };
        let src = unsafe { core::slice::from_raw_parts(info.kaddr.as_ptr::<u8>(), PAGE_SIZE) };
        let src = &src[usize_from(src_va.as_u64()) & 0xfff..];

        let dst = vm.userdmap8(fresh + u64::from_usize(copied), true, false)?;
        let n = src.len().min(dst.len()).min(copylen - copied);
        dst[..n].copy_from_slice(&src[..n]);
        copied += n;
    }

    // The ABI points the tls register at the first word past the image.
    Ok(TlsImage {
        fresh: fresh.as_u64(),
        thread0: thread0.as_u64() + u64::from_usize(tlssize),
        size: tlssize,
    })
}

fn vmi_file_page(vmi: &VmInfo, va: VirtAddr) -> Result<crate::fs::fd::MmapInfo> {
    let crate::user::memory::VmKind::File { fops, foff, .. } = &vmi.kind else {
        bail!(Inval);
    };
    let page = Page::containing_address(va);
    let offset = foff + usize_from(page - vmi.start) * PAGE_SIZE;
    let mut infos = fops.mmapi(offset, 1)?;
    ensure!(!infos.is_empty(), Io);
    Ok(infos.remove(0))
}

/// Copy argv onto a dedicated read-only page; one page bounds the strings
/// plus the pointer vector.
fn insert_args(vm: &mut Vm, args: &[String]) -> Result<(usize, u64)> {
    let uva = vm.region.empty(VirtAddr::new(USERMIN), PAGE_SIZE);
    vm.region.insert(VmInfo::anon(
        Page::containing_address(uva),
        1,
        PageTableFlags::USER,
    ));
    let (_kaddr, frame) = FRAME_ALLOCATOR.alloc_zeroed()?;
    vm.page_insert(uva, frame, PageTableFlags::USER, true)?;

    let mut ptrs = Vec::with_capacity(args.len() + 1);
    let mut cnt = 0usize;
    for arg in args {
        ptrs.push(uva.as_u64() + u64::from_usize(cnt));
        let mut bytes = arg.as_bytes().to_vec();
        bytes.push(0);
        ensure!(cnt + bytes.len() <= PAGE_SIZE, Inval);
        k2user_inner(vm, &bytes, uva.as_u64() + u64::from_usize(cnt), false)?;
        cnt += bytes.len();
    }
    ptrs.push(0);

    let argstart = uva.as_u64() + u64::from_usize(cnt);
    let need = ptrs.len() * 8;
    ensure!(cnt + need <= PAGE_SIZE, Inval);
    for (i, ptr) in ptrs.iter().enumerate() {
        k2user_inner(
            vm,
            &ptr.to_le_bytes(),
            argstart + u64::from_usize(i * 8),
            false,
        )?;
    }
    Ok((args.len(), argstart))
}

struct NewImage {
    entry: u64,
    stack_top: u64,
    argc: usize,
    argv: u64,
    tls: TlsImage,
}

const STACK_PAGES: usize = 6;

fn load_image(vm: &mut Vm, path: &str, args: &[String], cwd_inode: u64) -> Result<NewImage> {
    // First block of the file: ELF header plus program headers.
    let file = fs::fs_open(path, OpenFlags::RDONLY, 0, cwd_inode, 0, 0)?;
    let res = (|| {
        let mut block = vec![0u8; 512];
        let infos = file.ops.mmapi(0, 1)?;
        ensure!(!infos.is_empty(), NoExec);
        let src = unsafe { core::slice::from_raw_parts(infos[0].kaddr.as_ptr::<u8>(), PAGE_SIZE) };
        block.copy_from_slice(&src[..512]);

        let elf = parse_elf(&block)?;

        // Load the segments and find the TLS template.
        let mut tls_hdr = None;
        for hdr in &elf.headers {
            if hdr.ptype == PT_TLS {
                tls_hdr = Some(*hdr);
            } else if hdr.ptype == PT_LOAD && hdr.vaddr >= USERMIN {
                segload(vm, elf.entry, hdr, &file.ops)?;
            }
        }

        let tls = match tls_hdr {
            Some(hdr) => load_tls(vm, &hdr)?,
            None => TlsImage {
                fresh: 0,
                thread0: 0,
                size: 0,
            },
        };

        // Map the stack below the fixed top: one guard page, then the stack
        // proper; the first stack page is faulted eagerly.
        let stksz = (STACK_PAGES + 1) * PAGE_SIZE;
        let base = vm.region.empty(
            VirtAddr::new(USTACK_TOP - u64::from_usize(stksz)),
            stksz,
        );
        vm.region.insert(VmInfo::anon(
            Page::containing_address(base),
            1,
            PageTableFlags::empty(),
        ));
        vm.region.insert(VmInfo::anon(
            Page::containing_address(base + u64::from_usize(PAGE_SIZE)),
            STACK_PAGES,
            PageTableFlags::USER | PageTableFlags::WRITABLE,
        ));
        let stack_top = base + u64::from_usize(stksz);
        let (_kaddr, frame) = FRAME_ALLOCATOR.alloc_zeroed()?;
        vm.page_insert(
            stack_top - u64::from_usize(PAGE_SIZE),
            frame,
            PageTableFlags::USER | PageTableFlags::WRITABLE,
            true,
        )?;

        let (argc, argv) = insert_args(vm, args)?;

        Ok(NewImage {
            entry: elf.entry,
            stack_top: stack_top.as_u64(),
            argc,
            argv,
            tls,
        })
    })();

    crate::fs::fd::close_panic(&file);
    res
}

/// Replace the process image. Only the calling thread may exist.
pub async fn execv(
    proc: &Arc<Process>,
    tf: &mut TrapFrame,
    path: String,
    args: Vec<String>,
) -> Result<()> {
    // A multithreaded exec would have to tear the other threads down first;
    // the core does not support it.
    assert_eq!(proc.thread_count(), 1, "exec with many threads");

    let cwd_inode = {
        let cwd = proc.cwd.lock();
        cwd.as_ref()
            .and_then(|fd| fd.ops.pathi().ok())
            .unwrap_or(0)
    };

    let mut vm = proc.vm_lock().await;

    // Snapshot the old trackers; everything before the commit point rolls
    // back onto them.
    let old_region = core::mem::replace(&mut vm.region, VmRegion::new());
    let old_root = vm.root;
    let new_root = pagetable::new_root()?;
    vm.root = new_root;

    let image = match load_image(&mut vm, &path, &args, cwd_inode) {
        Ok(image) => image,
        Err(error) => {
            vm.root = old_root;
            vm.region = old_region;
            pagetable::decref_root(new_root);
            return Err(error);
        }
    };

    // The exec succeeds now: free the old address space.
    pagetable::decref_root(old_root);
    drop(old_region);
    proc.publish_root(new_root);
    vm.mmap_cursor = VirtAddr::new(USERMIN);
    drop(vm);

    // Close fds marked close-on-exec.
    {
        let mut fds = proc.fds.lock().await;
        for (_, slot) in fds.iter_mut() {
            let cloexec = slot
                .as_ref()
                .is_some_and(|fd| fd.perms.contains(FdPerms::CLOEXEC));
            if cloexec {
                let fd = slot.take().unwrap();
                crate::fs::fd::close_panic(&fd);
            }
        }
    }

    // The startup descriptor: fresh TLS base, TLS size, thread-0 TLS
    // pointer, picoseconds per cycle. The tls register points at the third
    // word so %fs:0 reads the thread pointer.
    let mut descriptor = [0u8; 32];
    descriptor[0..8].copy_from_slice(&image.tls.fresh.to_le_bytes());
    descriptor[8..16].copy_from_slice(&(image.tls.size as u64).to_le_bytes());
    descriptor[16..24].copy_from_slice(&image.tls.thread0.to_le_bytes());
    descriptor[24..32].copy_from_slice(&time::ps_per_cycle().to_le_bytes());
    let bufdest = image.stack_top - 32;
    let tls0addr = bufdest + 16;
    proc.k2user(&descriptor, bufdest).await.expect("fresh stack page must be mapped");

    // Commit the register image.
    *tf = TrapFrame::ZERO;
    tf.0[tf::RSP] = bufdest;
    tf.0[tf::RIP] = image.entry;
    tf.0[tf::RFLAGS] = tf::FL_IF;
    tf.0[tf::CS] = u64::from(USER_CS);
    tf.0[tf::SS] = u64::from(USER_DS);
    tf.0[tf::RDI] = u64::from_usize(image.argc);
    tf.0[tf::RSI] = image.argv;
    tf.0[tf::RDX] = bufdest;
    tf.0[tf::FSBASE] = tls0addr;

    *proc.name.lock() = path;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ehdr_with(phnum: u16) -> Vec<u8> {
        let mut ehdr = Elf64Ehdr::zeroed();
        ehdr.ident[..4].copy_from_slice(&ELF_MAGIC);
        ehdr.ehsize = core::mem::size_of::<Elf64Ehdr>() as u16;
        ehdr.phoff = 64;
        ehdr.phentsize = core::mem::size_of::<Elf64Phdr>() as u16;
        ehdr.phnum = phnum;
        ehdr.entry = USERMIN + 0x100;
        let mut block = bytemuck::bytes_of(&ehdr).to_vec();
        block.resize(512, 0);
        block
    }

    #[test]
    fn rejects_bad_magic() {
        let block = [0u8; 512];
        assert!(parse_elf(&block).is_err());
    }

    #[test]
    fn parses_headers() {
        let mut block = ehdr_with(2);
        let mut phdr = Elf64Phdr::zeroed();
        phdr.ptype = PT_LOAD;
        phdr.vaddr = USERMIN;
        phdr.filesz = 0x1000;
        phdr.memsz = 0x2000;
        block[64..64 + 56].copy_from_slice(bytemuck::bytes_of(&phdr));
        phdr.ptype = PT_TLS;
        block[120..120 + 56].copy_from_slice(bytemuck::bytes_of(&phdr));

        let elf = parse_elf(&block).unwrap();
        assert_eq!(elf.headers.len(), 2);
        assert_eq!(elf.headers[0].ptype, PT_LOAD);
        assert_eq!(elf.headers[1].ptype, PT_TLS);
        assert_eq!(elf.entry, USERMIN + 0x100);
    }

    #[test]
    fn rejects_truncated_program_headers() {
        let mut block = ehdr_with(9);
        // 9 headers of 56 bytes do not fit in the 512-byte block.
        let ehdr: Elf64Ehdr =
            bytemuck::pod_read_unaligned(&block[..core::mem::size_of::<Elf64Ehdr>()]);
        assert!(usize_from(ehdr.phoff) + 9 * 56 > block.len());
        block[0] = 0x7f;
        assert!(parse_elf(&block).is_err());
    }
}
