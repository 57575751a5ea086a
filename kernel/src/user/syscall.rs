//! Syscall dispatch and the in-core syscalls. Arguments arrive in the trap
//! frame registers; the result lands in RAX as a non-negative value or a
//! negative errno.

use alloc::{format, string::String, sync::Arc, vec, vec::Vec};

use log::{debug, info};
use usize_conversions::{usize_from, FromUsize};
use warren_abi::{
    fcntl, fork as forkflags, futex as futexno, mmap, poll as pollbits, rlimit, rusage, sysno, tf,
    wait as waitflags, ExitStatus, OpenFlags, NAME_MAX, SIGKILL,
};
use x86_64::VirtAddr;

use crate::{
    error::{bail, ensure, err, Result},
    exception::TrapFrame,
    fs::{
        self,
        fd::{copyfd, close_panic, Fd, FdPerms, PollMsg, Ready},
        fd::pipe,
    },
    memory::{
        frame::{FRAME_ALLOCATOR, PAGE_SIZE},
        pagetable::{self, PageTableFlags, USERMIN},
        tlb,
    },
    time,
    user::{
        exec, futex,
        memory::{round_up_page, UserBuf, Vm},
        process::{proc_check, proc_new, Process, Tid},
        thread,
        wait::ReapTarget,
    },
};

pub async fn dispatch(proc: &Arc<Process>, tid: Tid, tf: &mut TrapFrame) -> i64 {
    if proc.doomed() {
        // This process has been killed; finish the thread instead of
        // running the syscall.
        proc.thread_dead(tid, ExitStatus(0), false);
        return 0;
    }

    let sysno = tf.rax();
    let (a1, a2, a3, a4, a5) = tf.syscall_args();

    let res: Result<i64> = match sysno {
        sysno::READ => sys_read(proc, a1 as i64, a2, a3).await,
        sysno::WRITE => sys_write(proc, a1 as i64, a2, a3).await,
        sysno::OPEN => sys_open(proc, a1, a2, a3).await,
        sysno::CLOSE => sys_close(proc, a1 as i64).await,
        sysno::STAT => sys_stat(proc, a1, a2).await,
        sysno::FSTAT => sys_fstat(proc, a1 as i64, a2).await,
        sysno::POLL => sys_poll(proc, tid, a1, a2 as i64, a3 as i64).await,
        sysno::LSEEK => sys_lseek(proc, a1 as i64, a2 as i64, a3).await,
        sysno::MMAP => sys_mmap(proc, a1, a2, a3, a4, a5).await,
        sysno::MUNMAP => sys_munmap(proc, a1, a2).await,
        sysno::SIGACT => sys_sigaction(),
        sysno::ACCESS => sys_access(proc, a1, a2).await,
        sysno::DUP2 => sys_dup2(proc, a1 as i64, a2 as i64).await,
        sysno::PAUSE => sys_pause().await,
        sysno::GETPID => Ok(proc.pid() as i64),
        sysno::GETTID => Ok(tid as i64),
        sysno::SOCKET => sys_socket(a1, a2, a3),
        sysno::CONNECT => sys_connect(proc, a1 as i64, a2, a3).await,
        sysno::ACCEPT => sys_accept(proc, a1 as i64, a2, a3).await,
        sysno::SENDTO => sys_sendto(proc, a1 as i64, a2, a3, a4, a5).await,
        sysno::RECVFROM => sys_recvfrom(proc, a1 as i64, a2, a3, a4, a5).await,
        sysno::BIND => sys_bind(proc, a1 as i64, a2, a3).await,
        sysno::LISTEN => sys_listen(proc, a1 as i64, a2).await,
        sysno::GETSOCKOPT => sys_getsockopt(proc, a1 as i64, a2, a3, a4, a5).await,
        sysno::FORK => sys_fork(proc, tf, a1, a2).await,
        sysno::EXECV => sys_execv(proc, tf, a1, a2).await,
        sysno::EXIT => {
            let status = ExitStatus((a1 & 0xff) as u32 | ExitStatus::EXITED);
            sys_exit(proc, tid, status);
            Ok(0)
        }
        sysno::WAIT4 => sys_wait4(proc, tid, a1 as i64, a2, a3, a4).await,
        sysno::KILL => sys_kill(a1, a2),
        sysno::FCNTL => sys_fcntl(proc, a1 as i64, a2, a3).await,
        sysno::TRUNC => sys_truncate(proc, a1, a2).await,
        sysno::FTRUNC => sys_ftruncate(proc, a1 as i64, a2).await,
        sysno::GETCWD => sys_getcwd(proc, a1, a2).await,
        sysno::CHDIR => sys_chdir(proc, a1).await,
        sysno::RENAME => sys_rename(proc, a1, a2).await,
        sysno::MKDIR => sys_mkdir(proc, a1, a2).await,
        sysno::LINK => sys_link(proc, a1, a2).await,
        sysno::UNLINK => sys_unlink(proc, a1).await,
        sysno::GETTOD => sys_gettimeofday(proc, a1).await,
        sysno::GETRLMT => sys_getrlimit(proc, a1, a2).await,
        sysno::GETRUSG => sys_getrusage(proc, a1, a2).await,
        sysno::MKNOD => sys_mknod(proc, a1, a2, a3).await,
        sysno::SETRLMT => sys_setrlimit(proc, a1, a2).await,
        sysno::SYNC => fs::fs_sync().map(|()| 0),
        sysno::REBOOT => sys_reboot(),
        sysno::NANOSLEEP => sys_nanosleep(proc, a1, a2).await,
        sysno::PIPE2 => sys_pipe2(proc, a1, a2).await,
        sysno::PROF => {
            // Experimental profiling knobs; accepted and ignored.
            debug!("prof request {a1:#x} {a2:#x} {a3:#x} {a4:#x}");
            Ok(0)
        }
        sysno::INFO => {
            debug!("info request {a1}");
            Ok(0)
        }
        sysno::THREXIT => {
            proc.thread_dead(tid, ExitStatus((a1 & 0xff) as u32), false);
            Ok(0)
        }
        sysno::PREAD => sys_pread(proc, a1 as i64, a2, a3, a4).await,
        sysno::PWRITE => sys_pwrite(proc, a1 as i64, a2, a3, a4).await,
        sysno::FUTEX => sys_futex(proc, a1, a2, a3, a4, a5).await,
        _ => {
            info!("unexpected syscall {sysno}");
            sys_exit(proc, tid, ExitStatus::signaled(31));
            Ok(0)
        }
    };

    res.unwrap_or_else(|error| error.to_syscall())
}

pub fn sys_exit(proc: &Arc<Process>, tid: Tid, status: ExitStatus) {
    // Doom the other threads; they reap themselves at their next return to
    // userspace.
    proc.doom_all();
    proc.thread_dead(tid, status, true);
}

async fn fd_get(proc: &Process, fdn: i64) -> Result<Fd> {
    proc.fds.lock().await.get(fdn).ok_or(err!(BadF))
}

async fn sys_read(proc: &Arc<Process>, fdn: i64, bufp: u64, sz: u64) -> Result<i64> {
    if sz == 0 {
        return Ok(0);
    }
    let fd = fd_get(proc, fdn).await?;
    ensure!(fd.perms.contains(FdPerms::READ), Perm);

    let mut ub = UserBuf::new(proc, bufp, usize_from(sz));
    let read = fd.ops.read(&mut ub).await?;
    Ok(read as i64)
}

async fn sys_write(proc: &Arc<Process>, fdn: i64, bufp: u64, sz: u64) -> Result<i64> {
    if sz == 0 {
        return Ok(0);
    }
    let fd = fd_get(proc, fdn).await?;
    ensure!(fd.perms.contains(FdPerms::WRITE), Perm);

    let mut ub = UserBuf::new(proc, bufp, usize_from(sz));
    let wrote = fd.ops.write(&mut ub).await?;
    Ok(wrote as i64)
}

fn cwd_inode(proc: &Process) -> u64 {
    let cwd = proc.cwd.lock();
    cwd.as_ref()
        .and_then(|fd| fd.ops.pathi().ok())
        .unwrap_or(0)
}

async fn sys_open(proc: &Arc<Process>, pathn: u64, flags: u64, mode: u64) -> Result<i64> {
    let path = proc.userstr(pathn, NAME_MAX).await?;
    let flags = OpenFlags::from_bits_truncate(flags);

    let mut perms = if flags.contains(OpenFlags::RDWR) {
        FdPerms::READ | FdPerms::WRITE
    } else if flags.contains(OpenFlags::WRONLY) {
        FdPerms::WRITE
    } else {
        FdPerms::READ
    };
    if flags.contains(OpenFlags::CLOEXEC) {
        perms |= FdPerms::CLOEXEC;
    }

    let mut fd = fs::fs_open(&path, flags, mode, cwd_inode(proc), 0, 0)?;
    fd.perms = perms;

    let fdn = proc.fds.lock().await.insert(fd);
    Ok(fdn as i64)
}

async fn sys_close(proc: &Arc<Process>, fdn: i64) -> Result<i64> {
    let fd = proc.fds.lock().await.remove(fdn).ok_or(err!(BadF))?;
    fd.ops.close()?;
    Ok(0)
}

async fn sys_stat(proc: &Arc<Process>, pathn: u64, statn: u64) -> Result<i64> {
    let path = proc.userstr(pathn, NAME_MAX).await?;
    let stat = fs::fs_stat(&path, cwd_inode(proc))?;
    proc.k2user(bytemuck::bytes_of(&stat), statn).await?;
    Ok(0)
}

async fn sys_fstat(proc: &Arc<Process>, fdn: i64, statn: u64) -> Result<i64> {
    let fd = fd_get(proc, fdn).await?;
    let stat = fd.ops.fstat()?;
    proc.k2user(bytemuck::bytes_of(&stat), statn).await?;
    Ok(0)
}

// poll(2). The pollfd words pack the fd in the low 32 bits, the wanted
// events in bits 32..48 and the returned events in bits 48..64.

fn ready_to_revents(orig: u64, r: Ready) -> u64 {
    let inmask = pollbits::POLLIN | pollbits::POLLPRI;
    let outmask = pollbits::POLLOUT | pollbits::POLLWRBAND;

    let mut pbits = 0;
    if r.contains(Ready::READ) {
        pbits |= inmask;
    }
    if r.contains(Ready::WRITE) {
        pbits |= outmask;
    }
    if r.contains(Ready::HUP) {
        pbits |= pollbits::POLLHUP;
    }
    if r.contains(Ready::ERROR) {
        pbits |= pollbits::POLLERR;
    }

    let wantevents =
        ((orig >> 32) & 0xffff) | pollbits::POLLNVAL | pollbits::POLLERR | pollbits::POLLHUP;
    let revents = wantevents & pbits;
    orig | (revents << 48)
}

/// One scan over the pollfd array. Returns how many fds were ready and
/// whether revents were updated. Registrations stop once a ready fd was
/// found; the whole scan runs under the fd-table lock.
async fn check_fds(
    proc: &Arc<Process>,
    pm: &mut PollMsg,
    mut wait: bool,
    buf: &mut [u8],
    nfds: usize,
) -> Result<(i64, bool)> {
    let inmask = pollbits::POLLIN | pollbits::POLLPRI;
    let outmask = pollbits::POLLOUT | pollbits::POLLWRBAND;

    let mut readyfds = 0;
    let mut writeback = false;

    let fds = proc.fds.lock().await;
    for i in 0..nfds {
        let off = i * 8;
        let mut word = u64::from_le_bytes(buf[off..off + 8].try_into().unwrap());
        let fdn = word as u32 as i32;
        // Negative fds are to be ignored.
        if fdn < 0 {
            continue;
        }

        let Some(fd) = fds.get(i64::from(fdn)) else {
            word |= pollbits::POLLNVAL << 48;
            buf[off..off + 8].copy_from_slice(&word.to_le_bytes());
            writeback = true;
            continue;
        };

        let events = (word >> 32) & 0xffff;
        let mut pev = Ready::empty();
        if events & inmask != 0 {
            pev |= Ready::READ;
        }
        if events & outmask != 0 {
            pev |= Ready::WRITE;
        }
        if events & pollbits::POLLHUP != 0 {
            pev |= Ready::HUP;
        }
        // poll unconditionally reports errors and hangups.
        pev |= Ready::ERROR | Ready::HUP;

        pm.set(pev, wait);
        let devstatus = fd.ops.pollone(pm.clone()).await;
        if !devstatus.is_empty() {
            // At least one fd is ready; no need for further registrations.
            wait = false;
            let word = ready_to_revents(word, devstatus);
            buf[off..off + 8].copy_from_slice(&word.to_le_bytes());
            readyfds += 1;
            writeback = true;
        }
    }
    drop(fds);

    Ok((readyfds, writeback))
}

async fn sys_poll(
    proc: &Arc<Process>,
    tid: Tid,
    fdsn: u64,
    nfds: i64,
    timeout_ms: i64,
) -> Result<i64> {
    ensure!(nfds >= 0, Inval);
    ensure!(timeout_ms >= -1, Inval);
    let nfds = usize_from(nfds as u64);

    // Copy the pollfd array in to avoid per-word user access overhead.
    let mut buf = vec![0u8; nfds * 8];
    proc.user2k(&mut buf, fdsn).await?;

    let devwait = timeout_ms != 0;
    let mut pm = PollMsg::new(tid);

    let (readyfds, writeback) = check_fds(proc, &mut pm, devwait, &mut buf, nfds).await?;
    if writeback {
        proc.k2user(&buf, fdsn).await?;
    }
    if readyfds != 0 || !devwait {
        return Ok(readyfds);
    }

    // Nothing ready: park on the notify slot, with a deadline if requested.
    let timeout = (timeout_ms > 0).then(|| timeout_ms as u64 * time::NANOS_PER_MILLI);
    let timedout = pm.notify.wait_timeout(timeout).await;
    if timedout {
        return Ok(0);
    }

    // Harvest the final readiness set.
    let (readyfds, writeback) = check_fds(proc, &mut pm, false, &mut buf, nfds).await?;
    if writeback {
        proc.k2user(&buf, fdsn).await?;
    }
    assert!(readyfds >= 1, "woke up without a ready fd");
    Ok(readyfds)
}

async fn sys_lseek(proc: &Arc<Process>, fdn: i64, off: i64, whence: u64) -> Result<i64> {
    let fd = fd_get(proc, fdn).await?;
    fd.ops.lseek(off, whence)
}

async fn sys_mmap(
    proc: &Arc<Process>,
    addr: u64,
    len: u64,
    protflags: u64,
    _fd: u64,
    _offset: u64,
) -> Result<i64> {
    ensure!(len != 0, Inval);
    let prot = protflags >> 32;
    let flags = protflags as u32 as u64;

    // Only private anonymous mappings are supported here.
    ensure!(flags == mmap::MAP_PRIVATE | mmap::MAP_ANON, NoSys);
    if flags & mmap::MAP_FIXED != 0 && addr < USERMIN {
        bail!(Inval);
    }
    if prot == mmap::PROT_NONE {
        let vm = proc.vm_lock().await;
        return Ok(vm.mmap_cursor.as_u64() as i64);
    }

    let mut perms = PageTableFlags::USER;
    if prot & mmap::PROT_WRITE != 0 {
        perms |= PageTableFlags::WRITABLE;
    }
    let len = round_up_page(len);
    let pages = usize_from(len) / PAGE_SIZE;

    let mut vm = proc.vm_lock().await;
    let limit = proc.ulim.lock().pages;
    ensure!(pages + vm.region.pglen() <= limit, NoMem);

    let cursor = vm.mmap_cursor;
    let addr = vm.region.empty(cursor, usize_from(len));
    vm.region.insert(crate::user::memory::VmInfo::anon(
        x86_64::structures::paging::Page::containing_address(addr),
        pages,
        perms,
    ));
    vm.mmap_cursor = addr + len;

    // Back the mapping eagerly; the fault path never sees these pages until
    // fork demotes them.
    for i in 0..pages {
        let (_kaddr, frame) = FRAME_ALLOCATOR.alloc_zeroed()?;
        vm.page_insert(addr + u64::from_usize(i * PAGE_SIZE), frame, perms, true)?;
    }

    Ok(addr.as_u64() as i64)
}

async fn sys_munmap(proc: &Arc<Process>, addr: u64, len: u64) -> Result<i64> {
    ensure!(addr % PAGE_SIZE as u64 == 0, Inval);
    ensure!(addr >= USERMIN, Inval);

    let multi = proc.thread_count() > 1;
    let mut vm = proc.vm_lock().await;
    let len = round_up_page(len);

    let mut ret = Ok(0);
    let mut frames = Vec::new();
    let mut upto = 0usize;
    for i in (0..usize_from(len)).step_by(PAGE_SIZE) {
        let va = VirtAddr::new(addr + u64::from_usize(i));
        let Some(frame) = vm.page_remove(va) else {
            ret = Err(err!(Inval));
            break;
        };
        frames.push(frame);
        upto += PAGE_SIZE;
    }

    // Unmapped translations must be gone everywhere before the frames are
    // released.
    vm.tlbshoot(VirtAddr::new(addr), upto / PAGE_SIZE, multi);
    vm.region.remove(VirtAddr::new(addr), upto);
    for frame in frames {
        FRAME_ALLOCATOR.decref(frame);
    }
    ret
}

fn sys_sigaction() -> Result<i64> {
    // Signal delivery beyond termination is out of scope.
    bail!(NoSys)
}

async fn sys_access(proc: &Arc<Process>, pathn: u64, mode: u64) -> Result<i64> {
    let path = proc.userstr(pathn, NAME_MAX).await?;
    ensure!(mode != 0, Inval);
    let fd = fs::fs_open(&path, OpenFlags::RDONLY, 0, cwd_inode(proc), 0, 0)?;
    close_panic(&fd);
    Ok(0)
}

async fn sys_dup2(proc: &Arc<Process>, oldn: i64, newn: i64) -> Result<i64> {
    ensure!(newn >= 0, BadF);
    let newn = usize_from(newn as u64);
    ensure!(newn < 0x1000, BadF);

    let mut fds = proc.fds.lock().await;
    let old = fds.get(oldn).ok_or(err!(BadF))?;
    if oldn == newn as i64 {
        return Ok(newn as i64);
    }
    let copy = copyfd(&old)?;
    let displaced = fds.replace(newn, copy);
    drop(fds);

    if let Some(fd) = displaced {
        close_panic(&fd);
    }
    Ok(newn as i64)
}

async fn sys_pause() -> Result<i64> {
    // Nothing ever wakes a paused thread; it dies with its process.
    futures::future::pending::<()>().await;
    unreachable!()
}

// Fork. FORK_PROCESS duplicates the address space copy-on-write and
// snapshots the fd table; FORK_THREAD starts a new thread on a caller
// provided stack described by the 24-byte tfork record.

async fn sys_fork(proc: &Arc<Process>, tf: &TrapFrame, tforkp: u64, flags: u64) -> Result<i64> {
    let kind = flags & (forkflags::FORK_THREAD | forkflags::FORK_PROCESS);
    ensure!(
        kind == forkflags::FORK_THREAD || kind == forkflags::FORK_PROCESS,
        Inval
    );

    let mut chtf = *tf;
    chtf.0[tf::RAX] = 0;

    if kind == forkflags::FORK_PROCESS {
        // Snapshot the fd table under its lock; a concurrently closed fd
        // leaves a hole, which is fine since the parent no longer has it
        // either.
        let cfds = {
            let fds = proc.fds.lock().await;
            let mut slots = vec![None; fds.len()];
            for (i, slot) in fds.slots().iter().enumerate() {
                if let Some(fd) = slot {
                    if let Ok(copy) = copyfd(fd) {
                        slots[i] = Some(copy);
                    }
                }
            }
            crate::user::process::FdTable::with_slots(slots, 3)
        };

        let cwd = proc.cwd.lock().clone().expect("fork without cwd");
        let name = format!("{} [child]", *proc.name.lock());
        let child = proc_new(name, cwd, cfds, proc.own_wait.clone())?;
        proc.own_wait.start_proc(child.pid());

        // Duplicate the address space under the parent's pmap lock.
        {
            let mut pvm = proc.vm_lock().await;
            let mut cvm = child.vm_try_lock().expect("fresh child vm is contended");
            let doflush = vm_fork(&mut pvm, &mut cvm, VirtAddr::new(chtf.rsp()));
            if doflush {
                // Every demoted PTE may still be cached; flush the whole
                // pmap on every CPU that could hold it.
                tlb::shoot(pvm.root, VirtAddr::new(0), 1);
            }
        }

        let childtid = child.tid0();
        let pid = child.pid();
        thread::sched_add(child, childtid, chtf);
        return Ok(pid as i64);
    }

    // Thread fork: validate the tfork record {tcb, tidaddr, stack}.
    let tfork_size = 24;
    ensure!(proc.usermapped(tforkp, tfork_size).await, Fault);
    let tcb = proc.userreadn(tforkp, 8).await?;
    let tidaddr = proc.userreadn(tforkp + 8, 8).await?;
    let stack = proc.userreadn(tforkp + 16, 8).await?;

    let writetid = tidaddr != 0;
    if writetid {
        ensure!(proc.usermapped(tidaddr, 8).await, Fault);
    }
    if tcb != 0 {
        chtf.0[tf::FSBASE] = tcb;
    }
    ensure!(proc.usermapped(stack.wrapping_sub(8), 8).await, Fault);
    chtf.0[tf::RSP] = stack;

    let childtid = proc.tid_new();
    proc.own_wait.start_thread(childtid);

    if writetid {
        proc.userwriten(tidaddr, 8, childtid).await?;
    }

    thread::sched_add(proc.clone(), childtid, chtf);
    Ok(childtid as i64)
}

/// Clone the parent's address space into the child: copy the region map,
/// then demote every writable parent PTE to COW and mirror it into the
/// child, bumping the frame references. The child's stack page is faulted
/// immediately and the parent's stack page un-COWed so neither side takes a
/// fault storm on return.
///
/// Allocation failure mid-fork is fatal; there is no half-forked state to
/// back out to.
fn vm_fork(pvm: &mut Vm, cvm: &mut Vm, rsp: VirtAddr) -> bool {
    cvm.region = pvm.region.copy();

    let mut doflush = false;
    for vmi in pvm.region.iter() {
        for i in 0..vmi.pglen {
            let va = (vmi.start + u64::from_usize(i)).start_address();
            let Some(ppte) = pagetable::lookup(pvm.root, va) else {
                continue;
            };
            let flags = ppte.flags();
            if !flags.contains(PageTableFlags::PRESENT | PageTableFlags::USER) {
                continue;
            }

            let mut child_flags = flags;
            if flags.contains(PageTableFlags::WRITABLE) {
                child_flags.remove(PageTableFlags::WRITABLE | PageTableFlags::WASCOW);
                child_flags.insert(PageTableFlags::COW);
                *ppte = pagetable::PageTableEntry::new(ppte.frame(), child_flags);
                doflush = true;
            }

            FRAME_ALLOCATOR.incref(ppte.frame());
            let cpte =
                pagetable::walk(cvm.root, va).expect("out of frames while forking page tables");
            *cpte = pagetable::PageTableEntry::new(ppte.frame(), child_flags);
        }
    }

    // Parent and child both touch their stacks right away; resolve the COW
    // now and keep the parent's page writable.
    let Some(cpte) = pagetable::lookup(cvm.root, rsp) else {
        // RSP points into a guard page or an unfaulted region; let the
        // first touch fault it in lazily instead.
        debug!("fork with unmapped stack at {rsp:?}");
        return doflush;
    };
    if !cpte
        .flags()
        .contains(PageTableFlags::PRESENT | PageTableFlags::USER)
    {
        debug!("fork with unmapped stack at {rsp:?}");
        return doflush;
    }

    assert!(cvm.region.lookup(rsp).is_some(), "stack must be mapped");
    cvm.resolve_fault(rsp, true, false)
        .expect("out of frames while forking the stack");

    let ppte = pagetable::lookup(pvm.root, rsp).expect("child has stack but not parent");
    assert!(
        ppte.flags()
            .contains(PageTableFlags::PRESENT | PageTableFlags::USER),
        "child has stack but not parent"
    );
    let mut flags = ppte.flags();
    flags.remove(PageTableFlags::COW);
    flags.insert(PageTableFlags::WRITABLE | PageTableFlags::WASCOW);
    *ppte = pagetable::PageTableEntry::new(ppte.frame(), flags);

    doflush
}

async fn sys_execv(proc: &Arc<Process>, tf: &mut TrapFrame, pathn: u64, argn: u64) -> Result<i64> {
    let args = proc.userargs(argn).await?;
    let path = proc.userstr(pathn, NAME_MAX).await?;
    fs::check_path(&path)?;
    exec::execv(proc, tf, path, args).await?;
    Ok(0)
}

async fn sys_wait4(
    proc: &Arc<Process>,
    tid: Tid,
    wpid: i64,
    statusp: u64,
    options: u64,
    rusagep: u64,
) -> Result<i64> {
    ensure!(wpid != waitflags::WAIT_MYPGRP, NoSys);
    ensure!(options & (waitflags::WCONTINUED | waitflags::WUNTRACED) == 0, NoSys);
    // No waiting for yourself.
    ensure!(wpid != tid as i64, Child);

    let target = if wpid == waitflags::WAIT_ANY {
        ReapTarget::Any
    } else {
        ReapTarget::Id(wpid as u64)
    };
    let noblock = options & waitflags::WNOHANG != 0;

    let resp = proc.own_wait.reap(target, noblock).await?;

    if statusp != 0 {
        proc.userwriten(statusp, 4, u64::from(resp.status.0)).await?;
    }
    // Fold the child's usage into the running total.
    proc.catime.add(resp.atime);
    if rusagep != 0 {
        proc.k2user(&resp.atime.to_rusage(), rusagep).await?;
    }
    Ok(resp.id as i64)
}

fn sys_kill(pid: u64, sig: u64) -> Result<i64> {
    ensure!(sig == SIGKILL, Inval);
    let target = proc_check(pid).ok_or(err!(Srch))?;
    target.doom_all();
    Ok(0)
}

async fn sys_fcntl(proc: &Arc<Process>, fdn: i64, cmd: u64, opt: u64) -> Result<i64> {
    match cmd {
        fcntl::F_GETFD => {
            let fd = fd_get(proc, fdn).await?;
            Ok(i64::from(fd.perms.contains(FdPerms::CLOEXEC)))
        }
        fcntl::F_SETFD => {
            let mut fds = proc.fds.lock().await;
            let mut fd = fds.get(fdn).ok_or(err!(BadF))?;
            fd.perms.set(FdPerms::CLOEXEC, opt & 1 != 0);
            let perms = fd.perms;
            fds.set_perms(fdn, perms)?;
            Ok(0)
        }
        _ => {
            let fd = fd_get(proc, fdn).await?;
            fd.ops.fcntl(cmd, opt)
        }
    }
}

async fn sys_truncate(proc: &Arc<Process>, pathn: u64, newlen: u64) -> Result<i64> {
    let path = proc.userstr(pathn, NAME_MAX).await?;
    let fd = fs::fs_open(&path, OpenFlags::RDWR, 0, cwd_inode(proc), 0, 0)?;
    let res = fd.ops.truncate(newlen);
    close_panic(&fd);
    res.map(|()| 0)
}

async fn sys_ftruncate(proc: &Arc<Process>, fdn: i64, newlen: u64) -> Result<i64> {
    let fd = fd_get(proc, fdn).await?;
    fd.ops.truncate(newlen)?;
    Ok(0)
}

async fn sys_getcwd(proc: &Arc<Process>, bufn: u64, sz: u64) -> Result<i64> {
    let path = {
        let cwd = proc.cwd.lock();
        let fd = cwd.as_ref().ok_or(err!(BadF))?;
        fd.ops.fullpath()?
    };
    ensure!(path.len() + 1 <= usize_from(sz), Range);
    proc.k2user(path.as_bytes(), bufn).await?;
    proc.userwriten(bufn + u64::from_usize(path.len()), 1, 0).await?;
    Ok(0)
}

async fn sys_chdir(proc: &Arc<Process>, pathn: u64) -> Result<i64> {
    let path = proc.userstr(pathn, NAME_MAX).await?;
    let new_cwd = fs::fs_open(
        &path,
        OpenFlags::DIRECTORY,
        0,
        cwd_inode(proc),
        0,
        0,
    )?;

    let mut cwd = proc.cwd.lock();
    if let Some(old) = cwd.replace(new_cwd) {
        close_panic(&old);
    }
    Ok(0)
}

async fn sys_rename(proc: &Arc<Process>, oldn: u64, newn: u64) -> Result<i64> {
    let old = proc.userstr(oldn, NAME_MAX).await?;
    let new = proc.userstr(newn, NAME_MAX).await?;
    fs::fs_rename(&old, &new, cwd_inode(proc))?;
    Ok(0)
}

async fn sys_mkdir(proc: &Arc<Process>, pathn: u64, mode: u64) -> Result<i64> {
    let path = proc.userstr(pathn, NAME_MAX).await?;
    fs::fs_mkdir(&path, mode, cwd_inode(proc))?;
    Ok(0)
}

async fn sys_link(proc: &Arc<Process>, oldn: u64, newn: u64) -> Result<i64> {
    let old = proc.userstr(oldn, NAME_MAX).await?;
    let new = proc.userstr(newn, NAME_MAX).await?;
    fs::fs_link(&old, &new, cwd_inode(proc))?;
    Ok(0)
}

async fn sys_unlink(proc: &Arc<Process>, pathn: u64) -> Result<i64> {
    let path = proc.userstr(pathn, NAME_MAX).await?;
    fs::fs_unlink(&path, cwd_inode(proc))?;
    Ok(0)
}

async fn sys_mknod(proc: &Arc<Process>, pathn: u64, mode: u64, dev: u64) -> Result<i64> {
    let path = proc.userstr(pathn, NAME_MAX).await?;
    fs::fs_mknod(&path, mode, dev, cwd_inode(proc))?;
    Ok(0)
}

async fn sys_gettimeofday(proc: &Arc<Process>, timevaln: u64) -> Result<i64> {
    let now = time::now();
    let mut tv = [0u8; 16];
    tv[0..8].copy_from_slice(&(now / time::NANOS_PER_SEC).to_le_bytes());
    tv[8..16].copy_from_slice(&((now % time::NANOS_PER_SEC) / 1000).to_le_bytes());
    proc.k2user(&tv, timevaln).await?;
    Ok(0)
}

async fn sys_getrlimit(proc: &Arc<Process>, res: u64, rlpn: u64) -> Result<i64> {
    ensure!(res == rlimit::RLIMIT_NOFILE, NoSys);
    let cur = proc.ulim.lock().nofile;
    let mut rl = [0u8; 16];
    rl[0..8].copy_from_slice(&cur.to_le_bytes());
    rl[8..16].copy_from_slice(&rlimit::RLIM_INFINITY.to_le_bytes());
    proc.k2user(&rl, rlpn).await?;
    Ok(0)
}

async fn sys_setrlimit(proc: &Arc<Process>, res: u64, rlpn: u64) -> Result<i64> {
    ensure!(res == rlimit::RLIMIT_NOFILE, NoSys);
    let cur = proc.userreadn(rlpn, 8).await?;
    proc.ulim.lock().nofile = cur;
    Ok(0)
}

async fn sys_getrusage(proc: &Arc<Process>, who: u64, rusagep: u64) -> Result<i64> {
    let snapshot = match who {
        rusage::RUSAGE_SELF => proc.atime.snapshot(),
        rusage::RUSAGE_CHILDREN => proc.catime.snapshot(),
        _ => bail!(Inval),
    };
    proc.k2user(&snapshot.to_rusage(), rusagep).await?;
    Ok(0)
}

fn sys_reboot() -> Result<i64> {
    panic!("reboot requested");
}

async fn sys_nanosleep(proc: &Arc<Process>, sleeptsn: u64, _remaintsn: u64) -> Result<i64> {
    let secs = proc.userreadn(sleeptsn, 8).await?;
    let nsecs = proc.userreadn(sleeptsn + 8, 8).await?;
    ensure!((nsecs as i64) < 1_000_000_000, Inval);
    let total = secs
        .checked_mul(time::NANOS_PER_SEC)
        .and_then(|ns| ns.checked_add(nsecs))
        .ok_or(err!(Inval))?;
    time::sleep(total).await;
    Ok(0)
}

async fn sys_pipe2(proc: &Arc<Process>, pipen: u64, flags: u64) -> Result<i64> {
    let mut options = OpenFlags::empty();
    if flags & OpenFlags::NONBLOCK.bits() != 0 {
        options |= OpenFlags::NONBLOCK;
    }
    let cloexec = flags & OpenFlags::CLOEXEC.bits() != 0;

    let (mut rfd, mut wfd) = pipe::new_pair(options);
    if cloexec {
        rfd.perms |= FdPerms::CLOEXEC;
        wfd.perms |= FdPerms::CLOEXEC;
    }

    let (rfdn, wfdn) = {
        let mut fds = proc.fds.lock().await;
        (fds.insert(rfd), fds.insert(wfd))
    };

    let res = async {
        proc.userwriten(pipen, 4, rfdn as u64).await?;
        proc.userwriten(pipen + 4, 4, wfdn as u64).await?;
        Ok(0)
    }
    .await;

    if res.is_err() {
        // Unwind the table slots; both closes must succeed.
        let mut fds = proc.fds.lock().await;
        let rfd = fds.remove(rfdn as i64).expect("pipe fd vanished");
        let wfd = fds.remove(wfdn as i64).expect("pipe fd vanished");
        drop(fds);
        close_panic(&rfd);
        close_panic(&wfd);
    }
    res
}

async fn sys_pread(proc: &Arc<Process>, fdn: i64, bufn: u64, len: u64, offset: u64) -> Result<i64> {
    let fd = fd_get(proc, fdn).await?;
    let mut ub = UserBuf::new(proc, bufn, usize_from(len));
    let read = fd.ops.pread(&mut ub, usize_from(offset)).await?;
    Ok(read as i64)
}

async fn sys_pwrite(proc: &Arc<Process>, fdn: i64, bufn: u64, len: u64, offset: u64) -> Result<i64> {
    let fd = fd_get(proc, fdn).await?;
    let mut ub = UserBuf::new(proc, bufn, usize_from(len));
    let wrote = fd.ops.pwrite(&mut ub, usize_from(offset)).await?;
    Ok(wrote as i64)
}

async fn sys_futex(
    proc: &Arc<Process>,
    op: u64,
    futn: u64,
    fut2n: u64,
    aux: u64,
    timespecn: u64,
) -> Result<i64> {
    ensure!(op >= futexno::FUTEX_SLEEP && op <= futexno::FUTEX_LAST, Inval);

    let fut = futex::va_to_futex(proc, futn).await?;

    let deadline = if timespecn != 0 {
        let secs = proc.userreadn(timespecn, 8).await?;
        let nsecs = proc.userreadn(timespecn + 8, 8).await?;
        let duration = secs
            .checked_mul(time::NANOS_PER_SEC)
            .and_then(|ns| ns.checked_add(nsecs))
            .ok_or(err!(Inval))?;
        Some(time::now().saturating_add(duration))
    } else {
        None
    };

    let (ack, ack_rx) = crate::rt::oneshot::new();
    let cmd = match op {
        futexno::FUTEX_SLEEP => futex::FutexCmd::Sleep {
            expected: aux as u32,
            mem: futex::FutexMem::new(proc.clone(), futn),
            deadline,
            ack,
        },
        futexno::FUTEX_WAKE => futex::FutexCmd::Wake {
            count: aux as u32,
            ack,
        },
        futexno::FUTEX_CNDGIVE => {
            let other = futex::va_to_futex(proc, fut2n).await?;
            futex::FutexCmd::CndGive {
                other: other.cmd,
                ack,
            }
        }
        _ => bail!(Inval),
    };

    fut.cmd.send(cmd).map_err(|_| err!(Again))?;
    let ret = ack_rx.recv().await.map_err(|_| err!(Again))?;
    Ok(ret)
}

// Socket syscalls operate through the fd capability; the socket factory
// itself lives outside the core.

fn sys_socket(_domain: u64, _typ: u64, _proto: u64) -> Result<i64> {
    bail!(NoSys)
}

async fn copy_sockaddr(proc: &Arc<Process>, san: u64, sl: u64) -> Result<Vec<u8>> {
    ensure!(sl <= 64, NameTooLong);
    let mut buf = vec![0u8; usize_from(sl)];
    proc.user2k(&mut buf, san).await?;
    Ok(buf)
}

async fn sys_connect(proc: &Arc<Process>, fdn: i64, sockaddrn: u64, socklen: u64) -> Result<i64> {
    let fd = fd_get(proc, fdn).await?;
    let sabuf = copy_sockaddr(proc, sockaddrn, socklen).await?;
    fd.ops.connect(&sabuf).await?;
    Ok(0)
}

async fn sys_accept(proc: &Arc<Process>, fdn: i64, sockaddrn: u64, socklenn: u64) -> Result<i64> {
    let fd = fd_get(proc, fdn).await?;
    let addr_len = if socklenn != 0 {
        usize_from(proc.userreadn(socklenn, 8).await?)
    } else {
        0
    };
    let mut from = UserBuf::new(proc, sockaddrn, addr_len);
    let (ops, written) = fd.ops.accept(&mut from).await?;
    if socklenn != 0 {
        proc.userwriten(socklenn, 8, u64::from_usize(written)).await?;
    }

    let newfd = Fd::new(ops, FdPerms::READ | FdPerms::WRITE);
    let fdn = proc.fds.lock().await.insert(newfd);
    Ok(fdn as i64)
}

async fn sys_sendto(
    proc: &Arc<Process>,
    fdn: i64,
    bufn: u64,
    flaglen: u64,
    sockaddrn: u64,
    socklen: u64,
) -> Result<i64> {
    let fd = fd_get(proc, fdn).await?;
    ensure!(fd.perms.contains(FdPerms::WRITE), Perm);
    let len = flaglen as u32 as u64;
    let flags = flaglen >> 32;
    let sabuf = if sockaddrn != 0 {
        copy_sockaddr(proc, sockaddrn, socklen).await?
    } else {
        Vec::new()
    };
    let mut ub = UserBuf::new(proc, bufn, usize_from(len));
    let sent = fd.ops.sendto(&mut ub, &sabuf, flags).await?;
    Ok(sent as i64)
}

async fn sys_recvfrom(
    proc: &Arc<Process>,
    fdn: i64,
    bufn: u64,
    flaglen: u64,
    sockaddrn: u64,
    socklenn: u64,
) -> Result<i64> {
    let fd = fd_get(proc, fdn).await?;
    ensure!(fd.perms.contains(FdPerms::READ), Perm);
    let len = flaglen as u32 as u64;

    let addr_len = if socklenn != 0 {
        usize_from(proc.userreadn(socklenn, 8).await?)
    } else {
        0
    };
    let mut ub = UserBuf::new(proc, bufn, usize_from(len));
    let mut from = UserBuf::new(proc, sockaddrn, addr_len);
    let (received, addr_written) = fd.ops.recvfrom(&mut ub, &mut from).await?;
    if socklenn != 0 {
        proc.userwriten(socklenn, 8, u64::from_usize(addr_written)).await?;
    }
    Ok(received as i64)
}

async fn sys_bind(proc: &Arc<Process>, fdn: i64, sockaddrn: u64, socklen: u64) -> Result<i64> {
    let fd = fd_get(proc, fdn).await?;
    let sabuf = copy_sockaddr(proc, sockaddrn, socklen).await?;
    fd.ops.bind(&sabuf)?;
    Ok(0)
}

async fn sys_listen(proc: &Arc<Process>, fdn: i64, backlog: u64) -> Result<i64> {
    let mut fds = proc.fds.lock().await;
    let fd = fds.get(fdn).ok_or(err!(BadF))?;
    // Listen changes the underlying socket type; swap the ops in place.
    let new_ops = fd.ops.listen(usize_from(backlog))?;
    fds.replace(usize_from(fdn as u64), Fd::new(new_ops, fd.perms));
    Ok(0)
}

async fn sys_getsockopt(
    proc: &Arc<Process>,
    fdn: i64,
    level: u64,
    opt: u64,
    optvaln: u64,
    optlenn: u64,
) -> Result<i64> {
    ensure!(level == warren_abi::socket::SOL_SOCKET, OpNotSupp);
    let fd = fd_get(proc, fdn).await?;
    let optlen = usize_from(proc.userreadn(optlenn, 8).await?);
    let mut out = UserBuf::new(proc, optvaln, optlen);
    let written = fd.ops.getsockopt(opt, &mut out, optlen)?;
    proc.userwriten(optlenn, 8, u64::from_usize(written)).await?;
    Ok(0)
}

/// Build the very first user process. Called once at boot; the image comes
/// from the filesystem collaborator.
pub fn start_init_process(path: &'static str) {
    crate::rt::spawn(async move {
        let cwd = crate::fs::fd::console::console_fd(FdPerms::READ | FdPerms::WRITE);
        let fds = crate::fs::fd::console::std_fd_table();

        // Init's exit records land in a root wait set nobody reaps.
        let root_wait = Arc::new(crate::user::wait::WaitSet::new());
        root_wait.start_proc(1);

        let proc = proc_new(String::from(path), cwd, fds, root_wait)
            .expect("failed to create init process");
        assert_eq!(proc.pid(), 1, "init must be pid 1");

        let mut tf = TrapFrame::ZERO;
        exec::execv(&proc, &mut tf, String::from(path), vec![String::from(path)])
            .await
            .expect("failed to exec init");

        let tid0 = proc.tid0();
        thread::sched_add(proc, tid0, tf);
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn revents_reports_error_and_hup_unconditionally() {
        // Only POLLIN was requested, but a HUP must still be reported.
        let orig = pollbits::POLLIN << 32;
        let word = ready_to_revents(orig, Ready::HUP);
        assert_eq!((word >> 48) & pollbits::POLLHUP, pollbits::POLLHUP);
    }

    #[test]
    fn revents_masks_unrequested_events() {
        let orig = pollbits::POLLIN << 32;
        let word = ready_to_revents(orig, Ready::WRITE);
        assert_eq!(word >> 48, 0);
    }

    #[test]
    fn revents_maps_read_to_pollin() {
        let orig = pollbits::POLLIN << 32;
        let word = ready_to_revents(orig, Ready::READ);
        assert_eq!((word >> 48) & pollbits::POLLIN, pollbits::POLLIN);
    }
}
