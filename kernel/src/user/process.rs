//! The process/thread table: pid allocation, the per-process fd table, the
//! doomed flag, and the teardown path that publishes termination records to
//! the parent's wait set.

use alloc::{
    collections::{BTreeMap, BTreeSet},
    string::String,
    sync::Arc,
    vec::Vec,
};
use core::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};

use warren_abi::{rlimit::RLIM_INFINITY, ExitStatus};
use x86_64::structures::paging::PhysFrame;
use x86_64::PhysAddr;

use crate::{
    error::{err, Result},
    fs::fd::{close_panic, Fd},
    memory::pagetable,
    rt::mutex::{Mutex as AsyncMutex, MutexGuard as AsyncMutexGuard},
    spin::mutex::Mutex,
    user::{
        memory::Vm,
        wait::WaitSet,
    },
};

pub type Pid = u64;
pub type Tid = u64;

/// Thread CPU time credited at exit. Real per-thread accounting is not
/// wired up; the sentinel keeps rusage totals non-zero and deterministic.
const THREAD_EXIT_TIME_NS: i64 = 42;

/// Thread-safe user/system time accounting.
#[derive(Default)]
pub struct Account {
    userns: AtomicI64,
    sysns: AtomicI64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AccountSnapshot {
    pub userns: i64,
    pub sysns: i64,
}

impl Account {
    pub const fn new() -> Self {
        Self {
            userns: AtomicI64::new(0),
            sysns: AtomicI64::new(0),
        }
    }

    pub fn utadd(&self, delta: i64) {
        self.userns.fetch_add(delta, Ordering::Relaxed);
    }

    pub fn systadd(&self, delta: i64) {
        self.sysns.fetch_add(delta, Ordering::Relaxed);
    }

    pub fn add(&self, other: AccountSnapshot) {
        self.userns.fetch_add(other.userns, Ordering::Relaxed);
        self.sysns.fetch_add(other.sysns, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> AccountSnapshot {
        AccountSnapshot {
            userns: self.userns.load(Ordering::Relaxed),
            sysns: self.sysns.load(Ordering::Relaxed),
        }
    }
}

impl AccountSnapshot {
    /// The rusage record handed to userspace: user and system timevals.
    pub fn to_rusage(self) -> [u8; 32] {
        fn timeval(nanos: i64) -> (i64, i64) {
            (nanos / 1_000_000_000, (nanos % 1_000_000_000) / 1000)
        }

        let mut out = [0; 32];
        let (user_s, user_us) = timeval(self.userns);
        let (sys_s, sys_us) = timeval(self.sysns);
        out[0..8].copy_from_slice(&user_s.to_le_bytes());
        out[8..16].copy_from_slice(&user_us.to_le_bytes());
        out[16..24].copy_from_slice(&sys_s.to_le_bytes());
        out[24..32].copy_from_slice(&sys_us.to_le_bytes());
        out
    }

    pub fn combined(self, other: AccountSnapshot) -> AccountSnapshot {
        AccountSnapshot {
            userns: self.userns + other.userns,
            sysns: self.sysns + other.sysns,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Ulimit {
    /// Address space limit in pages.
    pub pages: usize,
    pub nofile: u64,
}

impl Ulimit {
    // 128 MiB of address space by default.
    pub const DEFAULT: Self = Self {
        pages: (1 << 27) / (1 << 12),
        nofile: RLIM_INFINITY,
    };
}

/// Per-process fd table. Every occupied slot owns its fd until closed;
/// mutations are serialized by the table lock, and `copyfd` runs under it
/// for the whole fork snapshot.
pub struct FdTable {
    slots: Vec<Option<Fd>>,
    /// Where to start scanning for a free slot.
    fdstart: usize,
}

impl FdTable {
    const INITIAL_SLOTS: usize = 16;

    pub fn new() -> Self {
        Self {
            slots: alloc::vec![None; Self::INITIAL_SLOTS],
            fdstart: 0,
        }
    }

    pub fn with_slots(slots: Vec<Option<Fd>>, fdstart: usize) -> Self {
        Self { slots, fdstart }
    }

    pub fn insert(&mut self, fd: Fd) -> usize {
        let mut fdn = self.fdstart;
        while fdn < self.slots.len() {
            if self.slots[fdn].is_none() {
                break;
            }
            fdn += 1;
        }
        if fdn == self.slots.len() {
            self.slots.resize(self.slots.len() * 2, None);
        }
        assert!(self.slots[fdn].is_none(), "new fd {fdn} exists");
        self.fdstart = fdn + 1;
        self.slots[fdn] = Some(fd);
        fdn
    }

    pub fn get(&self, fdn: i64) -> Option<Fd> {
        let fdn = usize::try_from(fdn).ok()?;
        self.slots.get(fdn)?.clone()
    }

    pub fn remove(&mut self, fdn: i64) -> Option<Fd> {
        let fdn = usize::try_from(fdn).ok()?;
        let fd = self.slots.get_mut(fdn)?.take()?;
        if fdn < self.fdstart {
            self.fdstart = fdn;
        }
        Some(fd)
    }

    /// Install at a specific slot, growing as needed; returns the previous
    /// occupant.
    pub fn replace(&mut self, fdn: usize, fd: Fd) -> Option<Fd> {
        if fdn >= self.slots.len() {
            self.slots.resize((fdn + 1).next_power_of_two(), None);
        }
        self.slots[fdn].replace(fd)
    }

    pub fn set_perms(&mut self, fdn: i64, perms: crate::fs::fd::FdPerms) -> Result<()> {
        let fdn = usize::try_from(fdn).map_err(|_| err!(BadF))?;
        let slot = self
            .slots
            .get_mut(fdn)
            .and_then(|slot| slot.as_mut())
            .ok_or(err!(BadF))?;
        slot.perms = perms;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(|slot| slot.is_none())
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (usize, &mut Option<Fd>)> {
        self.slots.iter_mut().enumerate()
    }

    pub fn slots(&self) -> &[Option<Fd>] {
        &self.slots
    }

    pub fn take_all(&mut self) -> Vec<Option<Fd>> {
        core::mem::take(&mut self.slots)
    }
}

impl Default for FdTable {
    fn default() -> Self {
        Self::new()
    }
}

pub struct Process {
    pid: Pid,
    tid0: Tid,
    pub name: Mutex<String>,

    /// The pmap lock: region map, page-table root and mmap cursor move
    /// together under it.
    vm: AsyncMutex<Vm>,
    /// Mirror of the root's physical address for lock-free reads on the
    /// userspace entry path; only exec rewrites it, under the pmap lock.
    root_paddr: AtomicU64,

    pub fds: AsyncMutex<FdTable>,
    /// Current working directory; serialized separately so chdir doesn't
    /// contend with fd traffic.
    pub cwd: Mutex<Option<Fd>>,
    pub ulim: Mutex<Ulimit>,

    /// Set when some path wants every thread gone at the next safe point.
    doomed: AtomicBool,
    exit_status: Mutex<ExitStatus>,
    threads: Mutex<BTreeSet<Tid>>,

    /// Wait records of this process's threads and children.
    pub own_wait: Arc<WaitSet>,
    /// The parent's wait set; the termination record goes here.
    pub parent_wait: Arc<WaitSet>,

    pub atime: Account,
    pub catime: Account,
}

static PROCESSES: Mutex<BTreeMap<Pid, Arc<Process>>> = Mutex::new(BTreeMap::new());
static ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Pids and tids come from the same sequence.
pub fn new_id() -> u64 {
    ID_COUNTER.fetch_add(1, Ordering::SeqCst) + 1
}

/// Create a process shell: fresh root (kernel entries seeded), the given fd
/// table snapshot and cwd, thread 0 registered. The caller schedules the
/// first thread.
pub fn proc_new(
    name: String,
    cwd: Fd,
    fds: FdTable,
    parent_wait: Arc<WaitSet>,
) -> Result<Arc<Process>> {
    cwd.ops.reopen().expect("cwd reopen must succeed");

    let root = pagetable::new_root()?;
    let pid = new_id();
    let tid0 = new_id();

    let process = Arc::new(Process {
        pid,
        tid0,
        name: Mutex::new(name),
        vm: AsyncMutex::new(Vm::new(root)),
        root_paddr: AtomicU64::new(root.start_address().as_u64()),
        fds: AsyncMutex::new(fds),
        cwd: Mutex::new(Some(cwd)),
        ulim: Mutex::new(Ulimit::DEFAULT),
        doomed: AtomicBool::new(false),
        exit_status: Mutex::new(ExitStatus(0)),
        threads: Mutex::new(BTreeSet::from([tid0])),
        own_wait: Arc::new(WaitSet::new()),
        parent_wait,
        atime: Account::new(),
        catime: Account::new(),
    });
    process.own_wait.start_thread(tid0);

    let old = PROCESSES.lock().insert(pid, process.clone());
    assert!(old.is_none(), "pid {pid} exists");

    Ok(process)
}

pub fn proc_get(pid: Pid) -> Arc<Process> {
    proc_check(pid).unwrap_or_else(|| panic!("no such pid {pid}"))
}

pub fn proc_check(pid: Pid) -> Option<Arc<Process>> {
    PROCESSES.lock().get(&pid).cloned()
}

pub fn proc_del(pid: Pid) {
    let old = PROCESSES.lock().remove(&pid);
    assert!(old.is_some(), "bad pid {pid}");
}

impl Process {
    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn tid0(&self) -> Tid {
        self.tid0
    }

    pub fn vm_lock(&self) -> crate::rt::mutex::LockFuture<'_, Vm> {
        self.vm.lock()
    }

    pub fn vm_try_lock(&self) -> Option<AsyncMutexGuard<'_, Vm>> {
        self.vm.try_lock()
    }

    /// The current root, readable without the pmap lock; the userspace entry
    /// path uses this every trip.
    pub fn root(&self) -> PhysFrame {
        PhysFrame::from_start_address(PhysAddr::new(self.root_paddr.load(Ordering::SeqCst)))
            .unwrap()
    }

    /// Publish a new root. Caller holds the pmap lock and has already
    /// updated `vm.root`.
    pub fn publish_root(&self, root: PhysFrame) {
        self.root_paddr
            .store(root.start_address().as_u64(), Ordering::SeqCst);
    }

    pub fn thread_count(&self) -> usize {
        self.threads.lock().len()
    }

    /// Allocate and register a new thread id.
    pub fn tid_new(&self) -> Tid {
        let tid = new_id();
        self.threads.lock().insert(tid);
        tid
    }

    /// Remove a thread that was never scheduled, like when fork fails.
    pub fn thread_del(&self, tid: Tid) {
        self.threads.lock().remove(&tid);
    }

    pub fn doomed(&self) -> bool {
        self.doomed.load(Ordering::SeqCst)
    }

    /// Bring down every thread at its next pass through the trap loop.
    pub fn doom_all(&self) {
        self.doomed.store(true, Ordering::SeqCst);
    }

    /// Whether `tid` should keep running. A doomed but live thread reaps
    /// itself here.
    pub fn resched(&self, tid: Tid) -> bool {
        let alive = self.threads.lock().contains(&tid);
        if alive && self.doomed() {
            self.reap_doomed(tid);
            return false;
        }
        alive
    }

    fn reap_doomed(&self, tid: Tid) {
        assert!(self.doomed(), "reap of undoomed thread");
        self.thread_dead(tid, ExitStatus(0), false);
    }

    /// Terminate a single thread; tears the process down when it was the
    /// last one.
    pub fn thread_dead(&self, tid: Tid, status: ExitStatus, use_status: bool) {
        let destroy;
        {
            let mut threads = self.threads.lock();
            threads.remove(&tid);
            destroy = threads.is_empty();
            if use_status {
                *self.exit_status.lock() = status;
            }
        }

        self.atime.utadd(THREAD_EXIT_TIME_NS);

        // Thread records carry no rusage.
        self.own_wait.put(tid, status, None);

        if destroy {
            self.terminate();
        }
    }

    /// Tear the process down. Must only run once no threads remain.
    fn terminate(&self) {
        assert_ne!(self.pid, 1, "killed init");
        assert_eq!(self.thread_count(), 0, "terminate with threads alive");

        // Close every fd. The table cannot be contended: no thread of this
        // process remains to race with.
        let mut fds = self
            .fds
            .try_lock()
            .expect("fd table contended at teardown");
        for slot in fds.take_all() {
            if let Some(fd) = slot {
                close_panic(&fd);
            }
        }
        drop(fds);

        if let Some(cwd) = self.cwd.lock().take() {
            close_panic(&cwd);
        }

        proc_del(self.pid);
        pagetable::decref_root(self.root());

        // Combine our usage with the accumulated child usage and publish
        // the exit record to the parent.
        let usage = self.atime.snapshot().combined(self.catime.snapshot());
        let status = *self.exit_status.lock();
        self.parent_wait.put(self.pid, status, Some(usage));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::fd::FdPerms;

    #[test]
    fn fd_table_reuses_lowest_free_slot() {
        let mut table = FdTable::new();
        let fd = crate::fs::fd::console::console_fd(FdPerms::READ);
        let a = table.insert(fd.clone());
        let b = table.insert(fd.clone());
        let c = table.insert(fd.clone());
        assert_eq!((a, b, c), (0, 1, 2));

        table.remove(1);
        assert_eq!(table.insert(fd.clone()), 1);
        assert_eq!(table.insert(fd), 3);
    }

    #[test]
    fn fd_table_grows() {
        let mut table = FdTable::new();
        let fd = crate::fs::fd::console::console_fd(FdPerms::READ);
        for _ in 0..FdTable::INITIAL_SLOTS + 1 {
            table.insert(fd.clone());
        }
        assert!(table.len() > FdTable::INITIAL_SLOTS);
    }

    #[test]
    fn rusage_encoding() {
        let snap = AccountSnapshot {
            userns: 2_500_000_000,
            sysns: 1_000,
        };
        let ru = snap.to_rusage();
        assert_eq!(i64::from_le_bytes(ru[0..8].try_into().unwrap()), 2);
        assert_eq!(i64::from_le_bytes(ru[8..16].try_into().unwrap()), 500_000);
        assert_eq!(i64::from_le_bytes(ru[16..24].try_into().unwrap()), 0);
        assert_eq!(i64::from_le_bytes(ru[24..32].try_into().unwrap()), 1);
    }

    #[test]
    fn ids_are_unique_and_shared_between_pids_and_tids() {
        let a = new_id();
        let b = new_id();
        assert!(b > a);
    }
}
