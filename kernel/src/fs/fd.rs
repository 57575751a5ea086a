//! The fd capability object and the poll/readiness substrate. An `Fd`
//! bundles a capability (`FdOps`) with its permission bits; the underlying
//! object is refcounted solely through `reopen` and `close`. Threads and
//! processes may call a single fd's operations concurrently.

use alloc::{boxed::Box, string::String, sync::Arc, vec::Vec};
use core::{
    future::Future,
    pin::Pin,
    sync::atomic::{AtomicBool, Ordering},
    task::{Context, Poll},
};

use arrayvec::ArrayVec;
use async_trait::async_trait;
use bitflags::bitflags;
use futures::{
    future::{select, Either},
    task::AtomicWaker,
};
use warren_abi::stat::Stat;
use x86_64::{structures::paging::PhysFrame, VirtAddr};

use crate::{
    error::{bail, Result},
    fs::InodeCookie,
    time,
    user::{memory::UserBuf, process::Tid},
};

pub mod console;
pub mod pipe;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FdPerms: u32 {
        const READ = 0x1;
        const WRITE = 0x2;
        const CLOEXEC = 0x4;
    }
}

/// An fd table slot: capability object plus permission bits. Cloning shares
/// the capability without touching its refcount; `copyfd` is the only
/// sanctioned duplication path.
#[derive(Clone)]
pub struct Fd {
    pub ops: Arc<dyn FdOps>,
    pub perms: FdPerms,
}

impl Fd {
    pub fn new(ops: Arc<dyn FdOps>, perms: FdPerms) -> Self {
        Self { ops, perms }
    }
}

/// Duplicate an fd for fork or dup2. Fails if another thread is concurrently
/// closing the underlying object; the caller treats the slot as empty then.
pub fn copyfd(fd: &Fd) -> Result<Fd> {
    fd.ops.reopen()?;
    Ok(fd.clone())
}

/// Closing an fd the core owns must succeed.
pub fn close_panic(fd: &Fd) {
    fd.ops.close().expect("close of owned fd failed");
}

bitflags! {
    /// Device readiness bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Ready: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const ERROR = 1 << 2;
        const HUP = 1 << 3;
    }
}

/// The 1-buffered notification slot a polling thread parks on: an atomic
/// flag plus a single waker, so devices can complete the send without ever
/// blocking.
#[derive(Clone, Default)]
pub struct PollNotify(Arc<NotifySlot>);

#[derive(Default)]
struct NotifySlot {
    ready: AtomicBool,
    waker: AtomicWaker,
}

impl PollNotify {
    pub fn new() -> Self {
        Self::default()
    }

    /// Non-blocking send; coalesces with an undelivered notification.
    pub fn send(&self) {
        self.0.ready.store(true, Ordering::SeqCst);
        self.0.waker.wake();
    }

    fn take(&self) -> bool {
        self.0.ready.swap(false, Ordering::SeqCst)
    }

    fn wait(&self) -> NotifyWait<'_> {
        NotifyWait(self)
    }

    /// Park until notified or until the timeout fires. Returns true on
    /// timeout. `timeout_nanos` of `None` waits forever.
    pub async fn wait_timeout(&self, timeout_nanos: Option<u64>) -> bool {
        let Some(timeout) = timeout_nanos else {
            self.wait().await;
            return false;
        };

        let wait = self.wait();
        let sleep = time::sleep_until(time::now().saturating_add(timeout));
        futures::pin_mut!(wait);
        futures::pin_mut!(sleep);
        match select(wait, sleep).await {
            Either::Left(((), _)) => false,
            Either::Right(((), _)) => true,
        }
    }
}

struct NotifyWait<'a>(&'a PollNotify);

impl Future for NotifyWait<'_> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.0 .0.waker.register(cx.waker());
        if self.0.take() {
            Poll::Ready(())
        } else {
            Poll::Pending
        }
    }
}

/// What a thread executing poll(2) hands to each device.
#[derive(Clone)]
pub struct PollMsg {
    pub events: Ready,
    pub dowait: bool,
    pub tid: Tid,
    pub notify: PollNotify,
}

impl PollMsg {
    pub fn new(tid: Tid) -> Self {
        Self {
            events: Ready::empty(),
            dowait: false,
            tid,
            notify: PollNotify::new(),
        }
    }

    pub fn set(&mut self, events: Ready, dowait: bool) {
        self.events = events;
        self.dowait = dowait;
    }
}

/// Outstanding pollers of one object: a compact array of registered messages
/// and the OR-mask of everything anyone cares about.
pub const MAX_POLLERS: usize = 10;

#[derive(Default)]
pub struct Pollers {
    allmask: Ready,
    waiters: ArrayVec<PollMsg, MAX_POLLERS>,
}

impl Pollers {
    pub const fn new() -> Self {
        Self {
            allmask: Ready::empty(),
            waiters: ArrayVec::new_const(),
        }
    }

    /// Register a waiter, replacing any previous registration by the same
    /// thread. More than `MAX_POLLERS` simultaneous pollers is fatal.
    pub fn add_poller(&mut self, pm: &PollMsg) {
        self.allmask |= pm.events;
        if let Some(slot) = self.waiters.iter_mut().find(|w| w.tid == pm.tid) {
            *slot = pm.clone();
            return;
        }
        if self.waiters.try_push(pm.clone()).is_err() {
            panic!("more than {MAX_POLLERS} threads polling a single fd");
        }
    }

    /// Notify every waiter interested in `r` and drop them from the set; the
    /// mask is recomputed from the survivors.
    pub fn wake_ready(&mut self, r: Ready) {
        if (self.allmask & r).is_empty() {
            return;
        }
        let mut newallmask = Ready::empty();
        self.waiters.retain(|pm| {
            if !(pm.events & r).is_empty() {
                pm.notify.send();
                false
            } else {
                newallmask |= pm.events;
                true
            }
        });
        self.allmask = newallmask;
    }
}

/// A frame the file's backing object hands out for mapping.
#[derive(Clone, Copy)]
pub struct MmapInfo {
    pub kaddr: VirtAddr,
    pub frame: PhysFrame,
}

/// The capability interface behind every fd slot. Implementations must be
/// safe for concurrent use on a single fd. Blocking operations park
/// internally and honor their nonblocking flag.
#[async_trait]
pub trait FdOps: Send + Sync + 'static {
    /// Returns an errno on failure; the core panics if closing an fd it owns
    /// reports one.
    fn close(&self) -> Result<()>;

    /// Reference bump on the underlying object. Called with the fd-table
    /// lock held.
    fn reopen(&self) -> Result<()>;

    fn fstat(&self) -> Result<Stat>;

    fn lseek(&self, offset: i64, whence: u64) -> Result<i64> {
        let _ = (offset, whence);
        bail!(SPipe)
    }

    async fn read(&self, dst: &mut UserBuf<'_>) -> Result<usize> {
        let _ = dst;
        bail!(Inval)
    }

    async fn write(&self, src: &mut UserBuf<'_>) -> Result<usize> {
        let _ = src;
        bail!(Inval)
    }

    async fn pread(&self, dst: &mut UserBuf<'_>, offset: usize) -> Result<usize> {
        let _ = (dst, offset);
        bail!(SPipe)
    }

    async fn pwrite(&self, src: &mut UserBuf<'_>, offset: usize) -> Result<usize> {
        let _ = (src, offset);
        bail!(SPipe)
    }

    fn truncate(&self, len: u64) -> Result<()> {
        let _ = len;
        bail!(Inval)
    }

    /// Frames backing `[offset, offset + pages)` of the object. The exec
    /// path installs these directly; the core never copies file data for
    /// non-initial segments.
    fn mmapi(&self, offset: usize, pages: usize) -> Result<Vec<MmapInfo>> {
        let _ = (offset, pages);
        bail!(Inval)
    }

    /// The inode handle for relative path lookups.
    fn pathi(&self) -> Result<InodeCookie> {
        bail!(NotDir)
    }

    fn fullpath(&self) -> Result<String> {
        bail!(Inval)
    }

    // Socket operations; non-sockets take the defaults.

    async fn accept(&self, from: &mut UserBuf<'_>) -> Result<(Arc<dyn FdOps>, usize)> {
        let _ = from;
        bail!(NotSock)
    }

    fn bind(&self, addr: &[u8]) -> Result<()> {
        let _ = addr;
        bail!(NotSock)
    }

    async fn connect(&self, addr: &[u8]) -> Result<()> {
        let _ = addr;
        bail!(NotSock)
    }

    /// Listen changes the underlying socket type, so it returns new ops.
    fn listen(&self, backlog: usize) -> Result<Arc<dyn FdOps>> {
        let _ = backlog;
        bail!(NotSock)
    }

    async fn sendto(&self, src: &mut UserBuf<'_>, addr: &[u8], flags: u64) -> Result<usize> {
        let _ = (src, addr, flags);
        bail!(NotSock)
    }

    async fn recvfrom(
        &self,
        dst: &mut UserBuf<'_>,
        from: &mut UserBuf<'_>,
    ) -> Result<(usize, usize)> {
        let _ = (dst, from);
        bail!(NotSock)
    }

    fn getsockopt(&self, opt: u64, out: &mut UserBuf<'_>, len: usize) -> Result<usize> {
        let _ = (opt, out, len);
        bail!(NotSock)
    }

    /// Current readiness masked by `pm.events`. Registers `pm` for a
    /// notification only when nothing polled-for is currently true and
    /// `pm.dowait` is set.
    async fn pollone(&self, pm: PollMsg) -> Ready;

    fn fcntl(&self, cmd: u64, opt: u64) -> Result<i64> {
        let _ = (cmd, opt);
        bail!(NoSys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rt::block_on;

    fn msg(tid: Tid, events: Ready) -> PollMsg {
        let mut pm = PollMsg::new(tid);
        pm.set(events, true);
        pm
    }

    #[test]
    fn wake_ready_clears_matching_waiters() {
        let mut pollers = Pollers::new();
        let reader = msg(1, Ready::READ);
        let writer = msg(2, Ready::WRITE);
        pollers.add_poller(&reader);
        pollers.add_poller(&writer);

        pollers.wake_ready(Ready::READ);
        assert!(block_on(reader.notify.wait_timeout(Some(0))) == false);

        // The writer survived and the mask was recomputed: a second READ
        // wake finds no one.
        pollers.wake_ready(Ready::READ);
        assert_eq!(pollers.waiters.len(), 1);
        assert_eq!(pollers.allmask, Ready::WRITE);
    }

    #[test]
    fn add_poller_replaces_same_tid() {
        let mut pollers = Pollers::new();
        pollers.add_poller(&msg(7, Ready::READ));
        pollers.add_poller(&msg(7, Ready::WRITE));
        assert_eq!(pollers.waiters.len(), 1);
    }

    #[test]
    #[should_panic = "polling a single fd"]
    fn eleventh_poller_is_fatal() {
        let mut pollers = Pollers::new();
        for tid in 0..=MAX_POLLERS as u64 {
            pollers.add_poller(&msg(tid, Ready::READ));
        }
    }

    #[test]
    fn notify_slot_coalesces() {
        time::calibrate(3_000_000);
        let notify = PollNotify::new();
        notify.send();
        notify.send();
        assert!(!block_on(notify.wait_timeout(Some(0))));
        // Second wait times out: the flag was consumed.
        assert!(block_on(notify.wait_timeout(Some(time::NANOS_PER_MILLI))));
    }
}
