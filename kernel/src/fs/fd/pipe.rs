//! Anonymous pipes: a 512-byte circular buffer, reader/writer open counts
//! and poll integration. Blocking read/write park on notifies inside the
//! operation; the buffer is released once both ends are closed.

use alloc::{boxed::Box, sync::Arc, vec, vec::Vec};
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use warren_abi::{fcntl, stat::Stat, OpenFlags};

use crate::{
    error::{bail, ensure, Result},
    fs::fd::{Fd, FdOps, FdPerms, PollMsg, Pollers, Ready},
    rt::{mutex::Mutex as AsyncMutex, notify::Notify},
    spin::mutex::Mutex,
    user::memory::UserBuf,
};

const PIPE_SIZE: usize = 512;

/// Fixed-capacity circular byte buffer. Storage is allocated on first use
/// and handed back once the pipe is fully closed.
struct CircBuf {
    buf: Vec<u8>,
    head: usize,
    tail: usize,
}

impl CircBuf {
    fn new() -> Self {
        Self {
            buf: Vec::new(),
            head: 0,
            tail: 0,
        }
    }

    fn ensure_storage(&mut self) {
        if self.buf.is_empty() {
            self.buf = vec![0; PIPE_SIZE];
        }
    }

    fn release(&mut self) {
        self.buf = Vec::new();
        self.head = 0;
        self.tail = 0;
    }

    fn used(&self) -> usize {
        self.head - self.tail
    }

    fn full(&self) -> bool {
        self.used() == PIPE_SIZE
    }

    fn empty(&self) -> bool {
        self.used() == 0
    }

    /// Move bytes from the user buffer into the pipe; returns how many fit.
    async fn copy_in(&mut self, src: &mut UserBuf<'_>) -> Result<usize> {
        self.ensure_storage();
        let mut copied = 0;
        while !self.full() && src.remain() > 0 {
            let idx = self.head % PIPE_SIZE;
            let end = core::cmp::min(PIPE_SIZE, idx + (PIPE_SIZE - self.used()));
            let n = src.read(&mut self.buf[idx..end]).await?;
            if n == 0 {
                break;
            }
            self.head += n;
            copied += n;
        }
        Ok(copied)
    }

    /// Move bytes out of the pipe into the user buffer.
    async fn copy_out(&mut self, dst: &mut UserBuf<'_>) -> Result<usize> {
        let mut copied = 0;
        while !self.empty() && dst.remain() > 0 {
            let idx = self.tail % PIPE_SIZE;
            let end = core::cmp::min(PIPE_SIZE, idx + self.used());
            let want = core::cmp::min(end - idx, dst.remain());
            let n = dst.write(&self.buf[idx..idx + want]).await?;
            if n == 0 {
                break;
            }
            self.tail += n;
            copied += n;
        }
        Ok(copied)
    }
}

struct Inner {
    cbuf: CircBuf,
    pollers: Pollers,
}

pub struct Pipe {
    inner: AsyncMutex<Inner>,
    readers: AtomicUsize,
    writers: AtomicUsize,
    closed: AtomicBool,
    /// Signaled when data arrives or the last writer leaves.
    readable: Notify,
    /// Signaled when space appears or the last reader leaves.
    writable: Notify,
}

impl Pipe {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: AsyncMutex::new(Inner {
                cbuf: CircBuf::new(),
                pollers: Pollers::new(),
            }),
            readers: AtomicUsize::new(1),
            writers: AtomicUsize::new(1),
            closed: AtomicBool::new(false),
            readable: Notify::new(),
            writable: Notify::new(),
        })
    }

    fn reopen(&self, rd: isize, wd: isize) {
        let add = |counter: &AtomicUsize, delta: isize| {
            if delta >= 0 {
                counter.fetch_add(delta as usize, Ordering::SeqCst) as isize + delta
            } else {
                counter.fetch_sub(delta.unsigned_abs(), Ordering::SeqCst) as isize + delta
            }
        };
        let readers = add(&self.readers, rd);
        let writers = add(&self.writers, wd);

        if readers == 0 && writers == 0 {
            self.closed.store(true, Ordering::SeqCst);
            // Hand the buffer back. The lock cannot be held for long: no fd
            // references the pipe anymore, only in-flight copies do.
            loop {
                if let Some(mut inner) = self.inner.try_lock() {
                    inner.cbuf.release();
                    break;
                }
                core::hint::spin_loop();
            }
        }
        // A vanished end readies the other side (EOF and EPIPE reporting).
        if writers == 0 {
            self.readable.notify();
        }
        if readers == 0 {
            self.writable.notify();
        }
    }

    async fn op_write(&self, src: &mut UserBuf<'_>, noblock: bool) -> Result<usize> {
        loop {
            let wait;
            {
                let mut inner = self.inner.lock().await;
                ensure!(!self.closed.load(Ordering::SeqCst), BadF);
                ensure!(self.readers.load(Ordering::SeqCst) > 0, Pipe);

                if !inner.cbuf.full() {
                    let n = inner.cbuf.copy_in(src).await?;
                    inner.pollers.wake_ready(Ready::READ);
                    drop(inner);
                    self.readable.notify();
                    return Ok(n);
                }

                if noblock {
                    bail!(Again);
                }
                // Register before releasing the lock so a racing read cannot
                // slip its notify in between.
                wait = self.writable.wait();
            }
            wait.await;
        }
    }

    async fn op_read(&self, dst: &mut UserBuf<'_>, noblock: bool) -> Result<usize> {
        loop {
            let wait;
            {
                let mut inner = self.inner.lock().await;
                ensure!(!self.closed.load(Ordering::SeqCst), BadF);

                if !inner.cbuf.empty() {
                    let n = inner.cbuf.copy_out(dst).await?;
                    inner.pollers.wake_ready(Ready::WRITE);
                    drop(inner);
                    self.writable.notify();
                    return Ok(n);
                }

                // Empty: EOF once the last writer is gone.
                if self.writers.load(Ordering::SeqCst) == 0 {
                    return Ok(0);
                }

                if noblock {
                    bail!(Again);
                }
                wait = self.readable.wait();
            }
            wait.await;
        }
    }

    async fn op_poll(&self, pm: PollMsg) -> Ready {
        let mut inner = self.inner.lock().await;

        if self.closed.load(Ordering::SeqCst) {
            return Ready::empty();
        }

        let writers = self.writers.load(Ordering::SeqCst);
        let readers = self.readers.load(Ordering::SeqCst);

        let mut r = Ready::empty();
        if pm.events.contains(Ready::READ) && (!inner.cbuf.empty() || writers == 0) {
            r |= Ready::READ;
        }
        if pm.events.contains(Ready::HUP) && writers == 0 {
            r |= Ready::HUP;
        } else if pm.events.contains(Ready::WRITE) && (!inner.cbuf.full() || readers == 0) {
            r |= Ready::WRITE;
        }

        if r.is_empty() && pm.dowait {
            inner.pollers.add_poller(&pm);
        }
        r
    }
}

struct PipeFops {
    pipe: Arc<Pipe>,
    writer: bool,
    options: Mutex<OpenFlags>,
}

#[async_trait]
impl FdOps for PipeFops {
    fn close(&self) -> Result<()> {
        if self.writer {
            self.pipe.reopen(0, -1);
        } else {
            self.pipe.reopen(-1, 0);
        }
        Ok(())
    }

    fn reopen(&self) -> Result<()> {
        if self.writer {
            self.pipe.reopen(0, 1);
        } else {
            self.pipe.reopen(1, 0);
        }
        Ok(())
    }

    fn fstat(&self) -> Result<Stat> {
        // Pipes report a pipe-device stat with no size.
        Ok(Stat {
            dev: Stat::mkdev(0, 0),
            ino: 0,
            mode: 0,
            size: 0,
            rdev: 0,
        })
    }

    async fn read(&self, dst: &mut UserBuf<'_>) -> Result<usize> {
        ensure!(!self.writer, BadF);
        let noblock = self.options.lock().contains(OpenFlags::NONBLOCK);
        self.pipe.op_read(dst, noblock).await
    }

    async fn write(&self, src: &mut UserBuf<'_>) -> Result<usize> {
        ensure!(self.writer, BadF);
        let noblock = self.options.lock().contains(OpenFlags::NONBLOCK);
        self.pipe.op_write(src, noblock).await
    }

    async fn pollone(&self, pm: PollMsg) -> Ready {
        self.pipe.op_poll(pm).await
    }

    fn fcntl(&self, cmd: u64, opt: u64) -> Result<i64> {
        match cmd {
            fcntl::F_GETFL => Ok(self.options.lock().bits() as i64),
            fcntl::F_SETFL => {
                *self.options.lock() = OpenFlags::from_bits_truncate(opt);
                Ok(0)
            }
            _ => bail!(Inval),
        }
    }
}

/// Build the two ends of a fresh pipe. Permission bits (and CLOEXEC) are the
/// caller's business.
pub fn new_pair(options: OpenFlags) -> (Fd, Fd) {
    let pipe = Pipe::new();
    let read_half = PipeFops {
        pipe: pipe.clone(),
        writer: false,
        options: Mutex::new(options),
    };
    let write_half = PipeFops {
        pipe,
        writer: true,
        options: Mutex::new(options),
    };
    (
        Fd::new(Arc::new(read_half), FdPerms::READ),
        Fd::new(Arc::new(write_half), FdPerms::WRITE),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rt::block_on;

    #[test]
    fn write_then_read() {
        let (rfd, wfd) = new_pair(OpenFlags::empty());

        let mut src = [0u8; 4];
        src.copy_from_slice(b"abc\n");
        let mut ub = UserBuf::kernel(&mut src);
        assert_eq!(block_on(wfd.ops.write(&mut ub)).unwrap(), 4);

        let mut dst = [0u8; 16];
        let mut ub = UserBuf::kernel(&mut dst);
        assert_eq!(block_on(rfd.ops.read(&mut ub)).unwrap(), 4);
        assert_eq!(&dst[..4], b"abc\n");
    }

    #[test]
    fn read_after_writer_close_is_eof() {
        let (rfd, wfd) = new_pair(OpenFlags::empty());

        let mut src = *b"xy";
        let mut ub = UserBuf::kernel(&mut src);
        block_on(wfd.ops.write(&mut ub)).unwrap();
        wfd.ops.close().unwrap();

        let mut dst = [0u8; 8];
        let mut ub = UserBuf::kernel(&mut dst);
        assert_eq!(block_on(rfd.ops.read(&mut ub)).unwrap(), 2);
        let mut ub = UserBuf::kernel(&mut dst);
        assert_eq!(block_on(rfd.ops.read(&mut ub)).unwrap(), 0);
    }

    #[test]
    fn write_to_widowed_pipe_fails() {
        let (rfd, wfd) = new_pair(OpenFlags::empty());
        rfd.ops.close().unwrap();

        let mut src = *b"x";
        let mut ub = UserBuf::kernel(&mut src);
        let err = block_on(wfd.ops.write(&mut ub)).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Pipe);
    }

    #[test]
    fn nonblocking_read_of_empty_pipe() {
        let (rfd, _wfd) = new_pair(OpenFlags::NONBLOCK);
        let mut dst = [0u8; 4];
        let mut ub = UserBuf::kernel(&mut dst);
        let err = block_on(rfd.ops.read(&mut ub)).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Again);
    }

    #[test]
    fn nonblocking_write_to_full_pipe() {
        let (_rfd, wfd) = new_pair(OpenFlags::NONBLOCK);
        let mut payload = [7u8; PIPE_SIZE];
        let mut ub = UserBuf::kernel(&mut payload);
        assert_eq!(block_on(wfd.ops.write(&mut ub)).unwrap(), PIPE_SIZE);

        let mut extra = [0u8; 1];
        let mut ub = UserBuf::kernel(&mut extra);
        let err = block_on(wfd.ops.write(&mut ub)).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Again);
    }

    #[test]
    fn poll_tracks_readability() {
        let (rfd, wfd) = new_pair(OpenFlags::empty());

        let mut pm = PollMsg::new(1);
        pm.set(Ready::READ, false);
        assert_eq!(block_on(rfd.ops.pollone(pm.clone())), Ready::empty());

        let mut src = *b"z";
        let mut ub = UserBuf::kernel(&mut src);
        block_on(wfd.ops.write(&mut ub)).unwrap();
        assert_eq!(block_on(rfd.ops.pollone(pm)), Ready::READ);
    }

    #[test]
    fn buffer_is_released_after_both_ends_close() {
        let pipe = Pipe::new();
        let rfd = PipeFops {
            pipe: pipe.clone(),
            writer: false,
            options: Mutex::new(OpenFlags::empty()),
        };
        let wfd = PipeFops {
            pipe: pipe.clone(),
            writer: true,
            options: Mutex::new(OpenFlags::empty()),
        };

        let mut src = *b"q";
        let mut ub = UserBuf::kernel(&mut src);
        block_on(wfd.write(&mut ub)).unwrap();
        assert!(!pipe.inner.try_lock().unwrap().cbuf.buf.is_empty());

        rfd.close().unwrap();
        wfd.close().unwrap();
        assert!(pipe.inner.try_lock().unwrap().cbuf.buf.is_empty());
    }
}
