//! The console capability behind stdin/stdout/stderr. Output goes straight
//! to the serial sink; input arrives from the keyboard/serial daemon through
//! `push_input` and is handed out line-buffered.

use alloc::{boxed::Box, collections::VecDeque, sync::Arc, vec::Vec};

use async_trait::async_trait;
use warren_abi::stat::Stat;

use crate::{
    error::Result,
    fs::fd::{Fd, FdOps, FdPerms, PollMsg, Pollers, Ready},
    logging,
    rt::notify::Notify,
    spin::{lazy::Lazy, mutex::Mutex},
    user::memory::UserBuf,
};

/// Console device major number.
pub const D_CONSOLE: u64 = 1;

struct Input {
    bytes: VecDeque<u8>,
    pollers: Pollers,
}

static INPUT: Mutex<Input> = Mutex::new(Input {
    bytes: VecDeque::new(),
    pollers: Pollers::new(),
});
static INPUT_READY: Notify = Notify::new();

/// Feed keyboard/serial bytes into the console. Called by the input daemon
/// collaborator from its trap mailbox.
pub fn push_input(bytes: &[u8]) {
    let mut input = INPUT.lock();
    input.bytes.extend(bytes);
    input.pollers.wake_ready(Ready::READ);
    drop(input);
    INPUT_READY.notify();
}

struct ConsoleOps;

#[async_trait]
impl FdOps for ConsoleOps {
    fn close(&self) -> Result<()> {
        // The console outlives every process.
        Ok(())
    }

    fn reopen(&self) -> Result<()> {
        Ok(())
    }

    fn fstat(&self) -> Result<Stat> {
        Ok(Stat {
            dev: 0,
            ino: 0,
            mode: 0,
            size: 0,
            rdev: Stat::mkdev(D_CONSOLE, 0),
        })
    }

    async fn read(&self, dst: &mut UserBuf<'_>) -> Result<usize> {
        loop {
            let wait;
            {
                let mut input = INPUT.lock();
                if !input.bytes.is_empty() {
                    let n = core::cmp::min(dst.remain(), input.bytes.len());
                    let chunk: Vec<u8> = input.bytes.drain(..n).collect();
                    drop(input);
                    return dst.write(&chunk).await;
                }
                wait = INPUT_READY.wait();
            }
            wait.await;
        }
    }

    async fn write(&self, src: &mut UserBuf<'_>) -> Result<usize> {
        // Merge into one buffer so the console lock is taken once.
        let mut buf = alloc::vec![0; src.remain()];
        let n = src.read(&mut buf).await?;
        logging::write_console(&buf[..n]);
        Ok(n)
    }

    async fn pollone(&self, pm: PollMsg) -> Ready {
        let mut input = INPUT.lock();

        let mut r = Ready::empty();
        if pm.events.contains(Ready::READ) && !input.bytes.is_empty() {
            r |= Ready::READ;
        }
        if pm.events.contains(Ready::WRITE) {
            r |= Ready::WRITE;
        }

        if r.is_empty() && pm.dowait {
            input.pollers.add_poller(&pm);
        }
        r
    }

    fn fcntl(&self, _cmd: u64, _opt: u64) -> Result<i64> {
        Ok(0)
    }
}

static CONSOLE: Lazy<Arc<ConsoleOps>> = Lazy::new(|| Arc::new(ConsoleOps));

pub fn console_fd(perms: FdPerms) -> Fd {
    Fd::new(CONSOLE.clone(), perms)
}

/// The initial fd table: stdin, stdout, stderr on the console.
pub fn std_fd_table() -> crate::user::process::FdTable {
    let mut slots: Vec<Option<Fd>> = alloc::vec![None; 16];
    slots[0] = Some(console_fd(FdPerms::READ));
    slots[1] = Some(console_fd(FdPerms::WRITE));
    slots[2] = Some(console_fd(FdPerms::WRITE));
    crate::user::process::FdTable::with_slots(slots, 3)
}
