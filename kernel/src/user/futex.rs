//! The futex rendezvous. One actor task per user word, keyed by the word's
//! physical address so mappings shared through COW or shared memory alias
//! the same queue. The actor owns its sleeper queue and timeout list and
//! services commands over a channel; the value check happens inside the
//! actor, atomically against wakes.

use alloc::{collections::VecDeque, sync::Arc, vec::Vec};
use core::sync::atomic::{AtomicU32, Ordering};

use futures::future::{select, Either};
use log::debug;
use x86_64::VirtAddr;

use crate::{
    error::{ensure, err, Result},
    memory::pagetable::{self, phys_to_virt, PageTableFlags},
    rt::{self, mpsc, oneshot},
    spin::mutex::Mutex,
    time,
    user::process::Process,
};

/// An ack of 0 means "woken or did not sleep"; timeouts also ack 0 after
/// removing the waiter (timed out, not woken).
type Ack = oneshot::Sender<i64>;

pub enum FutexCmd {
    Sleep {
        expected: u32,
        mem: FutexMem,
        deadline: Option<u64>,
        ack: Ack,
    },
    Wake {
        count: u32,
        ack: Ack,
    },
    /// Broadcast-requeue: move this futex's entire sleep queue and timer
    /// list to another futex, avoiding the thundering herd after a condvar
    /// broadcast.
    CndGive {
        other: mpsc::Sender<FutexCmd>,
        ack: Ack,
    },
    /// Internal half of CndGive.
    CndTake {
        sleepers: Vec<Waiter>,
        timers: Vec<TimerEntry>,
        ack: Ack,
    },
}

pub struct Waiter {
    id: u64,
    ack: Ack,
}

pub struct TimerEntry {
    deadline: u64,
    waiter_id: u64,
}

/// Atomically load the user word: the pmap lock serializes the read against
/// fork/exec remapping it.
pub struct FutexMem {
    proc: Arc<Process>,
    uva: u64,
}

impl FutexMem {
    pub fn new(proc: Arc<Process>, uva: u64) -> Self {
        Self { proc, uva }
    }

    pub async fn load(&self) -> Result<u32> {
        let vm = self.proc.vm_lock().await;
        let phys = user_word_phys(&vm, self.uva)?;
        let kaddr = phys_to_virt(x86_64::PhysAddr::new(phys));
        let word = unsafe { &*kaddr.as_ptr::<AtomicU32>() };
        Ok(word.load(Ordering::SeqCst))
    }
}

fn user_word_phys(vm: &crate::user::memory::Vm, uva: u64) -> Result<u64> {
    let va = VirtAddr::new(uva);
    let pte = pagetable::lookup(vm.root, va).ok_or(err!(Fault))?;
    let flags = pte.flags();
    ensure!(
        flags.contains(PageTableFlags::PRESENT | PageTableFlags::USER),
        Fault
    );
    Ok(pte.frame().start_address().as_u64() + (uva & 0xfff))
}

#[derive(Clone)]
pub struct FutexHandle {
    pub cmd: mpsc::Sender<FutexCmd>,
    pub reopen: mpsc::Sender<i32>,
}

static ALL_FUTEXES: Mutex<alloc::collections::BTreeMap<u64, FutexHandle>> =
    Mutex::new(alloc::collections::BTreeMap::new());

/// Identify the futex behind a user virtual address.
pub async fn va_to_futex(proc: &Arc<Process>, uva: u64) -> Result<FutexHandle> {
    ensure!(uva % 4 == 0, Inval);
    let phys = {
        let vm = proc.vm_lock().await;
        user_word_phys(&vm, uva)?
    };
    Ok(futex_ensure(phys))
}

/// Look up or start the actor for a physical word address.
pub fn futex_ensure(key: u64) -> FutexHandle {
    let mut all = ALL_FUTEXES.lock();
    if let Some(handle) = all.get(&key) {
        return handle.clone();
    }

    let (cmd_tx, cmd_rx) = mpsc::new();
    let (reopen_tx, reopen_rx) = mpsc::new();
    let handle = FutexHandle {
        cmd: cmd_tx,
        reopen: reopen_tx,
    };
    all.insert(key, handle.clone());
    rt::spawn(futex_actor(key, cmd_rx, reopen_rx));
    handle
}

struct ActorState {
    sleepers: VecDeque<Waiter>,
    timers: Vec<TimerEntry>,
    next_waiter_id: u64,
}

impl ActorState {
    fn park(&mut self, ack: Ack, deadline: Option<u64>) {
        let id = self.next_waiter_id;
        self.next_waiter_id += 1;
        if let Some(deadline) = deadline {
            self.timers.push(TimerEntry {
                deadline,
                waiter_id: id,
            });
        }
        self.sleepers.push_back(Waiter { id, ack });
    }

    fn next_deadline(&self) -> Option<u64> {
        self.timers.iter().map(|timer| timer.deadline).min()
    }

    fn remove_timer(&mut self, waiter_id: u64) {
        self.timers.retain(|timer| timer.waiter_id != waiter_id);
    }

    /// Wake the frontmost sleeper; drops its timer entry first.
    fn wake_one(&mut self) -> bool {
        let Some(waiter) = self.sleepers.pop_front() else {
            return false;
        };
        self.remove_timer(waiter.id);
        let _ = waiter.ack.send(0);
        true
    }

    /// Deadline fired: pull the waiter out of both lists and ack zero.
    fn fire_deadlines(&mut self, now: u64) {
        let mut fired = Vec::new();
        self.timers.retain(|timer| {
            if timer.deadline <= now {
                fired.push(timer.waiter_id);
                false
            } else {
                true
            }
        });
        for id in fired {
            if let Some(pos) = self.sleepers.iter().position(|waiter| waiter.id == id) {
                let waiter = self.sleepers.remove(pos).unwrap();
                let _ = waiter.ack.send(0);
            }
        }
    }
}

async fn futex_actor(
    key: u64,
    mut cmd: mpsc::Receiver<FutexCmd>,
    mut reopen: mpsc::Receiver<i32>,
) {
    let mut state = ActorState {
        sleepers: VecDeque::new(),
        timers: Vec::new(),
        next_waiter_id: 0,
    };
    let mut opencount: i32 = 1;

    while opencount > 0 {
        // Race the command channel, the reopen channel and the earliest
        // deadline.
        let event = {
            let deadline = state.next_deadline();
            let cmd_fut = cmd.recv();
            let reopen_fut = reopen.recv();
            futures::pin_mut!(cmd_fut);
            futures::pin_mut!(reopen_fut);

            match deadline {
                Some(deadline) => {
                    let sleep = time::sleep_until(deadline);
                    futures::pin_mut!(sleep);
                    match select(select(cmd_fut, reopen_fut), sleep).await {
                        Either::Left((Either::Left((msg, _)), _)) => Event::Cmd(msg.ok()),
                        Either::Left((Either::Right((delta, _)), _)) => Event::Reopen(delta.ok()),
                        Either::Right(((), _)) => Event::Deadline,
                    }
                }
                None => match select(cmd_fut, reopen_fut).await {
                    Either::Left((msg, _)) => Event::Cmd(msg.ok()),
                    Either::Right((delta, _)) => Event::Reopen(delta.ok()),
                },
            }
        };

        match event {
            Event::Deadline => state.fire_deadlines(time::now()),
            Event::Reopen(None) | Event::Cmd(None) => break,
            Event::Reopen(Some(delta)) => opencount += delta,
            Event::Cmd(Some(FutexCmd::Sleep {
                expected,
                mem,
                deadline,
                ack,
            })) => {
                match mem.load().await {
                    Err(error) => {
                        let _ = ack.send(error.to_syscall());
                    }
                    Ok(value) if value != expected => {
                        // The owner just changed the word; don't sleep.
                        let _ = ack.send(0);
                    }
                    Ok(_) => state.park(ack, deadline),
                }
            }
            Event::Cmd(Some(FutexCmd::Wake { count, ack })) => {
                let mut woken = 0;
                while woken < count && state.wake_one() {
                    woken += 1;
                }
                let _ = ack.send(i64::from(woken));
            }
            Event::Cmd(Some(FutexCmd::CndGive { other, ack })) => {
                if state.sleepers.is_empty() {
                    let _ = ack.send(0);
                    continue;
                }

                let sleepers = core::mem::take(&mut state.sleepers).into_iter().collect();
                let timers = core::mem::take(&mut state.timers);
                let (pack_tx, pack_rx) = oneshot::new();
                let res = other.send(FutexCmd::CndTake {
                    sleepers,
                    timers,
                    ack: pack_tx,
                });

                match res {
                    Ok(()) => {
                        // Only a confirmed take clears us for good.
                        let _ = pack_rx.recv().await;
                        let _ = ack.send(0);
                    }
                    Err(mpsc::SendError(FutexCmd::CndTake { sleepers, timers, .. })) => {
                        state.sleepers = sleepers.into_iter().collect();
                        state.timers = timers;
                        let _ = ack.send(err!(Inval).to_syscall());
                    }
                    Err(_) => unreachable!(),
                }
            }
            Event::Cmd(Some(FutexCmd::CndTake {
                sleepers,
                timers,
                ack,
            })) => {
                state.sleepers.extend(sleepers);
                state.timers.extend(timers);
                let _ = ack.send(0);
            }
        }
    }

    debug!("futex actor for {key:#x} shutting down");
    ALL_FUTEXES.lock().remove(&key);
}

enum Event {
    Cmd(Option<FutexCmd>),
    Reopen(Option<i32>),
    Deadline,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rt::block_on;

    fn drain_rt() {
        while rt::poll() {}
    }

    #[test]
    fn wake_with_no_sleepers_wakes_nobody() {
        let handle = futex_ensure(0x9000);
        let (ack, rx) = oneshot::new();
        handle.cmd.send(FutexCmd::Wake { count: 1, ack }).unwrap();
        drain_rt();
        assert_eq!(block_on(rx.recv()).unwrap(), 0);
    }

    #[test]
    fn cnd_take_appends_sleepers() {
        let handle = futex_ensure(0x9100);

        // Inject two parked waiters through the internal take command.
        let (w1_tx, w1_rx) = oneshot::new();
        let (w2_tx, w2_rx) = oneshot::new();
        let (ack, ack_rx) = oneshot::new();
        handle
            .cmd
            .send(FutexCmd::CndTake {
                sleepers: alloc::vec![
                    Waiter { id: 1, ack: w1_tx },
                    Waiter { id: 2, ack: w2_tx },
                ],
                timers: Vec::new(),
                ack,
            })
            .unwrap();
        drain_rt();
        assert_eq!(block_on(ack_rx.recv()).unwrap(), 0);

        // Wake them in FIFO order.
        let (ack, ack_rx) = oneshot::new();
        handle.cmd.send(FutexCmd::Wake { count: 1, ack }).unwrap();
        drain_rt();
        assert_eq!(block_on(ack_rx.recv()).unwrap(), 1);
        assert_eq!(block_on(w1_rx.recv()).unwrap(), 0);

        let (ack, ack_rx) = oneshot::new();
        handle
            .cmd
            .send(FutexCmd::Wake {
                count: u32::MAX,
                ack,
            })
            .unwrap();
        drain_rt();
        assert_eq!(block_on(ack_rx.recv()).unwrap(), 1);
        assert_eq!(block_on(w2_rx.recv()).unwrap(), 0);
    }

    #[test]
    fn cnd_give_requeues_to_the_other_actor() {
        let giver = futex_ensure(0x9200);
        let taker = futex_ensure(0x9300);

        let (w_tx, w_rx) = oneshot::new();
        let (ack, ack_rx) = oneshot::new();
        giver
            .cmd
            .send(FutexCmd::CndTake {
                sleepers: alloc::vec![Waiter { id: 5, ack: w_tx }],
                timers: Vec::new(),
                ack,
            })
            .unwrap();
        drain_rt();
        block_on(ack_rx.recv()).unwrap();

        let (ack, ack_rx) = oneshot::new();
        giver
            .cmd
            .send(FutexCmd::CndGive {
                other: taker.cmd.clone(),
                ack,
            })
            .unwrap();
        drain_rt();
        assert_eq!(block_on(ack_rx.recv()).unwrap(), 0);

        // The waiter now wakes from the taker, not the giver.
        let (ack, ack_rx) = oneshot::new();
        taker.cmd.send(FutexCmd::Wake { count: 1, ack }).unwrap();
        drain_rt();
        assert_eq!(block_on(ack_rx.recv()).unwrap(), 1);
        assert_eq!(block_on(w_rx.recv()).unwrap(), 0);
    }

    #[test]
    fn deadline_fires_and_acks_zero() {
        time::calibrate(3_000_000);
        let handle = futex_ensure(0x9400);

        let (w_tx, w_rx) = oneshot::new();
        let (ack, ack_rx) = oneshot::new();
        handle
            .cmd
            .send(FutexCmd::CndTake {
                sleepers: alloc::vec![Waiter { id: 9, ack: w_tx }],
                timers: alloc::vec![TimerEntry {
                    deadline: time::now() + time::NANOS_PER_MILLI,
                    waiter_id: 9,
                }],
                ack,
            })
            .unwrap();
        drain_rt();
        block_on(ack_rx.recv()).unwrap();

        // The actor's deadline branch removes the waiter from both lists.
        assert_eq!(block_on(w_rx.recv()).unwrap(), 0);
    }
}
