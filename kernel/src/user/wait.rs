//! The parent⇄child termination rendezvous. One `WaitSet` per process holds
//! entries for its threads and child processes; `put` publishes a
//! termination record, `reap` retrieves one. A given id is handed out at
//! most once; any-waits consult a hint list of already-dead children before
//! parking.

use alloc::{collections::VecDeque, vec::Vec};
use alloc::collections::BTreeMap;

use warren_abi::ExitStatus;

use crate::{
    error::{err, Error, Result},
    rt::oneshot,
    spin::mutex::Mutex,
    user::process::AccountSnapshot,
};

#[derive(Debug, Clone, Copy, Default)]
pub struct WaitStatus {
    pub id: u64,
    pub status: ExitStatus,
    pub atime: AccountSnapshot,
}

type WaitSender = oneshot::Sender<Result<WaitStatus>>;

struct WaitEntry {
    status: WaitStatus,
    is_proc: bool,
    dead: bool,
    /// At most one specific waiter may register; a second reaper of the
    /// same id fails with ECHILD.
    specific_waiter: Option<WaitSender>,
}

struct WaitState {
    by_id: BTreeMap<u64, WaitEntry>,
    /// Number of child processes (threads are not counted).
    child_count: isize,
    /// Terminated process ids an any-wait can pick up without scanning.
    hints: VecDeque<u64>,
    /// Parked any-waiters, each holding a one-shot reply slot.
    any_waiters: VecDeque<WaitSender>,
}

pub struct WaitSet {
    state: Mutex<WaitState>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
pub enum ReapTarget {
    Any,
    Id(u64),
}

impl Default for WaitSet {
    fn default() -> Self {
        Self::new()
    }
}

impl WaitSet {
    pub const fn new() -> Self {
        Self {
            state: Mutex::new(WaitState {
                by_id: BTreeMap::new(),
                child_count: 0,
                hints: VecDeque::new(),
                any_waiters: VecDeque::new(),
            }),
        }
    }

    fn start(&self, id: u64, is_proc: bool) {
        let mut state = self.state.lock();
        let old = state.by_id.insert(
            id,
            WaitEntry {
                status: WaitStatus::default(),
                is_proc,
                dead: false,
                specific_waiter: None,
            },
        );
        assert!(old.is_none(), "two starts for id {id}");
        if is_proc {
            state.child_count += 1;
        }
    }

    pub fn start_proc(&self, pid: u64) {
        self.start(pid, true);
    }

    pub fn start_thread(&self, tid: u64) {
        self.start(tid, false);
    }

    /// Publish a termination record for `id`.
    pub fn put(&self, id: u64, status: ExitStatus, atime: Option<AccountSnapshot>) {
        let mut state = self.state.lock();

        let entry = state.by_id.get_mut(&id).expect("put without start");
        entry.status = WaitStatus {
            id,
            status,
            atime: atime.unwrap_or_default(),
        };
        entry.dead = true;

        let is_proc = entry.is_proc;
        let record = entry.status;

        // Hand the record to a specific waiter, else to a parked any-waiter
        // (processes only), else store it for a later reap.
        let mut wake = None;
        if let Some(waiter) = entry.specific_waiter.take() {
            wake = Some(waiter);
        } else if is_proc {
            wake = state.any_waiters.pop_front();
        }

        if wake.is_some() {
            state.by_id.remove(&id);
            if is_proc {
                state.child_count -= 1;
                assert!(state.child_count >= 0, "negative child count");
            }
        } else if is_proc {
            state.hints.push_back(id);
        }

        let orphans = orphaned_waiters(&mut state);
        drop(state);

        if let Some(waiter) = wake {
            let _ = waiter.send(Ok(record));
        }
        wake_orphans(orphans);
    }

    /// Retrieve one termination record. `noblock` turns an empty result
    /// into an immediate zero record instead of parking.
    pub async fn reap(&self, target: ReapTarget, noblock: bool) -> Result<WaitStatus> {
        let receiver;
        {
            let mut state = self.state.lock();

            match target {
                ReapTarget::Any => {
                    assert!(state.child_count >= 0, "negative child count");
                    if state.child_count == 0 {
                        return Err(err!(Child));
                    }

                    while let Some(hint) = state.hints.pop_front() {
                        let Some(entry) = state.by_id.get(&hint) else {
                            continue;
                        };
                        if entry.dead && entry.is_proc {
                            let record = entry.status;
                            state.by_id.remove(&hint);
                            state.child_count -= 1;
                            let orphans = orphaned_waiters(&mut state);
                            drop(state);
                            wake_orphans(orphans);
                            return Ok(record);
                        }
                    }

                    if noblock {
                        return Ok(WaitStatus::default());
                    }

                    let (sender, rx) = oneshot::new();
                    state.any_waiters.push_back(sender);
                    receiver = rx;
                }
                ReapTarget::Id(id) => {
                    let Some(entry) = state.by_id.get_mut(&id) else {
                        return Err(err!(Child));
                    };
                    if entry.specific_waiter.is_some() {
                        return Err(err!(Child));
                    }

                    if entry.dead {
                        let record = entry.status;
                        let is_proc = entry.is_proc;
                        state.by_id.remove(&id);
                        if is_proc {
                            state.child_count -= 1;
                            assert!(state.child_count >= 0, "negative child count");
                        }
                        let orphans = orphaned_waiters(&mut state);
                        drop(state);
                        wake_orphans(orphans);
                        return Ok(record);
                    }

                    if noblock {
                        return Ok(WaitStatus::default());
                    }

                    let (sender, rx) = oneshot::new();
                    entry.specific_waiter = Some(sender);
                    receiver = rx;
                }
            }
        }

        receiver
            .recv()
            .await
            .map_err(|_| Error::from_kind(crate::error::ErrorKind::Child))?
    }

    pub fn child_count(&self) -> isize {
        self.state.lock().child_count
    }
}

/// After every mutation: any-waiters left behind with no children to wait
/// for are woken with ECHILD once the lock is released.
fn orphaned_waiters(state: &mut WaitState) -> Vec<WaitSender> {
    if state.child_count == 0 && !state.any_waiters.is_empty() {
        state.any_waiters.drain(..).collect()
    } else {
        Vec::new()
    }
}

fn wake_orphans(orphans: Vec<WaitSender>) {
    for waiter in orphans {
        let _ = waiter.send(Err(err!(Child)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        error::ErrorKind,
        rt::{self, block_on},
    };
    use alloc::sync::Arc;

    #[test]
    fn wait_with_no_children_fails() {
        let ws = WaitSet::new();
        let err = block_on(ws.reap(ReapTarget::Any, false)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Child);
    }

    #[test]
    fn put_then_reap_specific() {
        let ws = WaitSet::new();
        ws.start_proc(7);
        ws.put(7, ExitStatus::exited(3), None);

        let record = block_on(ws.reap(ReapTarget::Id(7), false)).unwrap();
        assert_eq!(record.id, 7);
        assert_eq!(record.status, ExitStatus::exited(3));

        // A given id is returned at most once.
        let err = block_on(ws.reap(ReapTarget::Id(7), false)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Child);
    }

    #[test]
    fn any_wait_uses_hints() {
        let ws = WaitSet::new();
        ws.start_proc(1);
        ws.start_proc(2);
        ws.put(2, ExitStatus::exited(0), None);

        let record = block_on(ws.reap(ReapTarget::Any, false)).unwrap();
        assert_eq!(record.id, 2);
        assert_eq!(ws.child_count(), 1);
    }

    #[test]
    fn thread_records_are_invisible_to_any_wait() {
        let ws = WaitSet::new();
        ws.start_proc(1);
        ws.start_thread(100);
        ws.put(100, ExitStatus::exited(0), None);

        // The dead thread must not satisfy a WAIT_ANY.
        let record = block_on(ws.reap(ReapTarget::Any, true)).unwrap();
        assert_eq!(record.id, 0);

        // It is still reapable by id.
        let record = block_on(ws.reap(ReapTarget::Id(100), false)).unwrap();
        assert_eq!(record.id, 100);
    }

    #[test]
    fn nohang_returns_zero_record() {
        let ws = WaitSet::new();
        ws.start_proc(1);
        let record = block_on(ws.reap(ReapTarget::Any, true)).unwrap();
        assert_eq!(record.id, 0);
    }

    #[test]
    fn blocked_any_waiter_is_woken_by_put() {
        let ws = Arc::new(WaitSet::new());
        ws.start_proc(9);

        let (done_tx, done_rx) = oneshot::new();
        let ws2 = ws.clone();
        rt::spawn(async move {
            let record = ws2.reap(ReapTarget::Any, false).await;
            let _ = done_tx.send(record);
        });
        // Let the waiter park.
        while rt::poll() {}

        ws.put(9, ExitStatus::exited(1), None);
        let record = block_on(done_rx.recv()).unwrap().unwrap();
        assert_eq!(record.id, 9);
        assert_eq!(record.status.code(), 1);
        assert_eq!(ws.child_count(), 0);
    }

    #[test]
    fn second_specific_waiter_fails() {
        let ws = Arc::new(WaitSet::new());
        ws.start_proc(5);

        let (done_tx, _done_rx) = oneshot::new();
        let ws2 = ws.clone();
        rt::spawn(async move {
            let record = ws2.reap(ReapTarget::Id(5), false).await;
            let _ = done_tx.send(record);
        });
        while rt::poll() {}

        let err = block_on(ws.reap(ReapTarget::Id(5), true)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Child);
    }

    #[test]
    fn reaping_last_child_orphans_any_waiters() {
        let ws = Arc::new(WaitSet::new());
        ws.start_proc(1);
        ws.start_proc(2);

        // Park an any-waiter.
        let (done_tx, done_rx) = oneshot::new();
        let ws2 = ws.clone();
        rt::spawn(async move {
            let record = ws2.reap(ReapTarget::Any, false).await;
            let _ = done_tx.send(record);
        });
        while rt::poll() {}

        // Child 1 is handed to the any-waiter; child 2 dies and is reaped
        // by id, leaving no children.
        ws.put(1, ExitStatus::exited(0), None);
        let first = block_on(done_rx.recv()).unwrap().unwrap();
        assert_eq!(first.id, 1);

        ws.put(2, ExitStatus::exited(0), None);
        let second = block_on(ws.reap(ReapTarget::Id(2), false)).unwrap();
        assert_eq!(second.id, 2);

        // A fresh any-wait now fails immediately.
        let err = block_on(ws.reap(ReapTarget::Any, false)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Child);
    }
}
