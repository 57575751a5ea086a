//! Monotonic time and deadlines. `now()` is TSC-based; sleepers register a
//! waker under a deadline key and are fired by `tick()`, which runs from the
//! timer trap in the per-thread loop and from the idle loop.

use core::{
    future::Future,
    pin::Pin,
    sync::atomic::{AtomicU64, Ordering},
    task::{Context, Poll, Waker},
};

use alloc::collections::BTreeMap;

use crate::spin::mutex::Mutex;

pub const NANOS_PER_MILLI: u64 = 1_000_000;
pub const NANOS_PER_SEC: u64 = 1_000_000_000;

static TSC_KHZ: AtomicU64 = AtomicU64::new(0);
static TSC_BASE: AtomicU64 = AtomicU64::new(0);

/// Picoseconds per TSC cycle, pushed onto the exec descriptor for userspace
/// spin calibration.
pub fn ps_per_cycle() -> u64 {
    let khz = TSC_KHZ.load(Ordering::Relaxed).max(1);
    1_000_000_000 / khz
}

pub fn calibrate(tsc_khz: u64) {
    assert_ne!(tsc_khz, 0, "tsc frequency unknown");
    TSC_BASE.store(rdtsc(), Ordering::SeqCst);
    TSC_KHZ.store(tsc_khz, Ordering::SeqCst);
}

fn rdtsc() -> u64 {
    unsafe { core::arch::x86_64::_rdtsc() }
}

/// Nanoseconds since calibration.
pub fn now() -> u64 {
    let khz = TSC_KHZ.load(Ordering::Relaxed);
    if khz == 0 {
        return 0;
    }
    let cycles = rdtsc().wrapping_sub(TSC_BASE.load(Ordering::Relaxed));
    cycles / khz * NANOS_PER_MILLI + (cycles % khz) * NANOS_PER_MILLI / khz
}

struct Timers {
    /// Deadline nanoseconds plus a sequence number to keep keys unique.
    entries: BTreeMap<(u64, u64), Waker>,
    next_seq: u64,
}

static TIMERS: Mutex<Timers> = Mutex::new(Timers {
    entries: BTreeMap::new(),
    next_seq: 0,
});

/// Fire every expired timer. Called at every timer trap and from the idle
/// loop between task polls.
pub fn tick() {
    let now = now();
    loop {
        let mut guard = TIMERS.lock();
        let Some((&key, _)) = guard.entries.first_key_value() else {
            return;
        };
        if key.0 > now {
            return;
        }
        let waker = guard.entries.remove(&key).unwrap();
        drop(guard);
        waker.wake();
    }
}

pub fn sleep_until(deadline: u64) -> Sleep {
    Sleep {
        deadline,
        key: None,
    }
}

pub async fn sleep(duration_nanos: u64) {
    sleep_until(now().saturating_add(duration_nanos)).await
}

pub struct Sleep {
    deadline: u64,
    key: Option<(u64, u64)>,
}

impl Future for Sleep {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if now() >= self.deadline {
            if let Some(key) = self.key.take() {
                TIMERS.lock().entries.remove(&key);
            }
            return Poll::Ready(());
        }

        let mut guard = TIMERS.lock();
        match self.key {
            Some(key) => {
                // Refresh the registered waker in place.
                if let Some(waker) = guard.entries.get_mut(&key) {
                    waker.clone_from(cx.waker());
                } else {
                    // Fired between the deadline check and the lock.
                    drop(guard);
                    self.key = None;
                    cx.waker().wake_by_ref();
                }
            }
            None => {
                let seq = guard.next_seq;
                guard.next_seq += 1;
                let key = (self.deadline, seq);
                guard.entries.insert(key, cx.waker().clone());
                self.key = Some(key);
            }
        }
        Poll::Pending
    }
}

impl Drop for Sleep {
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            TIMERS.lock().entries.remove(&key);
        }
    }
}
