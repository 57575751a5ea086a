//! The per-CPU interrupt delivery pipeline. The interrupt stub is the
//! producer: it copies a trap record into the current CPU's ring, advances
//! head and wakes the consumer. The consumer task round-robins the CPUs,
//! drains each ring and forwards records to driver mailboxes. A full ring is
//! a kernel bug: the core dumps the queued trap numbers and halts.

use core::{
    cell::UnsafeCell,
    future::Future,
    pin::Pin,
    sync::atomic::{AtomicUsize, Ordering},
    task::{Context, Poll},
};

use alloc::collections::BTreeMap;
use futures::task::AtomicWaker;
use log::error;
use warren_abi::trapno;

use crate::{
    apic,
    exception::TrapFrame,
    per_cpu::PerCpu,
    rt::mpsc,
    spin::mutex::Mutex,
    time,
};

const RING_SLOTS: usize = 64;

#[derive(Clone, Copy)]
pub struct TrapRecord {
    pub trapno: u64,
    pub fault_addr: u64,
    pub frame: TrapFrame,
    pub enqueue_nanos: u64,
}

impl TrapRecord {
    const EMPTY: Self = Self {
        trapno: 0,
        fault_addr: 0,
        frame: TrapFrame::ZERO,
        enqueue_nanos: 0,
    };
}

const fn next_slot(idx: usize) -> usize {
    (idx + 1) % RING_SLOTS
}

/// Single producer (that CPU's interrupt handler), single consumer (the trap
/// task). The producer writes head, the consumer writes tail; no lock.
pub struct TrapRing {
    slots: [UnsafeCell<TrapRecord>; RING_SLOTS],
    head: AtomicUsize,
    tail: AtomicUsize,
}

unsafe impl Sync for TrapRing {}

impl TrapRing {
    pub const fn new() -> Self {
        Self {
            slots: [const { UnsafeCell::new(TrapRecord::EMPTY) }; RING_SLOTS],
            head: AtomicUsize::new(0),
            tail: AtomicUsize::new(0),
        }
    }

    /// Producer side. Runs with interrupts disabled; must not allocate, take
    /// a mutex or suspend.
    pub fn enqueue(&self, trapno: u64, fault_addr: u64, frame: &TrapFrame) {
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Acquire);

        if next_slot(head) == tail {
            self.fatal_overflow();
        }

        unsafe {
            *self.slots[head].get() = TrapRecord {
                trapno,
                fault_addr,
                frame: *frame,
                enqueue_nanos: time::now(),
            };
        }
        self.head.store(next_slot(head), Ordering::Release);

        trap_wake();
    }

    fn dequeue(&self) -> Option<TrapRecord> {
        let tail = self.tail.load(Ordering::Relaxed);
        let head = self.head.load(Ordering::Acquire);
        if head == tail {
            return None;
        }
        let record = unsafe { *self.slots[tail].get() };
        self.tail.store(next_slot(tail), Ordering::Release);
        Some(record)
    }

    fn is_empty(&self) -> bool {
        self.head.load(Ordering::Acquire) == self.tail.load(Ordering::Acquire)
    }

    #[cold]
    fn fatal_overflow(&self) -> ! {
        // Dump the queued trap numbers for forensics, then halt this CPU.
        // Interrupts are already disabled on the producer path.
        let head = self.head.load(Ordering::Relaxed);
        let mut idx = self.tail.load(Ordering::Relaxed);
        while idx != head {
            let trapno = unsafe { (*self.slots[idx].get()).trapno };
            crate::logging::write_console(b"trap ring entry: ");
            write_hex(trapno);
            idx = next_slot(idx);
        }
        crate::logging::write_console(b"trap ring overflow\n");
        loop {
            x86_64::instructions::hlt();
        }
    }
}

fn write_hex(value: u64) {
    let mut buf = [0u8; 17];
    for (i, slot) in buf[..16].iter_mut().enumerate() {
        let nibble = (value >> (60 - i * 4)) & 0xf;
        *slot = b"0123456789abcdef"[nibble as usize];
    }
    buf[16] = b'\n';
    crate::logging::write_console(&buf);
}

static TRAP_WAKER: AtomicWaker = AtomicWaker::new();

/// The wake primitive the producer uses. Never registers, never allocates in
/// the common case.
pub fn trap_wake() {
    TRAP_WAKER.wake();
}

/// Handler mailboxes keyed by trap number. Drivers register during attach.
static HANDLERS: Mutex<BTreeMap<u64, mpsc::Sender<TrapRecord>>> = Mutex::new(BTreeMap::new());

/// Register a driver mailbox for a trap number and return its receiving end.
pub fn install_trap_handler(trapno: u64) -> mpsc::Receiver<TrapRecord> {
    let (sender, receiver) = mpsc::new();
    let old = HANDLERS.lock().insert(trapno, sender);
    assert!(old.is_none(), "second handler for trap {trapno}");
    receiver
}

struct WaitForTraps;

impl Future for WaitForTraps {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        TRAP_WAKER.register(cx.waker());
        let any = (0..PerCpu::count()).any(|cpu| !PerCpu::by_index(cpu).ring.is_empty());
        if any {
            Poll::Ready(())
        } else {
            Poll::Pending
        }
    }
}

/// The consumer. Spawned once at init.
pub async fn consume() {
    loop {
        for cpu in 0..PerCpu::count() {
            while let Some(record) = PerCpu::by_index(cpu).ring.dequeue() {
                dispatch(record);
            }
        }
        WaitForTraps.await;
    }
}

fn dispatch(record: TrapRecord) {
    let guard = HANDLERS.lock();
    let Some(handler) = guard.get(&record.trapno) else {
        panic!("no handler for trap {}", record.trapno);
    };
    // A full mailbox means the driver died; that is fatal too.
    handler
        .send(record)
        .unwrap_or_else(|_| panic!("handler for trap {} is gone", record.trapno));
}

/// Inline completion for device interrupts that surfaced while this CPU was
/// in userspace: the record still goes through the ring, the line is masked
/// and the LAPIC gets its EOI, then the thread loop resumes silently.
pub fn device_irq(trapno: u64, frame: &TrapFrame, fault_addr: u64) {
    let per_cpu = PerCpu::current_by_lapic();
    per_cpu.ring.enqueue(trapno, fault_addr, frame);

    if (trapno::IRQ_BASE..trapno::IRQ_LAST).contains(&trapno) {
        apic::irq_mask((trapno - trapno::IRQ_BASE) as u32);
    }
    apic::eoi();
}

/// Dump recent trap activity; used by the panic path.
pub fn dump_recent() {
    for cpu in 0..PerCpu::count() {
        let ring = &PerCpu::by_index(cpu).ring;
        let head = ring.head.load(Ordering::Relaxed);
        let tail = ring.tail.load(Ordering::Relaxed);
        if head != tail {
            error!("cpu {cpu}: {} undelivered trap(s)", (head + RING_SLOTS - tail) % RING_SLOTS);
        }
        let mut idx = tail;
        while idx != head {
            let record = unsafe { &*ring.slots[idx].get() };
            error!(
                "  trap {} fault_addr {:#x} at {}ns",
                record.trapno, record.fault_addr, record.enqueue_nanos
            );
            idx = next_slot(idx);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_index_math() {
        assert_eq!(next_slot(0), 1);
        assert_eq!(next_slot(RING_SLOTS - 1), 0);
    }

    #[test]
    fn ring_fills_at_sixty_three() {
        let ring = TrapRing::new();
        let frame = TrapFrame::ZERO;
        // 63 enqueues between dequeues must always fit.
        for i in 0..RING_SLOTS - 1 {
            ring.enqueue(i as u64, 0, &frame);
        }
        for i in 0..RING_SLOTS - 1 {
            assert_eq!(ring.dequeue().unwrap().trapno, i as u64);
        }
        assert!(ring.dequeue().is_none());
    }

    #[test]
    fn ring_preserves_fifo_across_wraps() {
        let ring = TrapRing::new();
        let frame = TrapFrame::ZERO;
        for round in 0..3u64 {
            for i in 0..40 {
                ring.enqueue(round * 100 + i, 0, &frame);
            }
            for i in 0..40 {
                assert_eq!(ring.dequeue().unwrap().trapno, round * 100 + i);
            }
        }
    }
}
