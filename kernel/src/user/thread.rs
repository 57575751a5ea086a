//! The per-thread trap loop: enter userspace, come back on a trap, dispatch,
//! repeat until the thread is reaped. Each thread is one runtime task; the
//! doomed flag is polled before every userspace entry.

use alloc::sync::Arc;

use log::{info, warn};
use warren_abi::{sysno, trapno, ExitStatus};
use x86_64::VirtAddr;

use crate::{
    exception::{self, TrapFrame},
    memory::pagetable::PageTableFlags,
    rt, time,
    user::{
        process::{Process, Tid},
        syscall,
    },
};

/// Hand a new thread to the scheduler.
pub fn sched_add(proc: Arc<Process>, tid: Tid, tf: TrapFrame) {
    rt::spawn(run(proc, tid, tf));
}

async fn run(proc: Arc<Process>, tid: Tid, mut tf: TrapFrame) {
    let mut fastret = false;

    while proc.resched(tid) {
        let (vector, aux) = exception::userrun(&mut tf, proc.root(), fastret);
        fastret = false;

        match vector {
            trapno::SYSCALL => {
                // The fast return path does not restore the registers libc
                // uses to pass arguments, so execv takes the slow one.
                let sysno = tf.rax();
                if sysno != sysno::EXECV {
                    fastret = true;
                }
                let ret = syscall::dispatch(&proc, tid, &mut tf).await;
                tf.set_rax(ret as u64);
            }
            trapno::TIMER => {
                time::tick();
                rt::r#yield().await;
            }
            trapno::PGFAULT => {
                if !page_fault(&proc, VirtAddr::new(aux), tf.error()).await {
                    info!(
                        "*** fault *** {}: addr {aux:#x}, rip {:#x}. killing...",
                        *proc.name.lock(),
                        tf.rip()
                    );
                    syscall::sys_exit(&proc, tid, ExitStatus::signaled(11));
                }
            }
            trapno::DIVZERO | trapno::GPFAULT | trapno::UD => {
                info!(
                    "{} -- TRAP: {vector}, RIP: {:#x}",
                    *proc.name.lock(),
                    tf.rip()
                );
                syscall::sys_exit(&proc, tid, ExitStatus::signaled(4));
            }
            trapno::TLBSHOOT => {}
            v if (trapno::IRQ_BASE..trapno::IRQ_LAST).contains(&v) => {
                // Devices interrupting the user program resume silently; the
                // record already went through the trap ring.
            }
            _ => panic!("weird trap: {vector}"),
        }
    }
}

/// Resolve a user page fault against the region map. A miss or a write to a
/// read-only region fails and the caller kills the thread.
async fn page_fault(proc: &Arc<Process>, fault_addr: VirtAddr, ecode: u64) -> bool {
    // Error code bit 2: the fault came from user mode. A kernel-mode fault
    // lands in the kernel trap path and panics there, never here.
    assert!(ecode & 0x4 != 0, "kernel page fault routed to user handler");
    let is_write = ecode & 0x2 != 0;

    let multi = proc.thread_count() > 1;
    let mut vm = proc.vm_lock().await;

    let Some(vmi) = vm.region.lookup(fault_addr) else {
        return false;
    };
    if is_write && !vmi.perms.contains(PageTableFlags::WRITABLE) {
        return false;
    }
    if !vmi.perms.contains(PageTableFlags::USER) {
        // Guard page.
        return false;
    }

    match vm.resolve_fault(fault_addr, is_write, multi) {
        Ok(()) => true,
        Err(error) => {
            warn!("page fault resolution failed: {error:?}");
            false
        }
    }
}
