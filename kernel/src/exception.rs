//! CPU exception and interrupt plumbing: GDT/TSS/IDT bring-up, the raw trap
//! stubs, and `userrun` — the transition into userspace that returns on the
//! next trap with the 24-word frame filled in.
//!
//! The stub path obeys the producer constraints of the trap pipeline: it
//! runs with interrupts disabled and never allocates, locks or suspends.

use core::{alloc::Layout, arch::global_asm, ops::{Index, IndexMut}, ptr::null_mut};

use alloc::alloc::alloc;
use bytemuck::{Pod, Zeroable};
use log::debug;
use warren_abi::{tf, trapno, TFSIZE};
use x86_64::{
    instructions::{interrupts, tables::load_tss},
    registers::{
        control::{Cr2, Cr3, Cr3Flags},
        model_specific::{Efer, EferFlags, LStar, SFMask, Star},
        rflags::RFlags,
        segmentation::{Segment, CS, DS, ES, GS, SS},
    },
    structures::{
        gdt::{Descriptor, DescriptorFlags, GlobalDescriptorTable, SegmentSelector},
        idt::{InterruptDescriptorTable, InterruptStackFrame},
        paging::PhysFrame,
        tss::TaskStateSegment,
    },
    PrivilegeLevel, VirtAddr,
};

use crate::{
    apic,
    memory::{pagetable, tlb},
    per_cpu::{
        PerCpu, PER_CPU_CR2_SCRATCH, PER_CPU_KERNEL_RSP, PER_CPU_SCRATCH, PER_CPU_TRAP_FRAME,
        PER_CPU_USER_RSP_SCRATCH,
    },
    spin::lazy::Lazy,
    trap,
};

/// Selector of the 64-bit user code segment (GDT index 5, RPL 3).
pub const USER_CS: u16 = (5 << 3) | 3;
/// Selector of the user data segment (GDT index 4, RPL 3).
pub const USER_DS: u16 = (4 << 3) | 3;

/// The saved register image crossing the user/kernel boundary. Word indices
/// are the `warren_abi::tf` constants.
#[derive(Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
#[repr(transparent)]
pub struct TrapFrame(pub [u64; TFSIZE]);

impl TrapFrame {
    pub const ZERO: Self = Self([0; TFSIZE]);

    pub fn rax(&self) -> u64 {
        self.0[tf::RAX]
    }

    pub fn set_rax(&mut self, value: u64) {
        self.0[tf::RAX] = value;
    }

    pub fn rsp(&self) -> u64 {
        self.0[tf::RSP]
    }

    pub fn rip(&self) -> u64 {
        self.0[tf::RIP]
    }

    pub fn error(&self) -> u64 {
        self.0[tf::ERROR]
    }

    /// The six syscall argument registers, in ABI order.
    pub fn syscall_args(&self) -> (u64, u64, u64, u64, u64) {
        (
            self.0[tf::RDI],
            self.0[tf::RSI],
            self.0[tf::RDX],
            self.0[tf::RCX],
            self.0[tf::R8],
        )
    }
}

impl Index<usize> for TrapFrame {
    type Output = u64;

    fn index(&self, idx: usize) -> &u64 {
        &self.0[idx]
    }
}

impl IndexMut<usize> for TrapFrame {
    fn index_mut(&mut self, idx: usize) -> &mut u64 {
        &mut self.0[idx]
    }
}

impl core::fmt::Debug for TrapFrame {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("TrapFrame")
            .field("rip", &format_args!("{:#x}", self.0[tf::RIP]))
            .field("rsp", &format_args!("{:#x}", self.0[tf::RSP]))
            .field("rax", &format_args!("{:#x}", self.0[tf::RAX]))
            .field("trap", &self.0[tf::TRAP])
            .field("error", &format_args!("{:#x}", self.0[tf::ERROR]))
            .finish()
    }
}

pub fn switch_stack(f: extern "C" fn() -> !) -> ! {
    let stack = allocate_stack();

    unsafe {
        core::arch::asm!(
            "mov rsp, {stack}",
            "call {f}",
            "ud2",
            stack = in(reg) stack.as_u64(),
            f = in(reg) f,
            options(noreturn),
        );
    }
}

fn allocate_stack() -> VirtAddr {
    let stack_layout = Layout::from_size_align(0x10000, 16).unwrap();
    let stack = unsafe { alloc(stack_layout) };
    assert_ne!(stack, null_mut());
    let end_of_stack = unsafe { stack.add(stack_layout.size()) };
    VirtAddr::from_ptr(end_of_stack)
}

/// Load a Global Descriptor Table, the TSS and the syscall MSRs. The segment
/// order matters: sysret derives the user selectors from the 32-bit user
/// code slot, and the exec path bakes `USER_CS`/`USER_DS` into trap frames.
pub fn load_gdt() {
    let per_cpu = PerCpu::get();

    let mut tss = TaskStateSegment::new();
    tss.privilege_stack_table[0] = allocate_stack();
    tss.interrupt_stack_table[0] = allocate_stack();
    per_cpu.tss.set(tss).expect("TSS was already initialized");
    let tss = per_cpu.tss.get().unwrap();

    let mut gdt = GlobalDescriptorTable::new();
    let kernel_cs = gdt.append(Descriptor::kernel_code_segment());
    let kernel_ds = gdt.append(Descriptor::kernel_data_segment());
    let _user32_cs = gdt.append(Descriptor::UserSegment(DescriptorFlags::USER_CODE32.bits()));
    let user_ds = gdt.append(Descriptor::user_data_segment());
    let user_cs = gdt.append(Descriptor::user_code_segment());
    let tss_seg = gdt.append(Descriptor::tss_segment(tss));
    per_cpu.gdt.set(gdt).unwrap();
    let gdt = per_cpu.gdt.get().unwrap();

    assert_eq!(user_cs, SegmentSelector::new(5, PrivilegeLevel::Ring3));
    assert_eq!(user_ds, SegmentSelector::new(4, PrivilegeLevel::Ring3));

    debug!("loading global descriptor table");
    gdt.load();

    debug!("loading tss");
    unsafe {
        load_tss(tss_seg);
    }

    unsafe {
        // SAFETY: kernel_cs points to a 64 bit code segment.
        CS::set_reg(kernel_cs);
    }
    unsafe {
        // SAFETY: kernel_ds points to a data segment.
        SS::set_reg(kernel_ds);
        DS::set_reg(kernel_ds);
        ES::set_reg(kernel_ds);
    }

    // Initialize the segment selectors and entry point for
    // `syscall`/`sysret`. Interrupts stay masked until the entry stub is on
    // the kernel stack.
    Star::write(user_cs, user_ds, kernel_cs, kernel_ds).unwrap();
    LStar::write(VirtAddr::new(syscall_entry as usize as u64));
    SFMask::write(RFlags::INTERRUPT_FLAG);
    unsafe {
        Efer::update(|flags| *flags |= EferFlags::SYSTEM_CALL_EXTENSIONS);
    }
}

extern "C" {
    fn syscall_entry();
    fn userrun_raw(tf: *mut TrapFrame, fastret: usize) -> RawUserExit;

    fn trap_stub_0();
    fn trap_stub_6();
    fn trap_stub_13();
    fn trap_stub_14();
    fn trap_stub_32();
    fn trap_stub_33();
    fn trap_stub_34();
    fn trap_stub_35();
    fn trap_stub_36();
    fn trap_stub_37();
    fn trap_stub_38();
    fn trap_stub_39();
    fn trap_stub_40();
    fn trap_stub_41();
    fn trap_stub_42();
    fn trap_stub_43();
    fn trap_stub_44();
    fn trap_stub_45();
    fn trap_stub_46();
    fn trap_stub_47();
    fn trap_stub_70();
}

#[repr(C)]
struct RawUserExit {
    vector: u64,
    aux: u64,
}

/// Load an IDT.
pub fn load_idt() {
    static IDT: Lazy<InterruptDescriptorTable> = Lazy::new(|| {
        let mut idt = InterruptDescriptorTable::new();

        let stub = |f: unsafe extern "C" fn()| VirtAddr::new(f as usize as u64);
        unsafe {
            idt.divide_error.set_handler_addr(stub(trap_stub_0));
            idt.invalid_opcode.set_handler_addr(stub(trap_stub_6));
            idt.general_protection_fault
                .set_handler_addr(stub(trap_stub_13));
            idt.page_fault.set_handler_addr(stub(trap_stub_14));
            idt.double_fault
                .set_handler_fn(double_fault_handler)
                .set_stack_index(0);

            let irq_stubs: [unsafe extern "C" fn(); 16] = [
                trap_stub_32,
                trap_stub_33,
                trap_stub_34,
                trap_stub_35,
                trap_stub_36,
                trap_stub_37,
                trap_stub_38,
                trap_stub_39,
                trap_stub_40,
                trap_stub_41,
                trap_stub_42,
                trap_stub_43,
                trap_stub_44,
                trap_stub_45,
                trap_stub_46,
                trap_stub_47,
            ];
            for (i, &handler) in irq_stubs.iter().enumerate() {
                idt[32 + i as u8].set_handler_addr(stub(handler));
            }
            idt[tlb::TLBSHOOT_VECTOR].set_handler_addr(stub(trap_stub_70));
        }
        idt
    });

    debug!("loading interrupt descriptor table");
    IDT.load();
}

extern "x86-interrupt" fn double_fault_handler(frame: InterruptStackFrame, code: u64) -> ! {
    let _guard = SwapGsGuard::new(&frame);

    panic!("double fault {frame:x?} {code:x?}");
}

struct SwapGsGuard(());

impl SwapGsGuard {
    fn new(frame: &InterruptStackFrame) -> Option<Self> {
        if frame.code_segment.rpl() == PrivilegeLevel::Ring0 {
            return None;
        }

        unsafe {
            GS::swap();
        }

        Some(Self(()))
    }
}

impl Drop for SwapGsGuard {
    fn drop(&mut self) {
        unsafe {
            GS::swap();
        }
    }
}

// The trap stubs. Each pushes a normalized [vector][error] pair and joins
// `trap_common`, which decides whether the trap interrupted userspace (save
// the full register image into the thread's frame and unwind into the
// `userrun_raw` continuation) or the kernel (dispatch inline and iretq).
macro_rules! trap_stubs {
    ($(($name:literal, $vec:literal, $has_error:literal)),* $(,)?) => {
        global_asm!(
            $(
                concat!(
                    ".global trap_stub_", $name, "\n",
                    "trap_stub_", $name, ":\n",
                    ".if ", $has_error, " == 0\n",
                    "push 0\n",
                    ".endif\n",
                    "push ", $vec, "\n",
                    "jmp trap_common_label\n",
                ),
            )*
        );
    };
}

trap_stubs!(
    ("0", 0, 0),
    ("6", 6, 0),
    ("13", 13, 1),
    ("14", 14, 1),
    ("32", 32, 0),
    ("33", 33, 0),
    ("34", 34, 0),
    ("35", 35, 0),
    ("36", 36, 0),
    ("37", 37, 0),
    ("38", 38, 0),
    ("39", 39, 0),
    ("40", 40, 0),
    ("41", 41, 0),
    ("42", 42, 0),
    ("43", 43, 0),
    ("44", 44, 0),
    ("45", 45, 0),
    ("46", 46, 0),
    ("47", 47, 0),
    ("70", 70, 0),
);

// Stack on entry to trap_common (error normalized by the stubs):
//   [rsp+ 0] vector     [rsp+24] cs
//   [rsp+ 8] error      [rsp+32] rflags
//   [rsp+16] rip        [rsp+40] rsp
//                       [rsp+48] ss
global_asm!(
    ".global trap_common_label",
    "trap_common_label:",
    // Kernel traps stay on this stack and iretq back.
    "test qword ptr [rsp + 24], 3",
    "jz 2f",

    // The trap interrupted userspace: spill every register into the
    // thread's trap frame and unwind into the userrun continuation.
    "swapgs",
    "mov gs:[{SCRATCH}], r15",
    "mov r15, gs:[{TFPTR}]",
    "mov [r15 + 8*16], rax",
    "mov [r15 + 8*15], rbx",
    "mov [r15 + 8*14], rcx",
    "mov [r15 + 8*13], rdx",
    "mov [r15 + 8*12], rdi",
    "mov [r15 + 8*11], rsi",
    "mov [r15 + 8*10], rbp",
    "mov [r15 + 8*9], r8",
    "mov [r15 + 8*8], r9",
    "mov [r15 + 8*7], r10",
    "mov [r15 + 8*6], r11",
    "mov [r15 + 8*5], r12",
    "mov [r15 + 8*4], r13",
    "mov [r15 + 8*3], r14",
    "mov rax, gs:[{SCRATCH}]",
    "mov [r15 + 8*2], rax",
    // Vector, error code and the interrupt frame.
    "mov rax, [rsp + 0]",
    "mov [r15 + 8*17], rax",
    "mov rax, [rsp + 8]",
    "mov [r15 + 8*18], rax",
    "mov rax, [rsp + 16]",
    "mov [r15 + 8*19], rax",
    "mov rax, [rsp + 24]",
    "mov [r15 + 8*20], rax",
    "mov rax, [rsp + 32]",
    "mov [r15 + 8*21], rax",
    "mov rax, [rsp + 40]",
    "mov [r15 + 8*22], rax",
    "mov rax, [rsp + 48]",
    "mov [r15 + 8*23], rax",
    // CR2 is only meaningful for page faults but always cheap to save.
    "mov rax, cr2",
    "mov gs:[{CR2}], rax",
    // Return values for userrun_raw: vector and aux.
    "mov rax, [r15 + 8*17]",
    "mov rdx, gs:[{CR2}]",
    // Back onto the kernel stack, then into the continuation.
    "mov rsp, gs:[{KRSP}]",
    "jmp userrun_continue_label",

    // Kernel-mode trap: call the inline handler and resume.
    "2:",
    "push rax",
    "push rcx",
    "push rdx",
    "push rsi",
    "push rdi",
    "push r8",
    "push r9",
    "push r10",
    "push r11",
    "mov rdi, [rsp + 72]",
    "mov rsi, [rsp + 80]",
    "call {kernel_trap}",
    "pop r11",
    "pop r10",
    "pop r9",
    "pop r8",
    "pop rdi",
    "pop rsi",
    "pop rdx",
    "pop rcx",
    "pop rax",
    "add rsp, 16",
    "iretq",
    SCRATCH = const PER_CPU_SCRATCH,
    TFPTR = const PER_CPU_TRAP_FRAME,
    CR2 = const PER_CPU_CR2_SCRATCH,
    KRSP = const PER_CPU_KERNEL_RSP,
    kernel_trap = sym kernel_trap,
);

// userrun_raw(rdi = trap frame, rsi = fastret) -> (rax = vector, rdx = aux).
//
// Saves the kernel callee-saved registers, parks the stack pointer in the
// per-CPU area and enters userspace; the trap paths above return through
// `userrun_continue_label` as if `userrun_raw` had returned normally.
global_asm!(
    ".global userrun_raw",
    "userrun_raw:",
    "push rbp",
    "push rbx",
    "push r12",
    "push r13",
    "push r14",
    "push r15",
    "mov gs:[{KRSP}], rsp",
    // Program the user FS base.
    "mov rax, [rdi + 8*1]",
    "mov rdx, rax",
    "shr rdx, 32",
    "mov ecx, 0xC0000100",
    "wrmsr",
    "test rsi, rsi",
    "jnz 2f",

    // Full return: rebuild the iret frame from the trap frame and restore
    // every register.
    "push qword ptr [rdi + 8*23]",
    "push qword ptr [rdi + 8*22]",
    "push qword ptr [rdi + 8*21]",
    "push qword ptr [rdi + 8*20]",
    "push qword ptr [rdi + 8*19]",
    "mov rax, [rdi + 8*16]",
    "mov rbx, [rdi + 8*15]",
    "mov rcx, [rdi + 8*14]",
    "mov rdx, [rdi + 8*13]",
    "mov rsi, [rdi + 8*11]",
    "mov rbp, [rdi + 8*10]",
    "mov r8, [rdi + 8*9]",
    "mov r9, [rdi + 8*8]",
    "mov r10, [rdi + 8*7]",
    "mov r11, [rdi + 8*6]",
    "mov r12, [rdi + 8*5]",
    "mov r13, [rdi + 8*4]",
    "mov r14, [rdi + 8*3]",
    "mov r15, [rdi + 8*2]",
    "mov rdi, [rdi + 8*12]",
    "swapgs",
    "iretq",

    // Fast return after a syscall: only RAX (the result), the callee-saved
    // registers and the control registers come back; the argument registers
    // keep whatever the kernel left in them. sys_execv rewrites the argument
    // registers and therefore takes the full path.
    "2:",
    "mov rax, [rdi + 8*16]",
    "mov rbx, [rdi + 8*15]",
    "mov rbp, [rdi + 8*10]",
    "mov r12, [rdi + 8*5]",
    "mov r13, [rdi + 8*4]",
    "mov r14, [rdi + 8*3]",
    "mov r15, [rdi + 8*2]",
    "mov rcx, [rdi + 8*19]",
    "mov r11, [rdi + 8*21]",
    "mov rsp, [rdi + 8*22]",
    "swapgs",
    "sysretq",

    ".global userrun_continue_label",
    "userrun_continue_label:",
    "pop r15",
    "pop r14",
    "pop r13",
    "pop r12",
    "pop rbx",
    "pop rbp",
    "ret",
    KRSP = const PER_CPU_KERNEL_RSP,
);

// The syscall instruction entry: rcx holds the user RIP, r11 the user
// RFLAGS, the stack is still the user's. Interrupts are masked by SFMASK
// until we are back on the kernel stack.
global_asm!(
    ".global syscall_entry",
    "syscall_entry:",
    "swapgs",
    "mov gs:[{URSP}], rsp",
    "mov gs:[{SCRATCH}], r15",
    "mov r15, gs:[{TFPTR}]",
    "mov [r15 + 8*16], rax",
    "mov [r15 + 8*15], rbx",
    "mov [r15 + 8*13], rdx",
    "mov [r15 + 8*12], rdi",
    "mov [r15 + 8*11], rsi",
    "mov [r15 + 8*10], rbp",
    "mov [r15 + 8*9], r8",
    "mov [r15 + 8*8], r9",
    "mov [r15 + 8*7], r10",
    "mov [r15 + 8*5], r12",
    "mov [r15 + 8*4], r13",
    "mov [r15 + 8*3], r14",
    "mov [r15 + 8*19], rcx",
    "mov [r15 + 8*21], r11",
    "mov rax, gs:[{URSP}]",
    "mov [r15 + 8*22], rax",
    "mov rax, gs:[{SCRATCH}]",
    "mov [r15 + 8*2], rax",
    "mov qword ptr [r15 + 8*20], {user_cs}",
    "mov qword ptr [r15 + 8*23], {user_ss}",
    "mov qword ptr [r15 + 8*17], {syscall_vec}",
    "mov qword ptr [r15 + 8*18], 0",
    "mov rax, {syscall_vec}",
    "xor edx, edx",
    "mov rsp, gs:[{KRSP}]",
    "jmp userrun_continue_label",
    URSP = const PER_CPU_USER_RSP_SCRATCH,
    SCRATCH = const PER_CPU_SCRATCH,
    TFPTR = const PER_CPU_TRAP_FRAME,
    KRSP = const PER_CPU_KERNEL_RSP,
    user_cs = const USER_CS,
    user_ss = const USER_DS,
    syscall_vec = const trapno::SYSCALL,
);

extern "C" fn kernel_trap(vector: u64, error: u64) {
    match vector {
        trapno::TIMER => apic::eoi(),
        v if v == u64::from(tlb::TLBSHOOT_VECTOR) => {
            tlb::handle_ipi();
            apic::eoi();
        }
        v if (trapno::IRQ_BASE..trapno::IRQ_LAST).contains(&v) => {
            trap::device_irq(v, &TrapFrame::ZERO, 0);
        }
        trapno::PGFAULT => {
            panic!(
                "kernel page fault accessing {:#x} (error {error:#x})",
                Cr2::read_raw()
            );
        }
        _ => panic!("kernel trap {vector} (error {error:#x})"),
    }
}

/// Enter userspace with the given frame and address space; returns the next
/// trap's vector and, for page faults, the faulting address.
///
/// The CPU holds a transient reference on the root while it may still be in
/// CR3; switching roots drops the old reference, which tears the old address
/// space down if the owning process already exited.
pub fn userrun(tf: &mut TrapFrame, root: PhysFrame, fastret: bool) -> (u64, u64) {
    interrupts::disable();

    let per_cpu = PerCpu::get();
    switch_root(per_cpu, root);
    per_cpu.trap_frame.set(tf as *mut TrapFrame);

    let exit = unsafe { userrun_raw(tf, usize::from(fastret)) };
    let (vector, aux) = (exit.vector, exit.aux);

    // Dispositions that must not be lost even though the thread loop resumes
    // silently for them.
    match vector {
        trapno::TIMER => apic::eoi(),
        v if v == u64::from(tlb::TLBSHOOT_VECTOR) => {
            tlb::handle_ipi();
            apic::eoi();
        }
        v if (trapno::IRQ_BASE..trapno::IRQ_LAST).contains(&v) => {
            trap::device_irq(v, tf, aux);
        }
        _ => {}
    }

    interrupts::enable();
    (vector, aux)
}

fn switch_root(per_cpu: &PerCpu, root: PhysFrame) {
    if per_cpu.held_root.get() == Some(root) {
        return;
    }

    pagetable::incref_root(root);
    unsafe {
        Cr3::write(root, Cr3Flags::empty());
    }
    per_cpu.loaded_root.set(root.start_address().as_u64());

    if let Some(old) = per_cpu.held_root.replace(Some(root)) {
        pagetable::decref_root(old);
    }
}
