//! Architecture abstraction.
//!
//! The kernel core is written against the `Arch` trait; `TargetArch` is the
//! implementation selected at compile time. On riscv64 the implementation
//! talks to the real CSRs, the PLIC and the SBI firmware. On every other
//! target a hart simulator is substituted so that the machine-independent
//! core (locks, process table, VFS, pipes) can be compiled and unit-tested
//! on the build machine.

use crate::proc::{Context, TrapFrame};

cfg_if::cfg_if! {
    if #[cfg(target_arch = "riscv64")] {
        pub mod riscv;
        pub type TargetArch = riscv::RiscV;
    } else {
        pub mod host;
        pub type TargetArch = host::Host;
    }
}

/// What a trap turned out to be, after decoding the cause register.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TrapCause {
    /// Timer interrupt.
    TimerInterrupt,
    /// Device interrupt routed through the interrupt controller.
    ExternalInterrupt,
    /// Environment call from user mode (a system call).
    UserEnvCall,
    /// Load/store/instruction fault, with the faulting address.
    MemoryFault { addr: usize },
    /// Illegal instruction.
    IllegalInstruction,
    /// Anything this kernel does not understand.
    Unknown { cause: usize },
}

pub trait Arch {
    /// Which hart (core) is this? Must be called with interrupts disabled;
    /// otherwise the process could be moved to a different CPU between the
    /// call and the use of its result.
    fn cpu_id() -> usize;

    /// Enable device interrupts.
    ///
    /// # Safety
    ///
    /// The trap vector must have been installed.
    unsafe fn intr_on();

    /// Disable device interrupts.
    fn intr_off();

    /// Are device interrupts enabled?
    fn intr_get() -> bool;

    /// Install the kernel trap vector on this core.
    ///
    /// # Safety
    ///
    /// Must be called once per core during boot.
    unsafe fn trap_init_core();

    /// Point the trap vector at the kernel-mode entry. Called first thing on
    /// entry from user space, since we are now in the kernel.
    ///
    /// # Safety
    ///
    /// The kernel trap entry must be in place (see `trap_init_core`).
    unsafe fn switch_to_kernel_vec();

    /// Decode the pending trap cause.
    fn trap_cause() -> TrapCause;

    /// Did the trap come from supervisor mode?
    fn trap_from_supervisor() -> bool;

    /// Program counter at the moment the trap occurred.
    fn trap_pc() -> usize;

    /// Capture the trap-return registers that a nested trap (e.g. a timer
    /// interrupt taking the CPU through `yield`) would clobber.
    fn save_trap_regs(store: &mut [usize; 2]);

    /// Restore what `save_trap_regs` captured.
    ///
    /// # Safety
    ///
    /// `store` must hold values captured by `save_trap_regs` on this core.
    unsafe fn restore_trap_regs(store: &[usize; 2]);

    /// Schedule the next timer interrupt.
    unsafe fn rearm_timer();

    /// Microseconds since power-on.
    fn time_us() -> u64;

    /// Ask the interrupt controller which device interrupt fired. Returns 0
    /// if none.
    unsafe fn irq_claim() -> u32;

    /// Tell the interrupt controller the IRQ has been served.
    unsafe fn irq_complete(irq: u32);

    /// IRQ line of the UART.
    const UART0_IRQ: u32;
    /// IRQ line of the virtio disk slot.
    const VIRTIO0_IRQ: u32;

    /// Save callee-saved registers into `old` and load them from `new`.
    /// Returns on the `new` stack; the caller is responsible for the
    /// page-table switch and for holding the process lock across the swap.
    ///
    /// # Safety
    ///
    /// Both contexts must be valid, and `new` must have been filled by a
    /// previous save (or by process setup).
    unsafe fn context_switch(old: *mut Context, new: *mut Context);

    /// Jump to the assembly that restores user registers from `tf` and
    /// executes the return-to-user instruction, after switching to the user
    /// page table described by `satp`.
    ///
    /// # Safety
    ///
    /// Must be called at the end of user-trap handling, with the trap frame
    /// fully prepared.
    unsafe fn user_trap_ret(satp: usize, tf: *mut TrapFrame) -> !;

    /// Encode a page-table root for installation in the translation CSR.
    fn make_satp(pagetable_pa: usize) -> usize;

    /// The physical range handed to the page allocator at boot.
    ///
    /// # Safety
    ///
    /// May be called only once; the range is given away to the allocator.
    unsafe fn page_pool_bounds() -> (usize, usize);

    /// Blocking console output of a single byte.
    fn console_putc(c: u8);
}
