//! RV64 supervisor-mode implementation of the `Arch` trait.
//!
//! The low-level register save/restore lives in platform assembly that this
//! crate declares but does not define: `trampoline`/`uservec`/`userret`
//! (user-register spill/fill around the page-table switch), `kernelvec`
//! (kernel trap entry) and `swtch` (callee-saved context swap). The SBI
//! firmware provides the timer and the console, as on any qemu-virt board
//! booted through RustSBI/OpenSBI.

use core::arch::asm;

use bitflags::bitflags;

use crate::{
    arch::{Arch, TrapCause},
    memlayout::{plic_sclaim, plic_senable, plic_spriority, TRAMPOLINE, UART0_IRQ, VIRTIO0_IRQ},
    proc::{Context, TrapFrame},
};

extern "C" {
    // trampoline.S
    static mut trampoline: [u8; 0];
    static mut uservec: [u8; 0];
    static mut userret: [u8; 0];

    // kernelvec.S: calls crate::trap::kerneltrap().
    fn kernelvec();

    // swtch.S
    fn swtch(old: *mut Context, new: *mut Context);

    // kernel.ld: first address after kernel text and data.
    static mut end: [u8; 0];
}

/// qemu -machine virt clocks the timer at 10 MHz.
const TIMEBASE_FREQ: u64 = 10_000_000;

/// Timer interrupt interval: 10ms.
const TIMER_INTERVAL: u64 = TIMEBASE_FREQ / 100;

const PHYSTOP: usize = crate::memlayout::PHYSTOP;

bitflags! {
    /// Supervisor Status Register, sstatus.
    pub struct Sstatus: usize {
        /// Previous mode, 1=Supervisor, 0=User
        const SPP = 1 << 8;

        /// Supervisor Previous Interrupt Enable
        const SPIE = 1 << 5;

        /// Supervisor Interrupt Enable
        const SIE = 1 << 1;
    }
}

bitflags! {
    /// Supervisor Interrupt Enable, sie.
    pub struct Sie: usize {
        /// external
        const SEIE = 1 << 9;

        /// timer
        const STIE = 1 << 5;

        /// software
        const SSIE = 1 << 1;
    }
}

impl Sstatus {
    #[inline]
    fn read() -> Self {
        let mut x;
        unsafe {
            asm!("csrr {x}, sstatus", x = out(reg) x);
        }
        Self::from_bits_truncate(x)
    }

    #[inline]
    unsafe fn write(self) {
        unsafe {
            asm!("csrw sstatus, {x}", x = in(reg) self.bits());
        }
    }
}

#[inline]
fn r_sie() -> usize {
    let mut x;
    unsafe {
        asm!("csrr {x}, sie", x = out(reg) x);
    }
    x
}

#[inline]
unsafe fn w_sie(x: usize) {
    unsafe {
        asm!("csrw sie, {x}", x = in(reg) x);
    }
}

#[inline]
fn r_scause() -> usize {
    let mut x;
    unsafe {
        asm!("csrr {x}, scause", x = out(reg) x);
    }
    x
}

#[inline]
fn r_stval() -> usize {
    let mut x;
    unsafe {
        asm!("csrr {x}, stval", x = out(reg) x);
    }
    x
}

#[inline]
fn r_sepc() -> usize {
    let mut x;
    unsafe {
        asm!("csrr {x}, sepc", x = out(reg) x);
    }
    x
}

#[inline]
unsafe fn w_sepc(x: usize) {
    unsafe {
        asm!("csrw sepc, {x}", x = in(reg) x);
    }
}

#[inline]
unsafe fn w_stvec(x: usize) {
    unsafe {
        asm!("csrw stvec, {x}", x = in(reg) x);
    }
}

#[inline]
fn r_satp() -> usize {
    let mut x;
    unsafe {
        asm!("csrr {x}, satp", x = out(reg) x);
    }
    x
}

#[inline]
pub fn r_tp() -> usize {
    let mut x;
    unsafe {
        asm!("mv {x}, tp", x = out(reg) x);
    }
    x
}

#[inline]
pub unsafe fn w_tp(x: usize) {
    unsafe {
        asm!("mv tp, {x}", x = in(reg) x);
    }
}

/// Machine timer, shared with the firmware.
#[inline]
fn r_time() -> u64 {
    let mut x;
    unsafe {
        asm!("csrr {x}, time", x = out(reg) x);
    }
    x
}

/// Legacy SBI call with a single argument (console, timer, shutdown).
#[inline]
unsafe fn sbi_legacy_call(eid: usize, arg0: usize) -> usize {
    let mut ret;
    unsafe {
        asm!(
            "ecall",
            inlateout("a0") arg0 => ret,
            in("a6") 0,
            in("a7") eid,
        );
    }
    ret
}

const SBI_SET_TIMER: usize = 0;
const SBI_CONSOLE_PUTCHAR: usize = 1;

/// Interrupt cause numbers, with the high (interrupt) bit stripped.
const IRQ_S_SOFT: usize = 1;
const IRQ_S_TIMER: usize = 5;
const IRQ_S_EXT: usize = 9;

/// Exception cause numbers.
const EXC_ILLEGAL_INSTRUCTION: usize = 2;
const EXC_USER_ENV_CALL: usize = 8;

const INTERRUPT_BIT: usize = 1 << 63;

pub struct RiscV;

impl RiscV {
    /// Set desired IRQ priorities non-zero (otherwise disabled).
    ///
    /// # Safety
    ///
    /// Must be called once, by the boot core.
    pub unsafe fn plic_init() {
        unsafe {
            *((crate::memlayout::PLIC + UART0_IRQ as usize * 4) as *mut u32) = 1;
            *((crate::memlayout::PLIC + VIRTIO0_IRQ as usize * 4) as *mut u32) = 1;
        }
    }

    /// Enable the device IRQs for this hart's S-mode and accept any priority.
    ///
    /// # Safety
    ///
    /// Must be called once per core.
    pub unsafe fn plic_init_core() {
        let hart = r_tp();
        unsafe {
            *(plic_senable(hart) as *mut u32) = 1 << UART0_IRQ | 1 << VIRTIO0_IRQ;
            *(plic_spriority(hart) as *mut u32) = 0;
        }
    }
}

impl Arch for RiscV {
    const UART0_IRQ: u32 = UART0_IRQ;
    const VIRTIO0_IRQ: u32 = VIRTIO0_IRQ;

    fn cpu_id() -> usize {
        r_tp()
    }

    unsafe fn intr_on() {
        unsafe { (Sstatus::read() | Sstatus::SIE).write() };
    }

    fn intr_off() {
        unsafe { (Sstatus::read() - Sstatus::SIE).write() };
    }

    fn intr_get() -> bool {
        Sstatus::read().contains(Sstatus::SIE)
    }

    unsafe fn trap_init_core() {
        unsafe {
            w_stvec(kernelvec as usize);
            w_sie(r_sie() | (Sie::SEIE | Sie::STIE | Sie::SSIE).bits());
            Self::rearm_timer();
        }
    }

    unsafe fn switch_to_kernel_vec() {
        unsafe { w_stvec(kernelvec as usize) };
    }

    fn trap_cause() -> TrapCause {
        let cause = r_scause();
        if cause & INTERRUPT_BIT != 0 {
            match cause & 0xff {
                IRQ_S_TIMER | IRQ_S_SOFT => TrapCause::TimerInterrupt,
                IRQ_S_EXT => TrapCause::ExternalInterrupt,
                _ => TrapCause::Unknown { cause },
            }
        } else {
            match cause {
                EXC_USER_ENV_CALL => TrapCause::UserEnvCall,
                EXC_ILLEGAL_INSTRUCTION => TrapCause::IllegalInstruction,
                // instruction/load/store access and page faults
                1 | 5 | 7 | 12 | 13 | 15 => TrapCause::MemoryFault { addr: r_stval() },
                _ => TrapCause::Unknown { cause },
            }
        }
    }

    fn trap_from_supervisor() -> bool {
        Sstatus::read().contains(Sstatus::SPP)
    }

    fn trap_pc() -> usize {
        r_sepc()
    }

    fn save_trap_regs(store: &mut [usize; 2]) {
        store[0] = r_sepc();
        store[1] = Sstatus::read().bits();
    }

    unsafe fn restore_trap_regs(store: &[usize; 2]) {
        unsafe {
            w_sepc(store[0]);
            Sstatus::from_bits_truncate(store[1]).write();
        }
    }

    unsafe fn rearm_timer() {
        unsafe { sbi_legacy_call(SBI_SET_TIMER, (r_time() + TIMER_INTERVAL) as usize) };
    }

    fn time_us() -> u64 {
        r_time() / (TIMEBASE_FREQ / 1_000_000)
    }

    unsafe fn irq_claim() -> u32 {
        let hart = r_tp();
        unsafe { *(plic_sclaim(hart) as *const u32) }
    }

    unsafe fn irq_complete(irq: u32) {
        let hart = r_tp();
        unsafe { *(plic_sclaim(hart) as *mut u32) = irq };
    }

    unsafe fn context_switch(old: *mut Context, new: *mut Context) {
        unsafe { swtch(old, new) };
    }

    unsafe fn user_trap_ret(satp: usize, tf: *mut TrapFrame) -> ! {
        unsafe {
            // We're about to switch the destination of traps from kernelvec
            // to uservec, so turn off interrupts until we're back in user
            // space, where uservec is correct.
            Self::intr_off();
            let trampoline_uservec =
                TRAMPOLINE + (uservec.as_ptr() as usize - trampoline.as_ptr() as usize);
            w_stvec(trampoline_uservec);

            // Values uservec needs when the process next traps into the
            // kernel.
            (*tf).kernel_satp = r_satp();
            (*tf).kernel_hartid = r_tp();

            // Set S Previous Privilege mode to User, enable interrupts in
            // user mode.
            let sstatus = (Sstatus::read() - Sstatus::SPP) | Sstatus::SPIE;
            sstatus.write();

            // The sret in userret will jump to the saved user pc.
            w_sepc((*tf).epc);

            // Jump to userret in trampoline.S at the top of memory, which
            // switches to the user page table, restores user registers, and
            // switches to user mode with sret.
            let trampoline_userret =
                TRAMPOLINE + (userret.as_ptr() as usize - trampoline.as_ptr() as usize);
            let userret_fn: unsafe extern "C" fn(usize, usize) -> ! =
                core::mem::transmute(trampoline_userret);
            userret_fn(crate::memlayout::TRAPFRAME, satp)
        }
    }

    fn make_satp(pagetable_pa: usize) -> usize {
        // Sv39 mode.
        (8 << 60) | (pagetable_pa >> 12)
    }

    unsafe fn page_pool_bounds() -> (usize, usize) {
        (unsafe { end.as_ptr() as usize }, PHYSTOP)
    }

    fn console_putc(c: u8) {
        unsafe { sbi_legacy_call(SBI_CONSOLE_PUTCHAR, c as usize) };
    }
}

/// Sv39 page-table installation for a core; used when turning on paging at
/// boot.
///
/// # Safety
///
/// `satp` must describe a page table that maps the kernel.
pub unsafe fn install_pagetable(satp: usize) {
    unsafe {
        asm!("sfence.vma zero, zero");
        asm!("csrw satp, {x}", x = in(reg) satp);
        asm!("sfence.vma zero, zero");
    }
}
