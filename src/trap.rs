//! Trap handling: entry from user and supervisor mode, device-interrupt
//! routing, and the return path to user space.

use crate::{
    arch::{Arch, TargetArch, TrapCause},
    kernel::kernel,
    proc::{cpuid, myproc, yield_cpu},
    syscall::syscall,
    vm::PGSIZE,
    warn,
};

/// Handle an interrupt, exception, or system call from user space.
/// Called from the trampoline; the trap frame's `kernel_trap` points here.
#[no_mangle]
pub unsafe extern "C" fn usertrap() -> ! {
    assert!(
        !TargetArch::trap_from_supervisor(),
        "usertrap: not from user mode"
    );

    // Traps from now on are kernel traps.
    unsafe { TargetArch::switch_to_kernel_vec() };

    let p = unsafe { myproc() };
    assert!(!p.is_null(), "usertrap: no process");
    let data = unsafe { &mut *(*p).data.get() };

    // Save user program counter.
    data.trap_frame_mut().epc = TargetArch::trap_pc();

    let cause = TargetArch::trap_cause();
    match cause {
        TrapCause::UserEnvCall => {
            // System call.
            if unsafe { (*p).killed() } {
                unsafe { kernel().procs.exit_current(-1) };
            }

            // sepc points to the ecall instruction, but we want to return
            // to the next instruction.
            data.trap_frame_mut().epc += 4;

            // An interrupt will change trap registers, so only enable once
            // we are done with them.
            unsafe { TargetArch::intr_on() };
            unsafe { syscall() };
        }
        TrapCause::TimerInterrupt => timer_tick(),
        TrapCause::ExternalInterrupt => unsafe { device_interrupt() },
        TrapCause::MemoryFault { addr } => {
            crate::info!(
                "usertrap: memory fault in pid {}, bad addr = {:#x}, pc = {:#x}, core dumped",
                unsafe { (*p).pid() },
                addr,
                data.trap_frame().epc
            );
            unsafe { kernel().procs.exit_current(-2) };
        }
        TrapCause::IllegalInstruction => {
            crate::info!(
                "usertrap: illegal instruction in pid {}, core dumped",
                unsafe { (*p).pid() }
            );
            unsafe { kernel().procs.exit_current(-3) };
        }
        TrapCause::Unknown { cause } => {
            warn!("usertrap: unknown cause {:#x}", cause);
            unsafe { kernel().procs.exit_current(-1) };
        }
    }

    if unsafe { (*p).killed() } {
        unsafe { kernel().procs.exit_current(-1) };
    }

    // Give up the CPU if this was a timer interrupt.
    if let TrapCause::TimerInterrupt = cause {
        unsafe { yield_cpu() };
    }

    unsafe { usertrapret() }
}

/// Return to user space through the trampoline.
pub unsafe fn usertrapret() -> ! {
    let p = unsafe { myproc() };
    let data = unsafe { &mut *(*p).data.get() };

    // The trampoline needs these when the process next traps in.
    data.trap_frame_mut().kernel_sp = data.kstack + PGSIZE;
    data.trap_frame_mut().kernel_trap = usertrap as usize;

    let satp = data.memory.as_ref().expect("usertrapret: no image").satp();
    unsafe { TargetArch::user_trap_ret(satp, data.trap_frame) }
}

/// Interrupts and exceptions from kernel code come here via kernelvec, on
/// whatever the current kernel stack is. The kernel is non-preemptive:
/// a timer tick is accounted but never forces a yield here.
#[no_mangle]
pub unsafe extern "C" fn kerneltrap() {
    let mut saved = [0usize; 2];
    TargetArch::save_trap_regs(&mut saved);

    assert!(
        TargetArch::trap_from_supervisor(),
        "kerneltrap: not from supervisor mode"
    );
    assert!(!TargetArch::intr_get(), "kerneltrap: interrupts enabled");

    match TargetArch::trap_cause() {
        TrapCause::TimerInterrupt => timer_tick(),
        TrapCause::ExternalInterrupt => unsafe { device_interrupt() },
        cause => {
            crate::error!("kerneltrap: cause {:?}, pc = {:#x}", cause, saved[0]);
            panic!("kerneltrap");
        }
    }

    // Handlers above may have taken further traps; restore sepc and
    // sstatus for kernelvec's sret.
    unsafe { TargetArch::restore_trap_regs(&saved) };
}

/// Account one timer tick and schedule the next one.
fn timer_tick() {
    unsafe { TargetArch::rearm_timer() };
    if cpuid() == 0 {
        let mut ticks = kernel().ticks.lock();
        *ticks = ticks.wrapping_add(1);
        ticks.wakeup();
    }
}

/// Claim a device IRQ from the interrupt controller, dispatch it, and
/// complete it. Unknown IRQs are logged and completed.
unsafe fn device_interrupt() {
    let irq = unsafe { TargetArch::irq_claim() };

    if irq == TargetArch::UART0_IRQ {
        crate::console::intr();
    } else if irq == TargetArch::VIRTIO0_IRQ {
        // The block service owns this line; nothing to acknowledge without
        // a disk backend.
    } else if irq != 0 {
        warn!("unexpected interrupt irq={}", irq);
    }

    if irq != 0 {
        unsafe { TargetArch::irq_complete(irq) };
    }
}
