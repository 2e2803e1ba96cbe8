//! Hart simulator backing the `Arch` trait on non-riscv builds.
//!
//! This is what `cargo test` runs against on the build machine: interrupt
//! enable bits and the timer are emulated in ordinary memory, and the page
//! allocator draws from a static arena instead of board RAM. Trap entry and
//! context switching have no meaning here; reaching them is a bug in a test.

use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::{
    arch::{Arch, TrapCause},
    page::Page,
    param::NCPU,
    proc::{Context, TrapFrame},
    vm::PGSIZE,
};

/// Pages handed to the allocator on the host.
const ARENA_PAGES: usize = 512;

#[repr(align(4096))]
struct Arena([u8; ARENA_PAGES * PGSIZE]);

static mut ARENA: Arena = Arena([0; ARENA_PAGES * PGSIZE]);

/// Emulated per-hart interrupt-enable flags. Tests that exercise the lock
/// discipline run serialized (see `test_support`), so a plain atomic per
/// simulated hart is enough.
static INTR_ENABLED: [AtomicBool; NCPU] = {
    const OFF: AtomicBool = AtomicBool::new(false);
    [OFF; NCPU]
};

/// Fake monotonic clock, advanced on every read.
static CLOCK_US: AtomicU64 = AtomicU64::new(0);

pub struct Host;

impl Arch for Host {
    const UART0_IRQ: u32 = 10;
    const VIRTIO0_IRQ: u32 = 1;

    fn cpu_id() -> usize {
        0
    }

    unsafe fn intr_on() {
        INTR_ENABLED[Self::cpu_id()].store(true, Ordering::Relaxed);
    }

    fn intr_off() {
        INTR_ENABLED[Self::cpu_id()].store(false, Ordering::Relaxed);
    }

    fn intr_get() -> bool {
        INTR_ENABLED[Self::cpu_id()].load(Ordering::Relaxed)
    }

    unsafe fn trap_init_core() {}

    unsafe fn switch_to_kernel_vec() {}

    fn trap_cause() -> TrapCause {
        TrapCause::Unknown { cause: 0 }
    }

    fn trap_from_supervisor() -> bool {
        true
    }

    fn trap_pc() -> usize {
        0
    }

    fn save_trap_regs(store: &mut [usize; 2]) {
        store[0] = 0;
        store[1] = 0;
    }

    unsafe fn restore_trap_regs(_store: &[usize; 2]) {}

    unsafe fn rearm_timer() {}

    fn time_us() -> u64 {
        CLOCK_US.fetch_add(1, Ordering::Relaxed)
    }

    unsafe fn irq_claim() -> u32 {
        0
    }

    unsafe fn irq_complete(_irq: u32) {}

    unsafe fn context_switch(_old: *mut Context, _new: *mut Context) {
        unreachable!("context switch on the host simulator");
    }

    unsafe fn user_trap_ret(_satp: usize, _tf: *mut TrapFrame) -> ! {
        unreachable!("user trap return on the host simulator");
    }

    fn make_satp(pagetable_pa: usize) -> usize {
        pagetable_pa
    }

    unsafe fn page_pool_bounds() -> (usize, usize) {
        let begin = unsafe { ARENA.0.as_ptr() as usize };
        (begin, begin + ARENA_PAGES * PGSIZE)
    }

    fn console_putc(c: u8) {
        // Swallowed; the host harness reads test results, not the console.
        let _ = c;
    }
}

/// The arena page backing a given address, for test assertions.
pub fn arena_contains(pa: usize) -> bool {
    let begin = unsafe { ARENA.0.as_ptr() as usize };
    (begin..begin + ARENA_PAGES * PGSIZE).contains(&pa)
}

static_assertions::const_assert!(core::mem::size_of::<Page>() == PGSIZE);
