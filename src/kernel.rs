//! The kernel singleton: every process-wide table lives here, initialized
//! once at boot and torn down never.

use core::cell::UnsafeCell;
use core::fmt::{self, Write};
use core::sync::atomic::{AtomicBool, Ordering};

use crate::{
    arch::{Arch, TargetArch},
    file::{Devsw, FilePool},
    fs::Itable,
    kalloc::Kmem,
    lock::{Sleepablelock, Spinlock},
    param::{NCPU, NDEV},
    proc::{Cpu, Procs},
    shm::ShmPool,
};

static KERNEL: Kernel = Kernel::zero();

/// After boot-time initialization the kernel is safe to access immutably
/// from every core; all mutable state is behind locks or per-CPU cells.
#[inline]
pub fn kernel() -> &'static Kernel {
    &KERNEL
}

pub struct Kernel {
    panicked: AtomicBool,

    pub printer: Spinlock<Printer>,

    /// Physical page allocator.
    pub kmem: Spinlock<Kmem>,

    /// Timer interrupts since boot; sleepers on it are woken every tick.
    pub ticks: Sleepablelock<u32>,

    /// The `Cpu` struct of the current cpu can be mutated while others are
    /// only read, so the records sit in `UnsafeCell`s indexed by hart id.
    cpus: [UnsafeCell<Cpu>; NCPU],

    /// Process table.
    pub procs: Procs,

    /// System-wide pool of open files.
    pub ftable: FilePool,

    /// In-memory inode table; the file-system surface.
    pub itable: Itable,

    /// Named shared-memory segments.
    pub shm: Spinlock<ShmPool>,

    /// Map from major device number to device read/write handlers.
    pub devsw: Spinlock<[Devsw; NDEV]>,
}

// Raw CPU pointers and pool entries are shared across harts by design; all
// cross-CPU mutation goes through the locks above.
unsafe impl Sync for Kernel {}

impl Kernel {
    const fn zero() -> Self {
        // A named const makes the non-Copy repeat legal; every slot gets
        // its own copy.
        const CPU: UnsafeCell<Cpu> = UnsafeCell::new(Cpu::new());
        Self {
            panicked: AtomicBool::new(false),
            printer: Spinlock::new("PRINTLN", Printer::new()),
            kmem: Spinlock::new("KMEM", Kmem::new()),
            ticks: Sleepablelock::new("time", 0),
            cpus: [CPU; NCPU],
            procs: Procs::zero(),
            ftable: FilePool::zero(),
            itable: Itable::zero(),
            shm: Spinlock::new("SHM", ShmPool::zero()),
            devsw: Spinlock::new("DEVSW", [Devsw::NONE; NDEV]),
        }
    }

    fn panic(&self) {
        self.panicked.store(true, Ordering::Release);
    }

    pub fn is_panicked(&self) -> bool {
        self.panicked.load(Ordering::Acquire)
    }

    /// Return this CPU's cpu struct.
    ///
    /// The returned pointer is stable, but following it is only meaningful
    /// while interrupts are disabled on this CPU; otherwise the scheduler
    /// can move the thread to another hart between the call and the use.
    pub fn current_cpu_raw(&self) -> *mut Cpu {
        let id = TargetArch::cpu_id();
        self.cpus[id].get()
    }

    /// Prints the given formatted string with the Printer.
    pub fn printer_write_fmt(&self, args: fmt::Arguments<'_>) -> fmt::Result {
        if self.is_panicked() {
            // Skip the lock on the way down so a panic while printing still
            // gets diagnostics out.
            unsafe { (*self.printer.get_mut_raw()).write_fmt(args) }
        } else {
            let mut lock = self.printer.lock();
            lock.write_fmt(args)
        }
    }
}

/// Console output sink.
pub struct Printer;

impl Printer {
    pub const fn new() -> Self {
        Self
    }
}

impl Write for Printer {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for c in s.bytes() {
            TargetArch::console_putc(c);
        }
        Ok(())
    }
}

/// print! macro prints to the console using the kernel printer.
#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => {{
        let _ = $crate::kernel::kernel().printer_write_fmt(format_args!($($arg)*));
    }};
}

/// println! macro prints to the console using the kernel printer.
#[macro_export]
macro_rules! println {
    () => ($crate::print!("\n"));
    ($($arg:tt)*) => ($crate::print!("{}\n", format_args!($($arg)*)));
}

/// Handles panic.
#[cfg(not(test))]
#[panic_handler]
fn panic_handler(info: &core::panic::PanicInfo<'_>) -> ! {
    // Freeze other CPUs.
    kernel().panic();
    println!("{}", info);

    loop {
        core::hint::spin_loop();
    }
}

/// start() jumps here in supervisor mode on all CPUs.
#[cfg(target_arch = "riscv64")]
pub unsafe fn kernel_main() -> ! {
    use crate::proc::{cpuid, scheduler};

    static STARTED: AtomicBool = AtomicBool::new(false);

    if cpuid() == 0 {
        println!();
        println!("rvcore kernel is booting");
        println!();

        // Physical page allocator.
        let (begin, end) = unsafe { TargetArch::page_pool_bounds() };
        unsafe { kernel().kmem.lock().init(begin, end) };

        // Kernel page table; turn on paging.
        let memory = crate::vm::KernelMemory::init();
        unsafe { memory.init_hart() };

        // Process table (kernel stacks).
        unsafe { kernel().procs.init() };

        // Trap vector and timer.
        unsafe { TargetArch::trap_init_core() };

        // Set up the interrupt controller.
        unsafe { crate::arch::riscv::RiscV::plic_init() };
        unsafe { crate::arch::riscv::RiscV::plic_init_core() };

        // Devices.
        crate::console::init();

        // First user process.
        unsafe { kernel().procs.user_proc_init() };

        STARTED.store(true, Ordering::Release);
    } else {
        while !STARTED.load(Ordering::Acquire) {
            core::hint::spin_loop();
        }

        println!("hart {} starting", cpuid());

        unsafe { crate::vm::KernelMemory::shared().init_hart() };
        unsafe { TargetArch::trap_init_core() };
        unsafe { crate::arch::riscv::RiscV::plic_init_core() };
    }

    unsafe { scheduler() }
}
