//! Process table, per-CPU state, the scheduler, and the sleep/wakeup
//! primitives.
//!
//! Locking: each process entry carries its own spinlock (`Proc::info`),
//! which guards the state machine. A global `wait_lock` additionally
//! serializes parent/child link reads for wait/exit and must be acquired
//! before any process lock. `ProcData` is private to the process and needs
//! no lock while its owner runs.

use core::cell::UnsafeCell;
use core::mem;
use core::ptr::{self, NonNull};
use core::sync::atomic::{AtomicBool, AtomicI32, AtomicPtr, Ordering};

use arrayvec::ArrayVec;
use itertools::izip;
use static_assertions::const_assert;

use crate::{
    arch::{Arch, TargetArch},
    file::RcFile,
    fs::RcInode,
    kernel::kernel,
    lock::{RawSpinlock, Spinlock},
    mailbox::Mailbox,
    memlayout::{kstack, SHAREDMEM_BASE},
    page::Page,
    param::{FD_MAX, INIT_PRIORITY, MAXPROCNAME, MAX_PROC_SHM, NPROC},
    println,
    vm::{UserMemory, PGSIZE},
};

/// Saved registers for kernel context switches.
#[derive(Copy, Clone, Default)]
#[repr(C)]
pub struct Context {
    pub ra: usize,
    pub sp: usize,

    /// Callee-saved
    pub s0: usize,
    pub s1: usize,
    pub s2: usize,
    pub s3: usize,
    pub s4: usize,
    pub s5: usize,
    pub s6: usize,
    pub s7: usize,
    pub s8: usize,
    pub s9: usize,
    pub s10: usize,
    pub s11: usize,
}

impl Context {
    pub const fn new() -> Self {
        Self {
            ra: 0,
            sp: 0,
            s0: 0,
            s1: 0,
            s2: 0,
            s3: 0,
            s4: 0,
            s5: 0,
            s6: 0,
            s7: 0,
            s8: 0,
            s9: 0,
            s10: 0,
            s11: 0,
        }
    }
}

/// Per-process data for the trap handling code in the trampoline. Sits in a
/// page by itself just under the trampoline page in the user page table.
/// The trampoline saves user registers here on entry and restores them on
/// the way out; the `kernel_*` fields tell it where the kernel lives.
#[derive(Copy, Clone)]
#[repr(C)]
pub struct TrapFrame {
    /// 0 - kernel page table (satp)
    pub kernel_satp: usize,
    /// 8 - top of process's kernel stack
    pub kernel_sp: usize,
    /// 16 - address of the kernel's usertrap()
    pub kernel_trap: usize,
    /// 24 - saved user program counter
    pub epc: usize,
    /// 32 - saved kernel tp; hartid for cpuid()
    pub kernel_hartid: usize,
    /// 40
    pub ra: usize,
    /// 48
    pub sp: usize,
    /// 56
    pub gp: usize,
    /// 64
    pub tp: usize,
    /// 72
    pub t0: usize,
    /// 80
    pub t1: usize,
    /// 88
    pub t2: usize,
    /// 96
    pub s0: usize,
    /// 104
    pub s1: usize,
    /// 112
    pub a0: usize,
    /// 120
    pub a1: usize,
    /// 128
    pub a2: usize,
    /// 136
    pub a3: usize,
    /// 144
    pub a4: usize,
    /// 152
    pub a5: usize,
    /// 160
    pub a6: usize,
    /// 168
    pub a7: usize,
    /// 176
    pub s2: usize,
    /// 184
    pub s3: usize,
    /// 192
    pub s4: usize,
    /// 200
    pub s5: usize,
    /// 208
    pub s6: usize,
    /// 216
    pub s7: usize,
    /// 224
    pub s8: usize,
    /// 232
    pub s9: usize,
    /// 240
    pub s10: usize,
    /// 248
    pub s11: usize,
    /// 256
    pub t3: usize,
    /// 264
    pub t4: usize,
    /// 272
    pub t5: usize,
    /// 280
    pub t6: usize,
}

// The trampoline addresses trap-frame fields by fixed offsets.
const_assert!(mem::size_of::<TrapFrame>() == 288);

/// Per-CPU state.
pub struct Cpu {
    /// The process running on this cpu, or null.
    pub proc: *mut Proc,

    /// Context-switch here to enter the scheduler loop.
    pub context: Context,

    /// Depth of push_off() nesting.
    pub noff: i32,

    /// Were interrupts enabled before push_off()?
    pub interrupt_enabled: bool,
}

impl Cpu {
    pub const fn new() -> Self {
        Self {
            proc: ptr::null_mut(),
            context: Context::new(),
            noff: 0,
            interrupt_enabled: false,
        }
    }
}

#[derive(Copy, Clone, PartialEq, Debug)]
pub enum Procstate {
    UNUSED,
    USED,
    SLEEPING,
    RUNNABLE,
    RUNNING,
    ZOMBIE,
}

impl Procstate {
    fn as_str(&self) -> &'static str {
        match self {
            Procstate::UNUSED => "unused",
            Procstate::USED => "used",
            Procstate::SLEEPING => "sleep ",
            Procstate::RUNNABLE => "runble",
            Procstate::RUNNING => "run   ",
            Procstate::ZOMBIE => "zombie",
        }
    }
}

/// Represents lock guards that can be slept on in a `WaitChannel`.
pub trait Waitable {
    /// Releases the inner `RawSpinlock`.
    ///
    /// # Safety
    ///
    /// `raw_release()` and `raw_acquire()` must always be used as a pair;
    /// do not access the protected data in between.
    unsafe fn raw_release(&mut self);

    /// Re-acquires the inner `RawSpinlock`.
    ///
    /// # Safety
    ///
    /// Must be paired with a previous `raw_release()`.
    unsafe fn raw_acquire(&mut self);
}

/// A wait-queue identity. Sleepers record this object's address; any stable
/// kernel address works as a channel.
pub struct WaitChannel {
    /// Required to make this type non-zero-sized. If it were zero-sized,
    /// multiple wait channels could share an address, spuriously waking
    /// unrelated sleepers.
    _padding: u8,
}

impl WaitChannel {
    pub const fn new() -> Self {
        Self { _padding: 0 }
    }

    /// Atomically release `lk` and sleep on this channel; reacquires `lk`
    /// when awakened. The process lock is taken before `lk` is released, and
    /// wakeups take the process lock before checking state, so no wakeup is
    /// lost provided the waker held the condition's lock when signaling.
    pub fn sleep<T: Waitable>(&self, lk: &mut T) {
        let p = unsafe { myproc() };
        assert!(!p.is_null(), "sleep with no process");
        let p = unsafe { &*p };

        let mut guard = p.lock();
        unsafe { lk.raw_release() };

        // Go to sleep.
        guard.deref_mut_info().waitchannel = self;
        guard.deref_mut_info().state = Procstate::SLEEPING;
        unsafe { guard.sched() };

        // Tidy up.
        guard.deref_mut_info().waitchannel = ptr::null();

        // Reacquire original lock.
        drop(guard);
        unsafe { lk.raw_acquire() };
    }

    /// Wake up all processes sleeping on this channel.
    /// Must be called without holding any process lock.
    pub fn wakeup(&self) {
        kernel().procs.wakeup_pool(self);
    }
}

/// State-machine fields; `Proc::info`'s spinlock must be held to use them.
pub struct ProcInfo {
    /// Process state.
    pub state: Procstate,

    /// If non-null, sleeping on this channel.
    waitchannel: *const WaitChannel,

    /// Channel the parent waits on for this process's children.
    child_waitchannel: WaitChannel,

    /// Exit status to be returned to parent's wait.
    xstate: i32,

    /// Process ID.
    pub pid: i32,

    /// Scheduling priority; >= 2, larger values run first.
    pub priority: i64,
}

/// A shared-memory attachment of this process.
pub struct ShmMapping {
    pub seg: usize,
    pub va: usize,
    pub npages: usize,
}

/// Fields private to the process, so the lock need not be held to access
/// them while the process itself runs.
pub struct ProcData {
    /// Virtual address of kernel stack.
    pub kstack: usize,

    /// Trap frame page for the trampoline.
    pub trap_frame: *mut TrapFrame,

    /// User address space.
    pub memory: Option<UserMemory>,

    /// Context-switch here to run the process.
    context: Context,

    /// Open files.
    pub files: [Option<RcFile>; FD_MAX],

    /// Current directory; `None` means the root.
    pub cwd: Option<RcInode>,

    /// Live shared-memory attachments.
    pub shm_maps: ArrayVec<ShmMapping, MAX_PROC_SHM>,

    /// Next free virtual address for a shared-memory attachment.
    pub shm_top: usize,

    /// Process name (debugging).
    pub name: [u8; MAXPROCNAME],
}

impl ProcData {
    const fn new() -> Self {
        const NO_FILE: Option<RcFile> = None;
        Self {
            kstack: 0,
            trap_frame: ptr::null_mut(),
            memory: None,
            context: Context::new(),
            files: [NO_FILE; FD_MAX],
            cwd: None,
            shm_maps: ArrayVec::new_const(),
            shm_top: SHAREDMEM_BASE,
            name: [0; MAXPROCNAME],
        }
    }

    pub fn trap_frame(&self) -> &TrapFrame {
        unsafe { &*self.trap_frame }
    }

    pub fn trap_frame_mut(&mut self) -> &mut TrapFrame {
        unsafe { &mut *self.trap_frame }
    }

    /// Allocate the lowest free file descriptor for `f`.
    /// Hands `f` back on failure.
    pub fn fd_alloc(&mut self, f: RcFile) -> Result<i32, RcFile> {
        for fd in 0..FD_MAX {
            if self.files[fd].is_none() {
                self.files[fd] = Some(f);
                return Ok(fd as i32);
            }
        }
        Err(f)
    }

    /// Place `f` at descriptor `want`, closing any prior occupant.
    pub fn fd_alloc_at(&mut self, f: RcFile, want: i32) -> Result<i32, RcFile> {
        if want < 0 || want as usize >= FD_MAX {
            return Err(f);
        }
        // Dropping the old occupant closes it.
        self.files[want as usize] = Some(f);
        Ok(want)
    }

    pub fn fd_get(&self, fd: i32) -> Option<&RcFile> {
        if fd < 0 || fd as usize >= FD_MAX {
            return None;
        }
        self.files[fd as usize].as_ref()
    }

    /// Close all open files and drop the cwd reference.
    fn release_fs_refs(&mut self) {
        for file in self.files.iter_mut() {
            *file = None;
        }
        self.cwd = None;
    }
}

/// Per-process state.
pub struct Proc {
    info: Spinlock<ProcInfo>,

    /// Parent process. Guarded by `Procs::wait_lock`, not by `info`; a weak
    /// back-reference that is never traversed child->parent->children.
    parent: UnsafeCell<*mut Proc>,

    pub data: UnsafeCell<ProcData>,

    /// If true, the process has been killed and will exit at the next
    /// user-trap boundary.
    killed: AtomicBool,

    /// Incoming mail; written by other processes under its own lock.
    pub mailbox: Spinlock<Mailbox>,
}

impl Proc {
    const fn zero() -> Self {
        Self {
            info: Spinlock::new(
                "proc",
                ProcInfo {
                    state: Procstate::UNUSED,
                    waitchannel: ptr::null(),
                    child_waitchannel: WaitChannel::new(),
                    xstate: 0,
                    pid: 0,
                    priority: INIT_PRIORITY,
                },
            ),
            parent: UnsafeCell::new(ptr::null_mut()),
            data: UnsafeCell::new(ProcData::new()),
            killed: AtomicBool::new(false),
            mailbox: Spinlock::new("mailbox", Mailbox::zero()),
        }
    }

    pub fn lock(&self) -> ProcGuard<'_> {
        mem::forget(self.info.lock());
        ProcGuard { proc: self }
    }

    /// Read the pid without the lock; callers tolerate a stale value.
    pub fn pid(&self) -> i32 {
        unsafe { self.info.get_mut_unchecked() }.pid
    }

    /// Mark as killed; observed at the next user-trap boundary.
    pub fn kill(&self) {
        self.killed.store(true, Ordering::Release);
    }

    pub fn killed(&self) -> bool {
        self.killed.load(Ordering::Acquire)
    }

    pub fn data_raw(&self) -> *mut ProcData {
        self.data.get()
    }
}

/// Proof that `Proc::info` is held; grants access to the info fields and to
/// the protected parts of the state machine.
pub struct ProcGuard<'s> {
    proc: &'s Proc,
}

impl ProcGuard<'_> {
    pub fn deref_info(&self) -> &ProcInfo {
        unsafe { self.proc.info.get_mut_unchecked() }
    }

    pub fn deref_mut_info(&mut self) -> &mut ProcInfo {
        unsafe { self.proc.info.get_mut_unchecked() }
    }

    pub fn proc_ref(&self) -> &Proc {
        self.proc
    }

    fn context_raw(&self) -> *mut Context {
        unsafe { &mut (*self.proc.data.get()).context }
    }

    /// Wake from sleep if sleeping on `target`.
    fn wakeup_on(&mut self, target: *const WaitChannel) {
        let info = self.deref_mut_info();
        if info.state == Procstate::SLEEPING && info.waitchannel == target {
            info.state = Procstate::RUNNABLE;
        }
    }

    /// Switch to the scheduler. Must hold only this process's lock and have
    /// already changed state away from RUNNING. Saves and restores
    /// `interrupt_enabled` because it is a property of this kernel thread,
    /// not of the CPU it happens to run on next.
    ///
    /// # Safety
    ///
    /// Interrupts must be disabled, with exactly this one lock held.
    pub unsafe fn sched(&mut self) {
        let cpu = kernel().current_cpu_raw();
        assert_eq!(unsafe { (*cpu).noff }, 1, "sched locks");
        assert_ne!(self.deref_info().state, Procstate::RUNNING, "sched running");
        assert!(!TargetArch::intr_get(), "sched interruptible");

        let interrupt_enabled = unsafe { (*cpu).interrupt_enabled };
        unsafe { TargetArch::context_switch(self.context_raw(), &mut (*cpu).context) };
        // A timer interrupt may have moved this thread to a different CPU.
        let cpu = kernel().current_cpu_raw();
        unsafe { (*cpu).interrupt_enabled = interrupt_enabled };
    }

    /// Return the process slot to UNUSED, freeing the trap frame page and
    /// the user image. Parent link clearing requires the wait lock.
    fn clear(&mut self, _parent_held: &WaitLockGuard<'_>) {
        let data = unsafe { &mut *self.proc.data.get() };
        let trap_frame = mem::replace(&mut data.trap_frame, ptr::null_mut());
        if !trap_frame.is_null() {
            kernel()
                .kmem
                .lock()
                .free(unsafe { NonNull::new_unchecked(trap_frame as *mut Page) });
        }
        data.memory = None;
        data.name[0] = 0;
        data.shm_maps.clear();
        data.shm_top = SHAREDMEM_BASE;

        unsafe { *self.proc.parent.get() = ptr::null_mut() };
        self.proc.mailbox.lock().reset();
        self.proc.killed.store(false, Ordering::Release);

        let info = self.deref_mut_info();
        info.pid = 0;
        info.waitchannel = ptr::null();
        info.xstate = 0;
        info.priority = INIT_PRIORITY;
        info.state = Procstate::UNUSED;
    }
}

impl Drop for ProcGuard<'_> {
    fn drop(&mut self) {
        unsafe { self.proc.info.unlock() };
    }
}

/// Proof that the global wait lock is held.
pub struct WaitLockGuard<'s> {
    lock: &'s RawSpinlock,
}

impl Waitable for WaitLockGuard<'_> {
    unsafe fn raw_release(&mut self) {
        self.lock.release();
    }

    unsafe fn raw_acquire(&mut self) {
        self.lock.acquire();
    }
}

impl Drop for WaitLockGuard<'_> {
    fn drop(&mut self) {
        self.lock.release();
    }
}

/// The process table.
pub struct Procs {
    nextpid: AtomicI32,
    pool: [Proc; NPROC],
    initial_proc: AtomicPtr<Proc>,

    /// Helps ensure that wakeups of wait()ing parents are not lost, and
    /// guards all `Proc::parent` fields. Must be acquired before any
    /// process lock.
    wait_lock: RawSpinlock,
}

impl Procs {
    pub const fn zero() -> Self {
        const SLOT: Proc = Proc::zero();
        Self {
            nextpid: AtomicI32::new(1),
            pool: [SLOT; NPROC],
            initial_proc: AtomicPtr::new(ptr::null_mut()),
            wait_lock: RawSpinlock::new("wait_lock"),
        }
    }

    /// Record each slot's kernel stack. The stacks themselves are mapped by
    /// the kernel page table at boot.
    ///
    /// # Safety
    ///
    /// Must run once, before the first process is created.
    pub unsafe fn init(&self) {
        for (i, p) in izip!(0..NPROC, &self.pool) {
            unsafe { (*p.data.get()).kstack = kstack(i) };
        }
    }

    pub fn wait_lock(&self) -> WaitLockGuard<'_> {
        self.wait_lock.acquire();
        WaitLockGuard {
            lock: &self.wait_lock,
        }
    }

    fn allocpid(&self) -> i32 {
        self.nextpid.fetch_add(1, Ordering::Relaxed)
    }

    /// Look for an UNUSED slot and initialize it to run in the kernel,
    /// returning with the slot's lock held. The given trap frame page and
    /// user memory are consumed either way.
    fn alloc(&self, trap_frame: NonNull<Page>, memory: UserMemory) -> Result<ProcGuard<'_>, ()> {
        for p in &self.pool {
            let mut guard = p.lock();
            if guard.deref_info().state == Procstate::UNUSED {
                let data = unsafe { &mut *p.data.get() };
                guard.deref_mut_info().pid = self.allocpid();
                guard.deref_mut_info().priority = INIT_PRIORITY;
                guard.deref_mut_info().state = Procstate::USED;

                data.trap_frame = trap_frame.as_ptr() as *mut TrapFrame;
                data.memory = Some(memory);

                // Start executing at forkret, which returns to user space.
                data.context = Context::new();
                data.context.ra = forkret as usize;
                data.context.sp = data.kstack.wrapping_add(PGSIZE);
                return Ok(guard);
            }
        }

        kernel().kmem.lock().free(trap_frame);
        Err(())
    }

    /// Claim a process slot for spawn. The caller finishes the trap frame
    /// and parent link before marking it RUNNABLE.
    pub fn alloc_for_spawn(
        &self,
        trap_frame: NonNull<Page>,
        memory: UserMemory,
    ) -> Result<ProcGuard<'_>, ()> {
        self.alloc(trap_frame, memory)
    }

    /// Write a child's parent back-reference.
    ///
    /// # Safety
    ///
    /// The wait lock must be held.
    pub unsafe fn set_parent(&self, child: *const Proc, parent: *mut Proc) {
        unsafe { *(*child).parent.get() = parent };
    }

    /// Set up the first user process.
    ///
    /// # Safety
    ///
    /// Must be called once, by the boot core.
    pub unsafe fn user_proc_init(&self) {
        let trap_frame = kernel()
            .kmem
            .lock()
            .alloc()
            .expect("user_proc_init: out of memory");
        let memory = UserMemory::new(trap_frame.as_ptr() as usize, Some(&INITCODE))
            .expect("user_proc_init: UserMemory::new");

        let mut guard = self
            .alloc(trap_frame, memory)
            .expect("user_proc_init: no slot");
        self.initial_proc
            .store(guard.proc_ref() as *const _ as *mut _, Ordering::Release);

        let data = unsafe { &mut *guard.proc_ref().data.get() };

        // Prepare for the very first "return" from kernel to user.
        data.trap_frame_mut().epc = 0;
        data.trap_frame_mut().sp = PGSIZE;
        let name = b"initcode";
        data.name[..name.len()].copy_from_slice(name);

        guard.deref_mut_info().state = Procstate::RUNNABLE;
    }

    fn initial_proc(&self) -> *mut Proc {
        self.initial_proc.load(Ordering::Acquire)
    }

    /// Create a new process, copying the parent. A non-zero `child_stack`
    /// replaces the child's user stack pointer. Sets up the child to return
    /// as if from the syscall, with return value 0.
    pub unsafe fn fork(&self, child_stack: usize) -> Result<i32, ()> {
        let p = unsafe { myproc() };
        let pdata = unsafe { &mut *(*p).data.get() };

        // Allocate trap frame.
        let trap_frame = kernel().kmem.lock().alloc().ok_or(())?;
        let trap_frame = scopeguard::guard(trap_frame, |tf| kernel().kmem.lock().free(tf));

        // Copy user memory from parent to child.
        let memory = pdata
            .memory
            .as_mut()
            .expect("fork: no memory")
            .try_clone(trap_frame.as_ptr() as usize)
            .ok_or(())?;

        // Allocate process.
        let mut np = self.alloc(scopeguard::ScopeGuard::into_inner(trap_frame), memory)?;
        let npdata = unsafe { &mut *np.proc_ref().data.get() };

        // Copy saved user registers; fork returns 0 in the child.
        *npdata.trap_frame_mut() = *pdata.trap_frame();
        npdata.trap_frame_mut().a0 = 0;
        if child_stack != 0 {
            npdata.trap_frame_mut().sp = child_stack;
        }

        // Increment reference counts on open file descriptors.
        for (new_file, old_file) in izip!(&mut npdata.files, &pdata.files) {
            *new_file = old_file.clone();
        }
        npdata.cwd = pdata.cwd.clone();
        npdata.name = pdata.name;

        let pid = np.deref_info().pid;
        let child = np.proc_ref() as *const Proc;

        // Drop the guard before taking the wait lock: the lock order is
        // wait_lock -> process lock.
        drop(np);

        let parent_guard = self.wait_lock();
        unsafe { *(*child).parent.get() = p };

        let mut np = unsafe { (*child).lock() };
        np.deref_mut_info().state = Procstate::RUNNABLE;
        drop(np);
        drop(parent_guard);

        Ok(pid)
    }

    /// Pass p's abandoned children to init. Caller must hold the wait lock.
    fn reparent(&self, p: *mut Proc, _guard: &WaitLockGuard<'_>) {
        let init = self.initial_proc();
        for pp in &self.pool {
            if unsafe { *pp.parent.get() } == p {
                unsafe { *pp.parent.get() = init };
                unsafe { (*init).info.get_mut_unchecked() }
                    .child_waitchannel
                    .wakeup();
            }
        }
    }

    /// Exit the current process; does not return. The exited process stays
    /// ZOMBIE until its parent calls wait.
    pub unsafe fn exit_current(&self, status: i32) -> ! {
        let p = unsafe { myproc() };
        assert!(p != self.initial_proc(), "init exiting");
        let data = unsafe { &mut *(*p).data.get() };

        data.release_fs_refs();
        crate::shm::detach_all(data);
        // The user image is gone from here on; only the slot, the pid and
        // the exit status survive until the parent reaps them.
        data.memory = None;

        let parent_guard = self.wait_lock();
        self.reparent(p as *mut Proc, &parent_guard);

        // Parent might be sleeping in wait().
        let parent = unsafe { *(*p).parent.get() };
        if !parent.is_null() {
            unsafe { (*parent).info.get_mut_unchecked() }
                .child_waitchannel
                .wakeup();
        }

        let mut guard = unsafe { (*p).lock() };
        guard.deref_mut_info().xstate = status;
        guard.deref_mut_info().state = Procstate::ZOMBIE;

        // Manually dropped since this function never returns.
        drop(parent_guard);

        // Jump into the scheduler, never to return.
        unsafe { guard.sched() };
        unreachable!("zombie exit");
    }

    /// Wait for a child matching `pid` (-1 for any) to exit; copies its exit
    /// status to `addr` (if non-zero) and frees its slot. With `nohang`,
    /// returns Ok(0) instead of blocking when no matching child has exited
    /// yet. Errors if there is no matching child at all.
    pub unsafe fn wait(&self, pid: i32, addr: usize, nohang: bool) -> Result<i32, ()> {
        let p = unsafe { myproc() };
        let mut parent_guard = self.wait_lock();

        loop {
            let mut havekids = false;
            for np in &self.pool {
                if unsafe { *np.parent.get() } != p {
                    continue;
                }
                // Make sure the child isn't still in exit() or sched().
                let mut child = np.lock();
                if pid != -1 && child.deref_info().pid != pid {
                    continue;
                }
                havekids = true;
                if child.deref_info().state == Procstate::ZOMBIE {
                    let child_pid = child.deref_info().pid;
                    if addr != 0 {
                        let xstate = child.deref_info().xstate;
                        let data = unsafe { &mut *(*p).data.get() };
                        let memory = data.memory.as_mut().ok_or(())?;
                        // Linux packs the code into wstatus bits 8..16.
                        let wstatus = (xstate as i32) << 8;
                        if memory.copy_out(addr, &wstatus.to_ne_bytes()).is_err() {
                            return Err(());
                        }
                    }
                    child.clear(&parent_guard);
                    return Ok(child_pid);
                }
            }

            // No point waiting if we don't have any children.
            if !havekids || unsafe { (*p).killed() } {
                return Err(());
            }
            if nohang {
                return Ok(0);
            }

            // Wait for a child to exit.
            let chan =
                &unsafe { (*p).info.get_mut_unchecked() }.child_waitchannel as *const WaitChannel;
            unsafe { (*chan).sleep(&mut parent_guard) };
        }
    }

    /// The parent's pid, or -1 for an orphan. Reads the link under the wait
    /// lock.
    pub unsafe fn parent_pid(&self) -> i64 {
        let p = unsafe { myproc() };
        let _guard = self.wait_lock();
        let parent = unsafe { *(*p).parent.get() };
        if parent.is_null() {
            -1
        } else {
            unsafe { (*parent).pid() as i64 }
        }
    }

    /// Kill the process with the given pid. The victim exits when it next
    /// crosses the user-trap boundary.
    pub fn kill(&self, pid: i32) -> Result<(), ()> {
        for p in &self.pool {
            let mut guard = p.lock();
            if guard.deref_info().pid == pid && guard.deref_info().state != Procstate::UNUSED {
                p.kill();
                // Wake it so a sleeper notices.
                let info = guard.deref_mut_info();
                if info.state == Procstate::SLEEPING {
                    info.state = Procstate::RUNNABLE;
                }
                return Ok(());
            }
        }
        Err(())
    }

    /// Wake up all processes in the pool sleeping on `target`, except the
    /// caller itself.
    pub fn wakeup_pool(&self, target: &WaitChannel) {
        let me = unsafe { myproc() } as *const Proc;
        for p in &self.pool {
            if p as *const Proc != me {
                let mut guard = p.lock();
                guard.wakeup_on(target);
            }
        }
    }

    /// Find a mailbox by pid and deliver through `f`.
    pub fn with_mailbox_of<R>(&self, pid: i32, f: impl FnOnce(&mut Mailbox) -> R) -> Result<R, ()> {
        for p in &self.pool {
            let guard = p.lock();
            if guard.deref_info().pid == pid && guard.deref_info().state != Procstate::UNUSED {
                // The mailbox has its own lock; the proc lock only pins the
                // slot to this pid while we take it.
                let mut mbox = p.mailbox.lock();
                let r = f(&mut mbox);
                return Ok(r);
            }
        }
        Err(())
    }

    /// One scheduling pass: among RUNNABLE processes, pick the one with the
    /// highest priority value, table order breaking ties. The peek is
    /// unlocked; callers must revalidate under the entry's lock.
    pub fn pick_runnable(&self) -> Option<&Proc> {
        let mut best: Option<(&Proc, i64)> = None;
        for p in &self.pool {
            let info = unsafe { p.info.get_mut_unchecked() };
            if info.state == Procstate::RUNNABLE {
                match best {
                    Some((_, prio)) if prio >= info.priority => {}
                    _ => best = Some((p, info.priority)),
                }
            }
        }
        best.map(|(p, _)| p)
    }

    /// Print a process listing to the console for debugging. Runs when a
    /// user types ^P on the console. No locks, to avoid wedging a stuck
    /// machine further.
    pub fn dump(&self) {
        println!();
        for p in &self.pool {
            let info = unsafe { p.info.get_mut_unchecked() };
            if info.state != Procstate::UNUSED {
                let data = unsafe { &*p.data.get() };
                let len = data
                    .name
                    .iter()
                    .position(|&c| c == 0)
                    .unwrap_or(data.name.len());
                println!(
                    "{} {} {}",
                    info.pid,
                    info.state.as_str(),
                    core::str::from_utf8(&data.name[..len]).unwrap_or("???")
                );
            }
        }
    }
}

#[cfg(test)]
impl Procs {
    /// Claim a slot and install it as the current process of this (host)
    /// CPU, so syscall paths that consult `myproc` can run under test.
    pub(crate) fn adopt_test_proc(&self) -> *mut Proc {
        let trap_frame = kernel().kmem.lock().alloc().expect("adopt_test_proc: tf");
        let memory = UserMemory::new(trap_frame.as_ptr() as usize, None)
            .expect("adopt_test_proc: memory");
        let guard = self.alloc(trap_frame, memory).expect("adopt_test_proc: slot");
        let p = guard.proc_ref() as *const Proc as *mut Proc;
        drop(guard);
        unsafe { (*kernel().current_cpu_raw()).proc = p };
        p
    }

    /// Tear a test process down the way exit+wait would.
    pub(crate) fn drop_test_proc(&self, p: *mut Proc) {
        unsafe { (*kernel().current_cpu_raw()).proc = ptr::null_mut() };
        let data = unsafe { &mut *(*p).data.get() };
        data.release_fs_refs();
        crate::shm::detach_all(data);
        data.memory = None;
        let wait_guard = self.wait_lock();
        let mut guard = unsafe { (*p).lock() };
        guard.clear(&wait_guard);
    }
}

/// Return this CPU's ID. Must be called with interrupts disabled, to
/// prevent a race with the process being moved to a different CPU.
pub fn cpuid() -> usize {
    TargetArch::cpu_id()
}

/// Return the current `Proc` pointer, or null if none.
///
/// # Safety
///
/// The pointer is only valid while the process cannot be reaped, which the
/// caller (being that process) guarantees.
pub unsafe fn myproc() -> *mut Proc {
    unsafe { crate::lock::push_off() };
    let c = kernel().current_cpu_raw();
    let p = unsafe { (*c).proc };
    unsafe { crate::lock::pop_off() };
    p
}

/// Pid of the current process, or 0 when called outside process context.
pub fn current_pid() -> i32 {
    let p = unsafe { myproc() };
    if p.is_null() {
        0
    } else {
        unsafe { (*p).pid() }
    }
}

/// A user program that calls exec("/init"); assembled from initcode.S.
/// od -t xC initcode
const INITCODE: [u8; 52] = [
    0x17, 0x05, 0, 0, 0x13, 0x05, 0x45, 0x02, 0x97, 0x05, 0, 0, 0x93, 0x85, 0x35, 0x02, 0x93, 0x08,
    0xd0, 0x0d, 0x73, 0, 0, 0, 0x93, 0x08, 0xd0, 0x05, 0x73, 0, 0, 0, 0xef, 0xf0, 0x9f, 0xff, 0x2f,
    0x69, 0x6e, 0x69, 0x74, 0, 0, 0x24, 0, 0, 0, 0, 0, 0, 0, 0,
];

/// Per-CPU process scheduler. Each CPU calls scheduler() after setting
/// itself up, and never returns. It loops, picking a process to run,
/// switching into it, and catching the thread of control when that process
/// gives the CPU up.
pub unsafe fn scheduler() -> ! {
    let c = kernel().current_cpu_raw();
    unsafe { (*c).proc = ptr::null_mut() };
    loop {
        // Avoid deadlock by ensuring that devices can interrupt.
        unsafe { TargetArch::intr_on() };

        if let Some(p) = kernel().procs.pick_runnable() {
            let mut guard = p.lock();
            if guard.deref_info().state == Procstate::RUNNABLE {
                // Switch to the chosen process. It is the process's job to
                // release its lock and then reacquire it before jumping back
                // to us: the departing side holds the lock across the switch
                // and the arriving side releases it.
                guard.deref_mut_info().state = Procstate::RUNNING;
                unsafe { (*c).proc = p as *const _ as *mut _ };
                unsafe { TargetArch::context_switch(&mut (*c).context, guard.context_raw()) };

                // Process is done running for now; it changed its state
                // before coming back.
                unsafe { (*c).proc = ptr::null_mut() };
            }
        }
    }
}

/// Give up the CPU for one scheduling round.
pub unsafe fn yield_cpu() {
    let p = unsafe { myproc() };
    let mut guard = unsafe { (*p).lock() };
    guard.deref_mut_info().state = Procstate::RUNNABLE;
    unsafe { guard.sched() };
}

/// A fork child's very first scheduling by scheduler() switches here.
unsafe fn forkret() {
    // Still holding p->lock from the scheduler.
    unsafe { (*myproc()).info.unlock() };

    // File-system initialization must run in the context of a regular
    // process (it may sleep), so it cannot happen in kernel_main().
    kernel().itable.init();

    unsafe { crate::trap::usertrapret() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support;

    fn with_state<R>(p: &Proc, state: Procstate, prio: i64, f: impl FnOnce() -> R) -> R {
        let mut guard = p.lock();
        let old_state = guard.deref_info().state;
        let old_prio = guard.deref_info().priority;
        guard.deref_mut_info().state = state;
        guard.deref_mut_info().priority = prio;
        drop(guard);
        let r = f();
        let mut guard = p.lock();
        guard.deref_mut_info().state = old_state;
        guard.deref_mut_info().priority = old_prio;
        r
    }

    #[test]
    fn pids_are_unique_and_positive() {
        let _t = test_support::setup();
        let a = kernel().procs.allocpid();
        let b = kernel().procs.allocpid();
        assert!(a > 0);
        assert!(b > a);
    }

    #[test]
    fn scheduler_prefers_higher_priority() {
        let _t = test_support::setup();
        let procs = &kernel().procs;
        let low = &procs.pool[1];
        let high = &procs.pool[2];
        with_state(low, Procstate::RUNNABLE, 2, || {
            with_state(high, Procstate::RUNNABLE, 10, || {
                let picked = procs.pick_runnable().unwrap();
                assert!(core::ptr::eq(picked, high));
            })
        });
    }

    #[test]
    fn equal_priorities_fall_back_to_table_order() {
        let _t = test_support::setup();
        let procs = &kernel().procs;
        let first = &procs.pool[3];
        let second = &procs.pool[4];
        with_state(first, Procstate::RUNNABLE, 7, || {
            with_state(second, Procstate::RUNNABLE, 7, || {
                let picked = procs.pick_runnable().unwrap();
                assert!(core::ptr::eq(picked, first));
            })
        });
    }

    #[test]
    fn sleeping_processes_are_not_picked() {
        let _t = test_support::setup();
        let procs = &kernel().procs;
        let p = &procs.pool[5];
        with_state(p, Procstate::SLEEPING, 50, || {
            assert!(procs
                .pick_runnable()
                .map(|c| !core::ptr::eq(c, p))
                .unwrap_or(true));
        });
    }

    #[test]
    fn fd_table_allocates_lowest_free_slot() {
        let _t = test_support::setup();
        let mut data = ProcData::new();
        let f0 = crate::file::FilePool::test_file();
        let f1 = crate::file::FilePool::test_file();
        let f2 = crate::file::FilePool::test_file();
        assert_eq!(data.fd_alloc(f0).unwrap(), 0);
        assert_eq!(data.fd_alloc(f1).unwrap(), 1);
        data.files[0] = None;
        assert_eq!(data.fd_alloc(f2).unwrap(), 0);
        data.release_fs_refs();
    }

    #[test]
    fn fd_table_is_bounded() {
        let _t = test_support::setup();
        let mut data = ProcData::new();
        for i in 0..FD_MAX {
            assert_eq!(
                data.fd_alloc(crate::file::FilePool::test_file()).unwrap(),
                i as i32
            );
        }
        assert!(data.fd_alloc(crate::file::FilePool::test_file()).is_err());
        data.release_fs_refs();
    }

    #[test]
    fn dup3_style_placement_replaces_occupant() {
        let _t = test_support::setup();
        let mut data = ProcData::new();
        let a = crate::file::FilePool::test_file();
        let b = crate::file::FilePool::test_file();
        assert_eq!(data.fd_alloc(a).unwrap(), 0);
        assert_eq!(data.fd_alloc_at(b, 7).unwrap(), 7);
        assert!(data.files[7].is_some());
        assert!(data.fd_get(7).is_some());
        assert!(data.fd_get(FD_MAX as i32).is_none());
        assert!(data.fd_get(-1).is_none());
        data.release_fs_refs();
    }
}
