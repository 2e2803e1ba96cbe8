//! Shared scaffolding for the host-side unit tests.
//!
//! The kernel singleton is global state, so tests that touch it run
//! serialized behind one mutex; the page pool and the file-system root are
//! brought up once, on first use. `ProcContext` additionally installs a
//! throwaway current process so syscall-layer paths can run.

use std::sync::{Mutex, MutexGuard};

use crate::{
    arch::{Arch, TargetArch},
    kernel::kernel,
    proc::Proc,
    vm::{PteFlags, UserMemory},
};

static TEST_LOCK: Mutex<()> = Mutex::new(());
static INIT: spin::Once<()> = spin::Once::new();

/// Serialize the calling test and make sure the kernel is initialized.
pub fn setup() -> MutexGuard<'static, ()> {
    let guard = TEST_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    INIT.call_once(|| {
        let (begin, end) = unsafe { TargetArch::page_pool_bounds() };
        unsafe { kernel().kmem.lock().init(begin, end) };
        kernel().itable.init();
    });
    guard
}

/// Scratch region mapped into every test process.
pub const UBUF: usize = 0x100_0000;

/// A current process for the duration of a test. Must be created while the
/// `setup()` guard is held.
pub struct ProcContext {
    p: *mut Proc,
}

pub fn enter_proc() -> ProcContext {
    let p = kernel().procs.adopt_test_proc();
    let ctx = ProcContext { p };
    ctx.mem()
        .map_anonymous(UBUF, 4, PteFlags::R | PteFlags::W)
        .expect("test scratch mapping");
    ctx
}

impl ProcContext {
    pub fn proc(&self) -> *mut Proc {
        self.p
    }

    pub fn mem(&self) -> &mut UserMemory {
        unsafe { (*(*self.p).data.get()).memory.as_mut().expect("test memory") }
    }

    /// Fill the syscall argument registers; unset ones read as zero.
    pub fn set_args(&self, args: &[usize]) {
        let data = unsafe { &mut *(*self.p).data.get() };
        let tf = data.trap_frame_mut();
        let mut it = args.iter().copied();
        tf.a0 = it.next().unwrap_or(0);
        tf.a1 = it.next().unwrap_or(0);
        tf.a2 = it.next().unwrap_or(0);
        tf.a3 = it.next().unwrap_or(0);
        tf.a4 = it.next().unwrap_or(0);
        tf.a5 = it.next().unwrap_or(0);
        tf.a6 = it.next().unwrap_or(0);
    }

    /// Copy a NUL-terminated string into user scratch space at `at`,
    /// returning its user address.
    pub fn put_str(&self, at: usize, s: &[u8]) -> usize {
        self.mem().copy_out(at, s).unwrap();
        self.mem().copy_out(at + s.len(), &[0u8]).unwrap();
        at
    }

    pub fn read_user(&self, addr: usize, n: usize) -> std::vec::Vec<u8> {
        let mut out = std::vec![0u8; n];
        self.mem().copy_in(&mut out, addr).unwrap();
        out
    }
}

impl Drop for ProcContext {
    fn drop(&mut self) {
        kernel().procs.drop_test_proc(self.p);
    }
}
