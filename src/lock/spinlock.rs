//! Spin locks
use core::cell::UnsafeCell;
use core::hint::spin_loop;
use core::marker::PhantomData;
use core::ops::{Deref, DerefMut};
use core::ptr;
use core::sync::atomic::{fence, AtomicPtr, Ordering};

use crate::{
    arch::{Arch, TargetArch},
    kernel::kernel,
    proc::{Cpu, Waitable},
};

/// Mutual exclusion lock that busy waits (spins).
pub struct RawSpinlock {
    /// Name of lock.
    name: &'static str,

    /// If the lock is held, contains the pointer of the owning `Cpu`.
    /// Otherwise, contains null.
    locked: AtomicPtr<Cpu>,
}

impl RawSpinlock {
    pub const fn new(name: &'static str) -> Self {
        Self {
            locked: AtomicPtr::new(ptr::null_mut()),
            name,
        }
    }

    /// Acquires the lock. Loops (spins) until the lock is acquired.
    ///
    /// Interrupts are disabled first (and stay disabled, via the `noff`
    /// nesting count) so that an interrupt handler on this CPU cannot try to
    /// re-acquire the lock while we hold it.
    pub fn acquire(&self) {
        unsafe { push_off() };
        assert!(!self.holding(), "acquire {}", self.name);

        while self
            .locked
            .compare_exchange(
                ptr::null_mut(),
                kernel().current_cpu_raw(),
                Ordering::Acquire,
                // Okay to use `Relaxed` ordering since we don't enter the
                // critical section anyway if the exchange fails.
                Ordering::Relaxed,
            )
            .is_err()
        {
            spin_loop();
        }

        // The critical section's memory references must happen strictly
        // after the lock is acquired.
        fence(Ordering::SeqCst);
    }

    /// Releases the lock.
    pub fn release(&self) {
        assert!(self.holding(), "release {}", self.name);

        // All the stores in the critical section must be visible to other
        // CPUs before the lock is released.
        fence(Ordering::SeqCst);
        self.locked.store(ptr::null_mut(), Ordering::Release);
        unsafe { pop_off() };
    }

    /// Check whether this cpu is holding the lock.
    /// Interrupts must be off.
    pub fn holding(&self) -> bool {
        self.locked.load(Ordering::Relaxed) == kernel().current_cpu_raw()
    }
}

/// push_off/pop_off are like intr_off()/intr_on() except that they are
/// matched: it takes two pop_off()s to undo two push_off()s. Also, if
/// interrupts are initially off, then push_off, pop_off leaves them off.
///
/// # Safety
///
/// The caller must be pinned to the current CPU, which holding any spinlock
/// guarantees (interrupts stay off until the matching `pop_off`).
pub unsafe fn push_off() {
    let old = TargetArch::intr_get();
    TargetArch::intr_off();

    let cpu = kernel().current_cpu_raw();
    if unsafe { (*cpu).noff } == 0 {
        unsafe { (*cpu).interrupt_enabled = old };
    }
    unsafe { (*cpu).noff += 1 };
}

/// pop_off() should be paired with push_off().
/// See push_off() for more details.
///
/// # Safety
///
/// Must be paired with an earlier `push_off` on the same CPU.
pub unsafe fn pop_off() {
    let cpu = kernel().current_cpu_raw();
    assert!(!TargetArch::intr_get(), "pop_off - interruptible");
    assert!(unsafe { (*cpu).noff } >= 1, "pop_off");

    unsafe { (*cpu).noff -= 1 };

    if unsafe { (*cpu).noff } == 0 && unsafe { (*cpu).interrupt_enabled } {
        unsafe { TargetArch::intr_on() };
    }
}

/// A spinlock that owns its data.
pub struct Spinlock<T> {
    lock: RawSpinlock,
    data: UnsafeCell<T>,
}

unsafe impl<T: Send> Sync for Spinlock<T> {}

impl<T> Spinlock<T> {
    pub const fn new(name: &'static str, data: T) -> Self {
        Self {
            lock: RawSpinlock::new(name),
            data: UnsafeCell::new(data),
        }
    }

    pub fn lock(&self) -> SpinlockGuard<'_, T> {
        self.lock.acquire();
        SpinlockGuard {
            lock: self,
            _marker: PhantomData,
        }
    }

    pub fn holding(&self) -> bool {
        self.lock.holding()
    }

    /// Returns a mutable pointer to the inner data without locking.
    /// The caller must ensure that accessing the pointer does not incur a
    /// race.
    pub fn get_mut_raw(&self) -> *mut T {
        self.data.get()
    }

    /// Returns a mutable reference to the inner data without locking.
    ///
    /// # Safety
    ///
    /// The caller must be the only one accessing the data, e.g. because the
    /// lock is known to be held, or because no other CPU can reach it.
    pub unsafe fn get_mut_unchecked(&self) -> &mut T {
        unsafe { &mut *self.data.get() }
    }

    pub fn get_mut(&mut self) -> &mut T {
        unsafe { &mut *self.data.get() }
    }

    /// Unlock the lock.
    ///
    /// # Safety
    ///
    /// Use this only when we acquired the lock but did `mem::forget()` to
    /// the guard.
    pub unsafe fn unlock(&self) {
        self.lock.release();
    }
}

pub struct SpinlockGuard<'s, T> {
    lock: &'s Spinlock<T>,
    // Do not implement Send; the lock must be released by the CPU that
    // acquired it.
    _marker: PhantomData<*const ()>,
}

unsafe impl<'s, T: Sync> Sync for SpinlockGuard<'s, T> {}

impl<T> Waitable for SpinlockGuard<'_, T> {
    unsafe fn raw_release(&mut self) {
        self.lock.lock.release();
    }

    unsafe fn raw_acquire(&mut self) {
        self.lock.lock.acquire();
    }
}

impl<T> Drop for SpinlockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.lock.release();
    }
}

impl<T> Deref for SpinlockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for SpinlockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        unsafe { &mut *self.lock.data.get() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support;

    #[test]
    fn guard_gives_exclusive_access() {
        let _t = test_support::setup();
        let lock = Spinlock::new("test", 0usize);
        {
            let mut guard = lock.lock();
            *guard += 1;
            assert!(lock.holding());
        }
        assert!(!lock.holding());
        assert_eq!(*lock.lock(), 1);
    }

    #[test]
    fn push_off_nests() {
        let _t = test_support::setup();
        let cpu = kernel().current_cpu_raw();
        let base = unsafe { (*cpu).noff };
        unsafe { push_off() };
        unsafe { push_off() };
        assert_eq!(unsafe { (*cpu).noff }, base + 2);
        assert!(!TargetArch::intr_get());
        unsafe { pop_off() };
        assert!(!TargetArch::intr_get());
        unsafe { pop_off() };
        assert_eq!(unsafe { (*cpu).noff }, base);
    }

    #[test]
    fn interrupts_stay_off_while_locked() {
        let _t = test_support::setup();
        let lock = Spinlock::new("test-intr", ());
        let outer = lock.lock();
        // While noff > 0, interrupts must be disabled on this CPU.
        assert!(!TargetArch::intr_get());
        let inner = Spinlock::new("test-intr-2", ());
        let g2 = inner.lock();
        assert!(!TargetArch::intr_get());
        drop(g2);
        assert!(!TargetArch::intr_get());
        drop(outer);
    }
}
