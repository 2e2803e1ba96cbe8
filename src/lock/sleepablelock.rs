//! Sleepable locks
use core::cell::UnsafeCell;
use core::marker::PhantomData;
use core::ops::{Deref, DerefMut};

use super::RawSpinlock;
use crate::proc::{WaitChannel, Waitable};

/// A spinlock with a built-in wait channel, for data that threads block on
/// (pipe buffers, the tick counter).
pub struct Sleepablelock<T> {
    lock: RawSpinlock,
    /// WaitChannel connecting threads that block on this data.
    waitchannel: WaitChannel,
    data: UnsafeCell<T>,
}

unsafe impl<T: Send> Sync for Sleepablelock<T> {}

impl<T> Sleepablelock<T> {
    pub const fn new(name: &'static str, data: T) -> Self {
        Self {
            lock: RawSpinlock::new(name),
            waitchannel: WaitChannel::new(),
            data: UnsafeCell::new(data),
        }
    }

    pub fn lock(&self) -> SleepablelockGuard<'_, T> {
        self.lock.acquire();
        SleepablelockGuard {
            lock: self,
            _marker: PhantomData,
        }
    }

    pub fn get_mut(&mut self) -> &mut T {
        unsafe { &mut *self.data.get() }
    }
}

pub struct SleepablelockGuard<'s, T> {
    lock: &'s Sleepablelock<T>,
    _marker: PhantomData<*const ()>,
}

unsafe impl<'s, T: Sync> Sync for SleepablelockGuard<'s, T> {}

impl<T> SleepablelockGuard<'_, T> {
    /// Atomically release the lock and sleep until the channel is signaled;
    /// the lock is held again on return. Spurious wakeups are possible, so
    /// callers re-check their condition.
    pub fn sleep(&mut self) {
        let lock = self.lock;
        lock.waitchannel.sleep(self);
    }

    /// Wake everyone sleeping on this lock's channel.
    pub fn wakeup(&self) {
        self.lock.waitchannel.wakeup();
    }
}

impl<T> Waitable for SleepablelockGuard<'_, T> {
    unsafe fn raw_release(&mut self) {
        self.lock.lock.release();
    }

    unsafe fn raw_acquire(&mut self) {
        self.lock.lock.acquire();
    }
}

impl<T> Drop for SleepablelockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.lock.release();
    }
}

impl<T> Deref for SleepablelockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for SleepablelockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        unsafe { &mut *self.lock.data.get() }
    }
}
