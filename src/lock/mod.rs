//! Locks and lock guards.
//!
//! Three flavors, as in the classic design:
//! - `Spinlock<T>`: busy-waits with interrupts disabled on the owning CPU.
//!   The only lock that may be held across `sched` (and then only the
//!   process's own lock).
//! - `Sleepablelock<T>`: a spinlock whose guard can additionally block on a
//!   built-in wait channel (pipe buffers, the tick counter).
//! - `Sleeplock<T>`: a long-held lock whose contender sleeps instead of
//!   spinning; used for inodes, which are held across whole I/O operations.

mod sleepablelock;
mod sleeplock;
mod spinlock;

pub use sleepablelock::{Sleepablelock, SleepablelockGuard};
pub use sleeplock::{Sleeplock, SleeplockGuard};
pub use spinlock::{pop_off, push_off, RawSpinlock, Spinlock, SpinlockGuard};
