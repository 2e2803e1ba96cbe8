//! Support for file descriptors: the system-wide pool of open files and the
//! polymorphic file object (pipe end, inode, or character device).
//!
//! The pool lock guards only reference counts; it is never held across I/O.
//! An inode file's byte offset is guarded by the inode sleep-lock, and
//! type-specific teardown runs after the pool lock is dropped.

use core::cell::UnsafeCell;
use core::mem;
use core::ops::Deref;
use core::ptr::NonNull;

use crate::{
    fs::{InodeType, RcInode},
    kernel::kernel,
    lock::RawSpinlock,
    param::{BSIZE, MAXOPBLOCKS, NFILE},
    pipe::AllocatedPipe,
    vm::UserMemory,
};

/// Inode writes are split so no chunk exceeds the block budget of a single
/// backing-store transaction: i-node block, indirect block, allocation
/// blocks, and two blocks of slop for unaligned ends.
pub const MAXCHUNK: usize = (MAXOPBLOCKS - 4) / 2 * BSIZE;

pub const SEEK_SET: i32 = 0;
pub const SEEK_CUR: i32 = 1;
pub const SEEK_END: i32 = 2;

/// Device read/write handler: (user memory, user address, byte count).
pub type DevFn = fn(&mut UserMemory, usize, usize) -> Result<usize, ()>;

/// Map from major device number to device functions.
#[derive(Copy, Clone)]
pub struct Devsw {
    pub read: Option<DevFn>,
    pub write: Option<DevFn>,
}

impl Devsw {
    pub const NONE: Self = Self {
        read: None,
        write: None,
    };
}

pub enum FileType {
    None,
    Pipe {
        pipe: AllocatedPipe,
    },
    Inode {
        ip: RcInode,
        /// Byte offset; guarded by the inode sleep-lock, not the pool lock.
        off: UnsafeCell<usize>,
    },
    Device {
        ip: RcInode,
        major: u16,
    },
}

/// An open file. A slot is free iff its reference count is zero.
pub struct File {
    /// Guarded by the pool lock.
    refcnt: UnsafeCell<u32>,

    /// Written only while the slot is unshared (alloc and final close).
    typ: UnsafeCell<FileType>,
    readable: UnsafeCell<bool>,
    writable: UnsafeCell<bool>,
}

// Slots are shared between processes; all mutation is fenced by the pool
// lock or the unshared-slot protocol above.
unsafe impl Sync for File {}
unsafe impl Send for File {}

impl File {
    const fn zero() -> Self {
        Self {
            refcnt: UnsafeCell::new(0),
            typ: UnsafeCell::new(FileType::None),
            readable: UnsafeCell::new(false),
            writable: UnsafeCell::new(false),
        }
    }

    pub fn typ(&self) -> &FileType {
        unsafe { &*self.typ.get() }
    }

    pub fn readable(&self) -> bool {
        unsafe { *self.readable.get() }
    }

    pub fn writable(&self) -> bool {
        unsafe { *self.writable.get() }
    }

    /// Read from the file into user memory at `addr`.
    pub fn read(&self, mem: &mut UserMemory, addr: usize, n: usize) -> Result<usize, ()> {
        if !self.readable() {
            return Err(());
        }

        match self.typ() {
            FileType::Pipe { pipe } => pipe.read(mem, addr, n),
            FileType::Device { major, .. } => {
                let dev = kernel()
                    .devsw
                    .lock()
                    .get(*major as usize)
                    .copied()
                    .ok_or(())?;
                (dev.read.ok_or(())?)(mem, addr, n)
            }
            FileType::Inode { ip, off } => {
                let data = ip.data.lock();
                let mut buf = [0u8; BSIZE];
                let mut done = 0;
                while done < n {
                    let want = (n - done).min(BSIZE);
                    // The offset cell is ours while the inode lock is held.
                    let cur = unsafe { *off.get() };
                    let got = data.read_at(&mut buf[..want], cur);
                    if got == 0 {
                        break;
                    }
                    mem.copy_out(addr + done, &buf[..got])?;
                    unsafe { *off.get() = cur + got };
                    done += got;
                    if got < want {
                        break;
                    }
                }
                Ok(done)
            }
            FileType::None => panic!("File::read"),
        }
    }

    /// Write to the file from user memory at `addr`.
    pub fn write(&self, mem: &mut UserMemory, addr: usize, n: usize) -> Result<usize, ()> {
        if !self.writable() {
            return Err(());
        }

        match self.typ() {
            FileType::Pipe { pipe } => pipe.write(mem, addr, n),
            FileType::Device { major, .. } => {
                let dev = kernel()
                    .devsw
                    .lock()
                    .get(*major as usize)
                    .copied()
                    .ok_or(())?;
                (dev.write.ok_or(())?)(mem, addr, n)
            }
            FileType::Inode { ip, off } => {
                let mut buf = [0u8; MAXCHUNK];
                let mut done = 0;
                while done < n {
                    // One chunk per backing-store transaction.
                    let want = (n - done).min(MAXCHUNK);
                    mem.copy_in(&mut buf[..want], addr + done)?;
                    let mut data = ip.data.lock();
                    let cur = unsafe { *off.get() };
                    let wrote = data.write_at(&buf[..want], cur)?;
                    unsafe { *off.get() = cur + wrote };
                    done += wrote;
                }
                Ok(done)
            }
            FileType::None => panic!("File::write"),
        }
    }

    /// Metadata for fstat. Only meaningful for inode-backed files.
    pub fn stat(&self) -> Result<crate::stat::Stat, ()> {
        match self.typ() {
            FileType::Inode { ip, .. } | FileType::Device { ip, .. } => Ok(ip.stat()),
            _ => Err(()),
        }
    }

    /// Reposition the offset of a regular file. The new offset is stored
    /// verbatim: reads past the end return 0, writes extend.
    pub fn lseek(&self, offset: i64, whence: i32) -> Result<usize, ()> {
        match self.typ() {
            FileType::Inode { ip, off } => {
                if ip.typ() != InodeType::File {
                    return Err(());
                }
                let data = ip.data.lock();
                let base = match whence {
                    SEEK_SET => 0,
                    SEEK_CUR => (unsafe { *off.get() }) as i64,
                    SEEK_END => data.size() as i64,
                    _ => return Err(()),
                };
                let new = base.checked_add(offset).ok_or(())?;
                if new < 0 {
                    return Err(());
                }
                unsafe { *off.get() = new as usize };
                Ok(new as usize)
            }
            _ => Err(()),
        }
    }
}

/// The system-wide open-file pool: a fixed-size array behind a single lock.
pub struct FilePool {
    lock: RawSpinlock,
    files: [File; NFILE],
}

impl FilePool {
    pub const fn zero() -> Self {
        const SLOT: File = File::zero();
        Self {
            lock: RawSpinlock::new("ftable"),
            files: [SLOT; NFILE],
        }
    }

    /// Claim the first slot with no references.
    pub fn alloc(&self, typ: FileType, readable: bool, writable: bool) -> Option<RcFile> {
        self.lock.acquire();
        for file in &self.files {
            let refcnt = unsafe { &mut *file.refcnt.get() };
            if *refcnt == 0 {
                *refcnt = 1;
                // The slot is unshared until this RcFile escapes.
                unsafe {
                    *file.typ.get() = typ;
                    *file.readable.get() = readable;
                    *file.writable.get() = writable;
                }
                self.lock.release();
                return Some(RcFile {
                    ptr: NonNull::from(file),
                });
            }
        }
        self.lock.release();
        None
    }

    fn dup(&self, file: &File) {
        self.lock.acquire();
        let refcnt = unsafe { &mut *file.refcnt.get() };
        assert!(*refcnt >= 1, "File::dup");
        *refcnt += 1;
        self.lock.release();
    }

    fn close(&self, file: &File) {
        self.lock.acquire();
        let refcnt = unsafe { &mut *file.refcnt.get() };
        assert!(*refcnt >= 1, "File::close");
        *refcnt -= 1;
        if *refcnt > 0 {
            self.lock.release();
            return;
        }

        // Last reference: empty the slot, then tear the object down with
        // the pool lock released (pipe close sleeps through wakeups, inode
        // release may touch the backing store).
        let typ = unsafe { mem::replace(&mut *file.typ.get(), FileType::None) };
        let writable = file.writable();
        self.lock.release();

        match typ {
            FileType::Pipe { pipe } => pipe.close(writable),
            FileType::Inode { ip, .. } | FileType::Device { ip, .. } => drop(ip),
            FileType::None => {}
        }
    }

    #[cfg(test)]
    pub(crate) fn test_file() -> RcFile {
        kernel()
            .ftable
            .alloc(FileType::None, false, false)
            .expect("test_file: pool full")
    }
}

/// A counted reference to an open file; clone duplicates, drop closes.
#[derive(Debug)]
pub struct RcFile {
    ptr: NonNull<File>,
}

unsafe impl Send for RcFile {}

impl Deref for RcFile {
    type Target = File;

    fn deref(&self) -> &File {
        unsafe { self.ptr.as_ref() }
    }
}

impl Clone for RcFile {
    fn clone(&self) -> Self {
        kernel().ftable.dup(self.deref());
        Self { ptr: self.ptr }
    }
}

impl Drop for RcFile {
    fn drop(&mut self) {
        kernel().ftable.close(unsafe { self.ptr.as_ref() });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::{InodeType, PathBuf};
    use crate::test_support;
    use crate::vm::PGSIZE;

    fn user_buffer() -> (UserMemory, NonNull<crate::page::Page>, usize) {
        let tf = kernel().kmem.lock().alloc().unwrap();
        let mut mem = UserMemory::new(tf.as_ptr() as usize, None).unwrap();
        mem.map_anonymous(
            0x1000_0000,
            1,
            crate::vm::PteFlags::R | crate::vm::PteFlags::W,
        )
        .unwrap();
        (mem, tf, 0x1000_0000)
    }

    fn open_regular(path: &[u8]) -> RcFile {
        let ip = kernel()
            .itable
            .create(&PathBuf::from_absolute(path).unwrap(), InodeType::File)
            .unwrap();
        kernel()
            .ftable
            .alloc(
                FileType::Inode {
                    ip,
                    off: UnsafeCell::new(0),
                },
                true,
                true,
            )
            .unwrap()
    }

    #[test]
    fn pool_is_exhaustible_and_slots_recycle() {
        let _t = test_support::setup();
        let mut held = std::vec::Vec::new();
        loop {
            match kernel().ftable.alloc(FileType::None, true, false) {
                Some(f) => held.push(f),
                None => break,
            }
        }
        assert_eq!(held.len(), NFILE);

        // Closing the last reference frees exactly one slot.
        held.pop();
        assert!(kernel().ftable.alloc(FileType::None, true, false).is_some());
    }

    #[test]
    fn dup_keeps_the_slot_until_the_last_close() {
        let _t = test_support::setup();
        let f = FilePool::test_file();
        let ptr = f.ptr;
        let dup = f.clone();
        assert_eq!(unsafe { *f.refcnt.get() }, 2);
        drop(f);
        assert_eq!(unsafe { *ptr.as_ref().refcnt.get() }, 1);
        drop(dup);
        assert_eq!(unsafe { *ptr.as_ref().refcnt.get() }, 0);
        assert!(matches!(
            unsafe { &*ptr.as_ref().typ.get() },
            FileType::None
        ));
    }

    #[test]
    fn read_respects_the_open_direction() {
        let _t = test_support::setup();
        let (mut mem, tf, addr) = user_buffer();
        let ip = kernel()
            .itable
            .create(
                &PathBuf::from_absolute(b"/wronly").unwrap(),
                InodeType::File,
            )
            .unwrap();
        let f = kernel()
            .ftable
            .alloc(
                FileType::Inode {
                    ip,
                    off: UnsafeCell::new(0),
                },
                false,
                true,
            )
            .unwrap();
        assert!(f.read(&mut mem, addr, 4).is_err());
        assert!(f.write(&mut mem, addr, 4).is_ok());
        drop(f);
        drop(mem);
        kernel().kmem.lock().free(tf);
    }

    #[test]
    fn inode_io_advances_a_shared_offset() {
        let _t = test_support::setup();
        let (mut mem, tf, addr) = user_buffer();
        let f = open_regular(b"/shared-offset");

        mem.copy_out(addr, b"abcdef").unwrap();
        assert_eq!(f.write(&mut mem, addr, 6).unwrap(), 6);
        assert_eq!(f.lseek(0, SEEK_SET).unwrap(), 0);

        // A dup reads through the same offset.
        let dup = f.clone();
        assert_eq!(f.read(&mut mem, addr + 100, 3).unwrap(), 3);
        assert_eq!(dup.read(&mut mem, addr + 200, 3).unwrap(), 3);
        let mut first = [0u8; 3];
        let mut second = [0u8; 3];
        mem.copy_in(&mut first, addr + 100).unwrap();
        mem.copy_in(&mut second, addr + 200).unwrap();
        assert_eq!(&first, b"abc");
        assert_eq!(&second, b"def");

        // Offset is at the end; further reads see EOF.
        assert_eq!(dup.read(&mut mem, addr, 3).unwrap(), 0);

        drop(f);
        drop(dup);
        drop(mem);
        kernel().kmem.lock().free(tf);
    }

    #[test]
    fn lseek_applies_only_to_regular_files() {
        let _t = test_support::setup();
        let f = open_regular(b"/seekable");
        assert_eq!(f.lseek(10, SEEK_SET).unwrap(), 10);
        assert_eq!(f.lseek(5, SEEK_CUR).unwrap(), 15);
        assert_eq!(f.lseek(0, SEEK_END).unwrap(), 0);
        assert!(f.lseek(0, 99).is_err());
        assert!(f.lseek(-1, SEEK_SET).is_err());

        let plain = FilePool::test_file();
        assert!(plain.lseek(0, SEEK_SET).is_err());
    }

    #[test]
    fn large_writes_are_chunked_but_complete() {
        let _t = test_support::setup();
        let tf = kernel().kmem.lock().alloc().unwrap();
        let mut mem = UserMemory::new(tf.as_ptr() as usize, None).unwrap();
        mem.map_anonymous(
            0x1000_0000,
            2,
            crate::vm::PteFlags::R | crate::vm::PteFlags::W,
        )
        .unwrap();
        let f = open_regular(b"/chunky");

        let total = MAXCHUNK + MAXCHUNK / 2;
        assert!(total < 2 * PGSIZE);
        let pattern: std::vec::Vec<u8> = (0..total).map(|i| (i % 251) as u8).collect();
        mem.copy_out(0x1000_0000, &pattern).unwrap();
        assert_eq!(f.write(&mut mem, 0x1000_0000, total).unwrap(), total);

        f.lseek(0, SEEK_SET).unwrap();
        assert_eq!(f.read(&mut mem, 0x1000_0000, total).unwrap(), total);
        let mut back = std::vec![0u8; total];
        mem.copy_in(&mut back, 0x1000_0000).unwrap();
        assert_eq!(back, pattern);

        drop(f);
        drop(mem);
        kernel().kmem.lock().free(tf);
    }
}
