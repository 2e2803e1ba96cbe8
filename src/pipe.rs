//! Pipes: a bounded byte ring with a reader end and a writer end. Every
//! state change wakes the opposite side; closing one end wakes the other
//! unconditionally.

use core::ops::Deref;
use core::ptr::NonNull;

use crate::{
    file::{FileType, RcFile},
    kernel::kernel,
    lock::Spinlock,
    page::Page,
    proc::{myproc, WaitChannel},
    vm::UserMemory,
};

pub const PIPESIZE: usize = 512;

struct PipeInner {
    data: [u8; PIPESIZE],

    /// Number of bytes read.
    nread: u32,

    /// Number of bytes written.
    nwrite: u32,

    /// Read fd is still open.
    readopen: bool,

    /// Write fd is still open.
    writeopen: bool,
}

impl PipeInner {
    fn available(&self) -> usize {
        self.nwrite.wrapping_sub(self.nread) as usize
    }

    fn space(&self) -> usize {
        PIPESIZE - self.available()
    }

    /// Copy up to `dst.len()` buffered bytes out without consuming them.
    fn peek_bytes(&self, dst: &mut [u8]) -> usize {
        let n = dst.len().min(self.available());
        for (i, b) in dst[..n].iter_mut().enumerate() {
            *b = self.data[(self.nread.wrapping_add(i as u32)) as usize % PIPESIZE];
        }
        n
    }

    fn consume(&mut self, n: usize) {
        debug_assert!(n <= self.available());
        self.nread = self.nread.wrapping_add(n as u32);
    }

    /// Append bytes; the caller has checked the space.
    fn push_bytes(&mut self, src: &[u8]) {
        debug_assert!(src.len() <= self.space());
        for &b in src {
            self.data[self.nwrite as usize % PIPESIZE] = b;
            self.nwrite = self.nwrite.wrapping_add(1);
        }
    }
}

pub struct Pipe {
    inner: Spinlock<PipeInner>,

    /// WaitChannel for saying there are unread bytes in the buffer.
    read_waitchannel: WaitChannel,

    /// WaitChannel for saying there is room to write.
    write_waitchannel: WaitChannel,
}

fn current_killed() -> bool {
    let p = unsafe { myproc() };
    !p.is_null() && unsafe { (*p).killed() }
}

impl Pipe {
    /// Read up to `n` bytes into user memory. Blocks while the buffer is
    /// empty and the write end is open; returns 0 once the writer is gone
    /// and the buffer is drained.
    pub fn read(&self, mem: &mut UserMemory, addr: usize, n: usize) -> Result<usize, ()> {
        let mut inner = self.inner.lock();
        loop {
            if inner.available() == 0 {
                if !inner.writeopen {
                    return Ok(0);
                }
                if current_killed() {
                    return Err(());
                }
                self.read_waitchannel.sleep(&mut inner);
                continue;
            }

            let mut buf = [0u8; PIPESIZE];
            let want = n.min(PIPESIZE);
            let got = inner.peek_bytes(&mut buf[..want]);
            // Consume only what reached the user intact.
            mem.copy_out(addr, &buf[..got])?;
            inner.consume(got);
            self.write_waitchannel.wakeup();
            return Ok(got);
        }
    }

    /// Write `n` bytes from user memory. Blocks while the buffer is full
    /// and the read end is open; returns the short count if the reader
    /// disappears mid-write.
    pub fn write(&self, mem: &mut UserMemory, addr: usize, n: usize) -> Result<usize, ()> {
        let mut written = 0;
        let mut inner = self.inner.lock();
        loop {
            if !inner.readopen {
                return if written > 0 { Ok(written) } else { Err(()) };
            }
            if current_killed() {
                return Err(());
            }
            if written >= n {
                self.read_waitchannel.wakeup();
                return Ok(written);
            }
            if inner.space() == 0 {
                self.read_waitchannel.wakeup();
                self.write_waitchannel.sleep(&mut inner);
                continue;
            }

            let chunk = (n - written).min(inner.space()).min(PIPESIZE);
            let mut buf = [0u8; PIPESIZE];
            mem.copy_in(&mut buf[..chunk], addr + written)?;
            inner.push_bytes(&buf[..chunk]);
            written += chunk;
            self.read_waitchannel.wakeup();
        }
    }

    /// Drop one end. Returns true when both ends are now closed and the
    /// pipe should be freed.
    fn close(&self, writable: bool) -> bool {
        let mut inner = self.inner.lock();
        if writable {
            inner.writeopen = false;
            self.read_waitchannel.wakeup();
        } else {
            inner.readopen = false;
            self.write_waitchannel.wakeup();
        }
        !inner.readopen && !inner.writeopen
    }
}

/// An owning handle to a pipe living in an allocator page. Each pipe has
/// exactly one read-only and one write-only handle; the page is returned to
/// the allocator when the second one closes.
pub struct AllocatedPipe {
    ptr: NonNull<Pipe>,
}

// Access to the inner state goes through the pipe's own lock.
unsafe impl Send for AllocatedPipe {}

impl Deref for AllocatedPipe {
    type Target = Pipe;

    fn deref(&self) -> &Pipe {
        unsafe { self.ptr.as_ref() }
    }
}

impl AllocatedPipe {
    /// Make a pipe and return its (read end, write end) files.
    pub fn alloc() -> Result<(RcFile, RcFile), ()> {
        let page = kernel().kmem.lock().alloc().ok_or(())?;
        let page = scopeguard::guard(page, |p| kernel().kmem.lock().free(p));

        let ptr = page.as_ptr() as *mut Pipe;
        static_assertions::const_assert!(
            core::mem::size_of::<Pipe>() <= core::mem::size_of::<Page>()
        );
        unsafe {
            ptr.write(Pipe {
                inner: Spinlock::new(
                    "pipe",
                    PipeInner {
                        data: [0; PIPESIZE],
                        nread: 0,
                        nwrite: 0,
                        readopen: true,
                        writeopen: true,
                    },
                ),
                read_waitchannel: WaitChannel::new(),
                write_waitchannel: WaitChannel::new(),
            });
        }
        let ptr = unsafe { NonNull::new_unchecked(ptr) };

        let f0 = kernel()
            .ftable
            .alloc(FileType::Pipe { pipe: Self { ptr } }, true, false)
            .ok_or(())?;
        let f0 = scopeguard::guard(f0, |f| drop(f));
        let f1 = kernel()
            .ftable
            .alloc(FileType::Pipe { pipe: Self { ptr } }, false, true)
            .ok_or(())?;

        // Both files exist; the page now belongs to the pipe.
        let _ = scopeguard::ScopeGuard::into_inner(page);
        Ok((scopeguard::ScopeGuard::into_inner(f0), f1))
    }

    /// Close this end; frees the backing page once both ends are gone.
    pub fn close(self, writable: bool) {
        if self.deref().close(writable) {
            let page = self.ptr.as_ptr() as *mut Page;
            kernel()
                .kmem
                .lock()
                .free(unsafe { NonNull::new_unchecked(page) });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support;
    use crate::vm::PteFlags;

    const BUF: usize = 0x2000_0000;

    fn user_mem() -> (UserMemory, NonNull<Page>) {
        let tf = kernel().kmem.lock().alloc().unwrap();
        let mut mem = UserMemory::new(tf.as_ptr() as usize, None).unwrap();
        mem.map_anonymous(BUF, 1, PteFlags::R | PteFlags::W).unwrap();
        (mem, tf)
    }

    fn pipe_of(f: &RcFile) -> &Pipe {
        match f.typ() {
            FileType::Pipe { pipe } => pipe.deref(),
            _ => panic!("not a pipe"),
        }
    }

    #[test]
    fn bytes_flow_in_fifo_order() {
        let _t = test_support::setup();
        let (mut mem, tf) = user_mem();
        let (r, w) = AllocatedPipe::alloc().unwrap();

        mem.copy_out(BUF, b"ping").unwrap();
        assert_eq!(pipe_of(&w).write(&mut mem, BUF, 4).unwrap(), 4);
        assert_eq!(pipe_of(&r).read(&mut mem, BUF + 64, 4).unwrap(), 4);
        let mut got = [0u8; 4];
        mem.copy_in(&mut got, BUF + 64).unwrap();
        assert_eq!(&got, b"ping");

        drop(r);
        drop(w);
        drop(mem);
        kernel().kmem.lock().free(tf);
    }

    #[test]
    fn ring_wraps_around() {
        let _t = test_support::setup();
        let (mut mem, tf) = user_mem();
        let (r, w) = AllocatedPipe::alloc().unwrap();

        let first: std::vec::Vec<u8> = (0..PIPESIZE).map(|i| i as u8).collect();
        mem.copy_out(BUF, &first).unwrap();
        assert_eq!(pipe_of(&w).write(&mut mem, BUF, PIPESIZE).unwrap(), PIPESIZE);

        // Drain half, then refill past the wrap point.
        assert_eq!(
            pipe_of(&r).read(&mut mem, BUF + 512, PIPESIZE / 2).unwrap(),
            PIPESIZE / 2
        );
        mem.copy_out(BUF, b"wrapped").unwrap();
        assert_eq!(pipe_of(&w).write(&mut mem, BUF, 7).unwrap(), 7);

        let mut sink = [0u8; PIPESIZE];
        let n = pipe_of(&r).read(&mut mem, BUF + 512, PIPESIZE).unwrap();
        assert_eq!(n, PIPESIZE / 2 + 7);
        mem.copy_in(&mut sink[..n], BUF + 512).unwrap();
        assert_eq!(&sink[n - 7..n], b"wrapped");

        drop(r);
        drop(w);
        drop(mem);
        kernel().kmem.lock().free(tf);
    }

    #[test]
    fn read_returns_zero_after_writer_closes() {
        let _t = test_support::setup();
        let (mut mem, tf) = user_mem();
        let (r, w) = AllocatedPipe::alloc().unwrap();

        mem.copy_out(BUF, b"last").unwrap();
        pipe_of(&w).write(&mut mem, BUF, 4).unwrap();
        drop(w);

        // Buffered data is still delivered, then EOF.
        assert_eq!(pipe_of(&r).read(&mut mem, BUF + 64, 16).unwrap(), 4);
        assert_eq!(pipe_of(&r).read(&mut mem, BUF + 64, 16).unwrap(), 0);

        drop(r);
        drop(mem);
        kernel().kmem.lock().free(tf);
    }

    #[test]
    fn write_fails_once_reader_is_gone() {
        let _t = test_support::setup();
        let (mut mem, tf) = user_mem();
        let (r, w) = AllocatedPipe::alloc().unwrap();
        drop(r);

        mem.copy_out(BUF, b"nobody").unwrap();
        assert!(pipe_of(&w).write(&mut mem, BUF, 6).is_err());

        drop(w);
        drop(mem);
        kernel().kmem.lock().free(tf);
    }

    #[test]
    fn closing_both_ends_frees_the_page() {
        let _t = test_support::setup();
        let before = kernel().kmem.lock().free_pages();
        let (r, w) = AllocatedPipe::alloc().unwrap();
        assert_eq!(kernel().kmem.lock().free_pages(), before - 1);
        drop(w);
        assert_eq!(kernel().kmem.lock().free_pages(), before - 1);
        drop(r);
        assert_eq!(kernel().kmem.lock().free_pages(), before);
    }

    #[test]
    fn faulting_read_consumes_nothing() {
        let _t = test_support::setup();
        let (mut mem, tf) = user_mem();
        let (r, w) = AllocatedPipe::alloc().unwrap();

        mem.copy_out(BUF, b"kept").unwrap();
        pipe_of(&w).write(&mut mem, BUF, 4).unwrap();

        // Unmapped destination: the data must stay buffered.
        assert!(pipe_of(&r).read(&mut mem, 0x7000_0000, 4).is_err());
        assert_eq!(pipe_of(&r).read(&mut mem, BUF + 64, 4).unwrap(), 4);

        drop(r);
        drop(w);
        drop(mem);
        kernel().kmem.lock().free(tf);
    }
}
