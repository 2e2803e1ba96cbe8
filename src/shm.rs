//! Named shared memory: a registry of reference-counted page runs that
//! processes map into their address spaces by name.

use core::ptr::NonNull;

use arrayvec::ArrayVec;

use crate::{
    kernel::kernel,
    page::Page,
    proc::{myproc, ProcData, ShmMapping},
    vm::PGSIZE,
    param::{MAX_PROC_SHM, MAX_SHARED_NAME, MAX_SHARED_PAGES, NSHM},
};

struct SharedMem {
    name: [u8; MAX_SHARED_NAME],
    name_len: usize,

    /// Number of processes attached; pages are freed when this hits zero.
    refcnt: u32,

    page_cnt: usize,
    pages: [Option<NonNull<Page>>; MAX_SHARED_PAGES],
}

impl SharedMem {
    const fn zero() -> Self {
        Self {
            name: [0; MAX_SHARED_NAME],
            name_len: 0,
            refcnt: 0,
            page_cnt: 0,
            pages: [None; MAX_SHARED_PAGES],
        }
    }

    fn name(&self) -> &[u8] {
        &self.name[..self.name_len]
    }
}

/// The registry; lives behind a kernel spinlock.
pub struct ShmPool {
    segs: [SharedMem; NSHM],
}

// Page pointers refer to allocator pages shared across processes.
unsafe impl Send for ShmPool {}

impl ShmPool {
    pub const fn zero() -> Self {
        const SEG: SharedMem = SharedMem::zero();
        Self {
            segs: [SEG; NSHM],
        }
    }

    /// Open the segment called `name`, creating it with `npages` pages when
    /// it does not exist. `npages == 0` opens an existing segment of any
    /// size; a nonzero `npages` must match an existing segment exactly.
    /// Bumps the reference count on success.
    fn get_or_create(&mut self, name: &[u8], npages: usize) -> Result<usize, ()> {
        if name.is_empty() || name.len() > MAX_SHARED_NAME || npages > MAX_SHARED_PAGES {
            return Err(());
        }

        if let Some(idx) = self
            .segs
            .iter()
            .position(|seg| seg.refcnt > 0 && seg.name() == name)
        {
            // Asking for a different size than the creator chose means the
            // caller is out of sync with whoever made it.
            if npages != 0 && self.segs[idx].page_cnt != npages {
                return Err(());
            }
            self.segs[idx].refcnt += 1;
            return Ok(idx);
        }

        if npages == 0 {
            return Err(());
        }

        let idx = self.segs.iter().position(|seg| seg.refcnt == 0).ok_or(())?;
        let seg = &mut self.segs[idx];
        for slot in 0..npages {
            match kernel().kmem.lock().alloc() {
                Some(mut page) => {
                    unsafe { page.as_mut() }.write_bytes(0);
                    seg.pages[slot] = Some(page);
                }
                None => {
                    for earlier in seg.pages[..slot].iter_mut() {
                        if let Some(page) = earlier.take() {
                            kernel().kmem.lock().free(page);
                        }
                    }
                    return Err(());
                }
            }
        }
        seg.name[..name.len()].copy_from_slice(name);
        seg.name_len = name.len();
        seg.page_cnt = npages;
        seg.refcnt = 1;
        Ok(idx)
    }

    fn pages_of(&self, idx: usize) -> ArrayVec<NonNull<Page>, MAX_SHARED_PAGES> {
        self.segs[idx].pages[..self.segs[idx].page_cnt]
            .iter()
            .map(|p| p.expect("shm page missing"))
            .collect()
    }

    fn page_cnt(&self, idx: usize) -> usize {
        self.segs[idx].page_cnt
    }

    /// Drop one attachment; the last one frees the pages.
    fn detach(&mut self, idx: usize) {
        let seg = &mut self.segs[idx];
        assert!(seg.refcnt >= 1, "shm detach");
        seg.refcnt -= 1;
        if seg.refcnt == 0 {
            for slot in seg.pages[..seg.page_cnt].iter_mut() {
                if let Some(page) = slot.take() {
                    kernel().kmem.lock().free(page);
                }
            }
            seg.page_cnt = 0;
            seg.name_len = 0;
        }
    }
}

/// Map the named segment into the current process at the next free
/// shared-mapping address. Returns the mapped virtual address.
pub unsafe fn map_current(name: &[u8], len: usize) -> Result<usize, ()> {
    if len % PGSIZE != 0 {
        return Err(());
    }
    let npages = len / PGSIZE;

    let p = unsafe { myproc() };
    let data = unsafe { &mut *(*p).data.get() };
    if data.shm_maps.is_full() {
        return Err(());
    }

    let mut pool = kernel().shm.lock();
    let seg = pool.get_or_create(name, npages)?;
    let pages = pool.pages_of(seg);
    let mapped_pages = pool.page_cnt(seg);
    drop(pool);

    let va = data.shm_top;
    let memory = data.memory.as_mut().ok_or(())?;
    if memory.map_shared(va, &pages).is_err() {
        kernel().shm.lock().detach(seg);
        return Err(());
    }
    data.shm_top = va + mapped_pages * PGSIZE;
    data.shm_maps.push(ShmMapping {
        seg,
        va,
        npages: mapped_pages,
    });
    Ok(va)
}

/// Unmap and release every attachment; used at exit.
pub fn detach_all(data: &mut ProcData) {
    while let Some(mapping) = data.shm_maps.pop() {
        if let Some(memory) = data.memory.as_mut() {
            let _ = memory.unmap_range(mapping.va, mapping.npages, false);
        }
        kernel().shm.lock().detach(mapping.seg);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support;

    #[test]
    fn create_open_and_free_lifecycle() {
        let _t = test_support::setup();
        let before = kernel().kmem.lock().free_pages();
        let mut pool = ShmPool::zero();

        let a = pool.get_or_create(b"buffer", 2).unwrap();
        assert_eq!(kernel().kmem.lock().free_pages(), before - 2);

        // Open by name, with and without the size.
        let b = pool.get_or_create(b"buffer", 0).unwrap();
        assert_eq!(a, b);
        let c = pool.get_or_create(b"buffer", 2).unwrap();
        assert_eq!(a, c);
        // Wrong size does not open it.
        assert!(pool.get_or_create(b"buffer", 1).is_err());

        pool.detach(a);
        pool.detach(b);
        assert_eq!(kernel().kmem.lock().free_pages(), before - 2);
        pool.detach(c);
        assert_eq!(kernel().kmem.lock().free_pages(), before);
    }

    #[test]
    fn opening_a_missing_segment_without_a_size_fails() {
        let _t = test_support::setup();
        let mut pool = ShmPool::zero();
        assert!(pool.get_or_create(b"ghost", 0).is_err());
    }

    #[test]
    fn name_and_size_limits() {
        let _t = test_support::setup();
        let mut pool = ShmPool::zero();
        let long_name = [b'n'; MAX_SHARED_NAME + 1];
        assert!(pool.get_or_create(&long_name, 1).is_err());
        assert!(pool.get_or_create(b"", 1).is_err());
        assert!(pool.get_or_create(b"big", MAX_SHARED_PAGES + 1).is_err());
    }

    #[test]
    fn segments_are_shared_until_last_detach() {
        let _t = test_support::setup();
        let mut pool = ShmPool::zero();
        let idx = pool.get_or_create(b"shared", 1).unwrap();
        let pages = pool.pages_of(idx);

        // Write through one attachment, read through another.
        unsafe {
            pages[0].as_ptr().cast::<u8>().write(42);
        }
        let again = pool.get_or_create(b"shared", 0).unwrap();
        let other_view = pool.pages_of(again);
        assert_eq!(unsafe { other_view[0].as_ptr().cast::<u8>().read() }, 42);

        pool.detach(idx);
        pool.detach(again);
    }
}
