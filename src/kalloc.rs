//! Physical memory allocator, for user processes,
//! kernel stacks, page-table pages,
//! and pipe buffers. Allocates whole 4096-byte pages.

use core::mem;
use core::ptr::{self, NonNull};

use crate::{
    page::Page,
    vm::{pgrounddown, pgroundup, PGSIZE},
};

struct Run {
    next: *mut Run,
}

/// # Safety
///
/// - This singly linked list does not have a cycle.
/// - If head is null, then it is an empty list. Otherwise, it is nonempty, and
///   head is its first element, which is a valid page inside [begin, end).
pub struct Kmem {
    head: *mut Run,
    begin: usize,
    end: usize,
}

// The free list stores raw page addresses; ownership is handed over at
// alloc/free boundaries.
unsafe impl Send for Kmem {}

impl Kmem {
    pub const fn new() -> Self {
        Self {
            head: ptr::null_mut(),
            begin: 0,
            end: 0,
        }
    }

    /// Create pages between `begin` and `end`.
    ///
    /// # Safety
    ///
    /// There must be no existing pages, and the memory in [begin, end) must
    /// not be in use by anything else. It implies that this method should be
    /// called only once.
    pub unsafe fn init(&mut self, begin: usize, end: usize) {
        self.begin = pgroundup(begin);
        self.end = pgrounddown(end);
        for pa in (self.begin..self.end).step_by(PGSIZE) {
            self.free(unsafe { NonNull::new_unchecked(pa as *mut Page) });
        }
    }

    pub fn free(&mut self, page: NonNull<Page>) {
        let pa = page.as_ptr() as usize;
        debug_assert!(
            pa % PGSIZE == 0 && (self.begin..self.end).contains(&pa),
            "Kmem::free"
        );
        let r = pa as *mut Run;
        // The page was handed back to us, so writing the link is safe and
        // cannot create a cycle.
        unsafe { (*r).next = self.head };
        self.head = r;
    }

    pub fn alloc(&mut self) -> Option<NonNull<Page>> {
        if self.head.is_null() {
            return None;
        }
        // head is not null and the structure of this list is maintained by
        // the invariant.
        let next = unsafe { (*self.head).next };
        NonNull::new(mem::replace(&mut self.head, next) as *mut Page)
    }

    /// Number of pages currently on the free list. For diagnostics only.
    pub fn free_pages(&self) -> usize {
        let mut n = 0;
        let mut r = self.head;
        while !r.is_null() {
            n += 1;
            r = unsafe { (*r).next };
        }
        n
    }
}

#[cfg(test)]
mod tests {
    use crate::kernel::kernel;
    use crate::test_support;

    #[test]
    fn alloc_free_reuses_pages() {
        let _t = test_support::setup();
        let a = kernel().kmem.lock().alloc().unwrap();
        let b = kernel().kmem.lock().alloc().unwrap();
        assert_ne!(a.as_ptr(), b.as_ptr());
        kernel().kmem.lock().free(a);
        let c = kernel().kmem.lock().alloc().unwrap();
        // LIFO free list hands the page straight back.
        assert_eq!(a.as_ptr(), c.as_ptr());
        kernel().kmem.lock().free(b);
        kernel().kmem.lock().free(c);
    }

    #[test]
    fn exhaustion_returns_none() {
        let _t = test_support::setup();
        let mut taken = std::vec::Vec::new();
        loop {
            match kernel().kmem.lock().alloc() {
                Some(p) => taken.push(p),
                None => break,
            }
        }
        assert!(!taken.is_empty());
        for p in taken {
            kernel().kmem.lock().free(p);
        }
    }
}
