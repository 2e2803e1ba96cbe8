//! Virtual memory: Sv39-style page tables, the per-process user address
//! space, and the page-table-aware copy primitives the syscall layer uses to
//! touch user memory.

use core::ptr::NonNull;

use bitflags::bitflags;

use crate::{
    kernel::kernel,
    memlayout::TRAPFRAME,
    page::Page,
};

pub const PGSIZE: usize = 4096;
pub const PGSHIFT: usize = 12;

/// One beyond the highest possible virtual address. MAXVA is actually one
/// bit less than the max allowed by Sv39, to avoid having to sign-extend
/// virtual addresses that have the high bit set.
pub const MAXVA: usize = 1 << (9 + 9 + 9 + 12 - 1);

pub const fn pgroundup(addr: usize) -> usize {
    (addr + PGSIZE - 1) & !(PGSIZE - 1)
}

pub const fn pgrounddown(addr: usize) -> usize {
    addr & !(PGSIZE - 1)
}

bitflags! {
    pub struct PteFlags: usize {
        /// valid
        const V = 1 << 0;
        /// readable
        const R = 1 << 1;
        /// writable
        const W = 1 << 2;
        /// executable
        const X = 1 << 3;
        /// user-accessible
        const U = 1 << 4;
        /// RSW bit: the page is owned by the shared-memory registry, not by
        /// this address space.
        const SHARED = 1 << 8;
    }
}

const fn px(level: usize, va: usize) -> usize {
    (va >> (PGSHIFT + 9 * level)) & 0x1ff
}

const fn pa2pte(pa: usize) -> usize {
    (pa >> 12) << 10
}

const fn pte2pa(pte: usize) -> usize {
    (pte >> 10) << 12
}

/// # Safety
///
/// If self.is_table() is true, then it must refer to a valid page-table
/// page. Inner value 0 (an invalid entry) satisfies the invariant.
#[derive(Default)]
struct PageTableEntry {
    inner: usize,
}

impl PageTableEntry {
    fn flags(&self) -> PteFlags {
        PteFlags::from_bits_truncate(self.inner)
    }

    fn pa(&self) -> usize {
        pte2pa(self.inner)
    }

    fn is_valid(&self) -> bool {
        self.flags().contains(PteFlags::V)
    }

    fn is_user(&self) -> bool {
        self.flags().contains(PteFlags::V | PteFlags::U)
    }

    fn is_table(&self) -> bool {
        self.is_valid() && !self.flags().intersects(PteFlags::R | PteFlags::W | PteFlags::X)
    }

    fn is_data(&self) -> bool {
        self.is_valid() && self.flags().intersects(PteFlags::R | PteFlags::W | PteFlags::X)
    }

    /// Make the entry refer to a given page-table page.
    fn set_table(&mut self, page: *mut RawPageTable) {
        self.inner = pa2pte(page as usize) | PteFlags::V.bits();
    }

    /// Make the entry refer to a given address with a given permission.
    /// The permission should include at least one of R, W, and X not to be
    /// considered as an entry referring to a page-table page.
    fn set_entry(&mut self, pa: usize, perm: PteFlags) {
        debug_assert!(perm.intersects(PteFlags::R | PteFlags::W | PteFlags::X));
        self.inner = pa2pte(pa) | (perm | PteFlags::V).bits();
    }

    /// Invalidate the entry by making every bit 0.
    fn invalidate(&mut self) {
        self.inner = 0;
    }

    /// Return `Some(..)` if it refers to a page-table page, `None` otherwise.
    fn as_table_mut(&mut self) -> Option<&mut RawPageTable> {
        if self.is_table() {
            // Safe because of the invariant.
            Some(unsafe { &mut *(pte2pa(self.inner) as *mut _) })
        } else {
            None
        }
    }
}

const PTE_PER_PT: usize = PGSIZE / core::mem::size_of::<PageTableEntry>();

/// # Safety
///
/// Always occupies exactly one page obtained from the page allocator.
struct RawPageTable {
    inner: [PageTableEntry; PTE_PER_PT],
}

impl RawPageTable {
    /// Make a new empty raw page table by allocating a new page.
    /// Returns `None` if the allocation has failed.
    fn new() -> Option<*mut RawPageTable> {
        let mut page = kernel().kmem.lock().alloc()?;
        unsafe { page.as_mut() }.write_bytes(0);
        // All entries are zero, i.e. invalid; the invariant holds.
        Some(page.as_ptr() as *mut RawPageTable)
    }

    /// Return the `index`th entry as a page-table page, allocating it if
    /// `alloc` is true and the entry is invalid. Returns `None` if the entry
    /// refers to a data page, or is invalid and could not be allocated.
    fn get_table_mut(&mut self, index: usize, alloc: bool) -> Option<&mut RawPageTable> {
        let pte = &mut self.inner[index];
        if !pte.is_valid() {
            if !alloc {
                return None;
            }
            let table = Self::new()?;
            pte.set_table(table);
        }
        pte.as_table_mut()
    }

    fn get_entry_mut(&mut self, index: usize) -> &mut PageTableEntry {
        let pte = &mut self.inner[index];
        debug_assert!(!pte.is_table(), "walk into a leaf level hit a table");
        pte
    }

    /// Recursively free page-table pages, and the user-owned data pages they
    /// map. Pages mapped without U (trampoline, trap frame) and pages the
    /// shared-memory registry owns are left alone.
    unsafe fn free_recursive(table: *mut RawPageTable, level: usize) {
        for index in 0..PTE_PER_PT {
            let pte = unsafe { &mut (*table).inner[index] };
            if level > 0 {
                if let Some(child) = pte.as_table_mut() {
                    unsafe { Self::free_recursive(child, level - 1) };
                    pte.invalidate();
                }
            } else if pte.is_data()
                && pte.is_user()
                && !pte.flags().contains(PteFlags::SHARED)
            {
                let page = pte.pa() as *mut Page;
                kernel()
                    .kmem
                    .lock()
                    .free(unsafe { NonNull::new_unchecked(page) });
                pte.invalidate();
            } else {
                pte.invalidate();
            }
        }
        kernel()
            .kmem
            .lock()
            .free(unsafe { NonNull::new_unchecked(table as *mut Page) });
    }
}

/// A page-table root plus the walk/map/unmap operations.
pub struct PageTable {
    ptr: *mut RawPageTable,
}

impl PageTable {
    fn new() -> Option<Self> {
        Some(Self {
            ptr: RawPageTable::new()?,
        })
    }

    /// Physical address of the root, for satp encoding.
    pub fn addr(&self) -> usize {
        self.ptr as usize
    }

    /// Find the leaf entry for virtual address `va`, optionally allocating
    /// the intermediate page-table pages.
    fn walk_mut(&mut self, va: usize, alloc: bool) -> Option<&mut PageTableEntry> {
        assert!(va < MAXVA, "walk");
        let mut table = unsafe { &mut *self.ptr };
        for level in (1..=2).rev() {
            table = table.get_table_mut(px(level, va), alloc)?;
        }
        Some(table.get_entry_mut(px(0, va)))
    }

    /// Translate a user virtual address to a physical address, requiring a
    /// valid user-accessible leaf mapping.
    fn translate_user(&mut self, va: usize) -> Option<usize> {
        if va >= MAXVA {
            return None;
        }
        let pte = self.walk_mut(pgrounddown(va), false)?;
        if !pte.is_user() {
            return None;
        }
        Some(pte.pa() + (va - pgrounddown(va)))
    }

    /// Create a mapping for `npages` pages starting at `va` -> `pa`.
    /// Fails (leaving earlier pages of the run mapped) if any page in the
    /// range is already mapped or a table page cannot be allocated.
    fn map_pages(
        &mut self,
        va: usize,
        npages: usize,
        mut pa: usize,
        perm: PteFlags,
    ) -> Result<(), ()> {
        debug_assert!(va % PGSIZE == 0, "map_pages");
        for page_va in (va..va + npages * PGSIZE).step_by(PGSIZE) {
            let pte = self.walk_mut(page_va, true).ok_or(())?;
            if pte.is_valid() {
                return Err(());
            }
            pte.set_entry(pa, perm);
            pa += PGSIZE;
        }
        Ok(())
    }

    /// Remove the mapping at `va`, returning the physical address that was
    /// mapped. Fails if there is no valid leaf there.
    fn unmap_page(&mut self, va: usize) -> Result<usize, ()> {
        debug_assert!(va % PGSIZE == 0, "unmap_page");
        let pte = self.walk_mut(va, false).ok_or(())?;
        if !pte.is_data() {
            return Err(());
        }
        let pa = pte.pa();
        pte.invalidate();
        Ok(pa)
    }
}

/// A process's user address space: page table plus program break.
///
/// Layout: text and data from zero, heap above them (grown by brk), named
/// shared-memory mappings and mmap regions higher up, the trap frame just
/// under the trampoline.
pub struct UserMemory {
    page_table: PageTable,

    /// Program break; [0, size) is the conventionally-owned image.
    size: usize,
}

impl UserMemory {
    /// Create an address space with the trap frame mapped (and, on riscv,
    /// the trampoline), and, if `initcode` is given, one page at address
    /// zero holding it.
    pub fn new(trap_frame_pa: usize, initcode: Option<&[u8]>) -> Option<Self> {
        let page_table = PageTable::new()?;
        let mut memory = Self {
            page_table,
            size: 0,
        };

        #[cfg(target_arch = "riscv64")]
        {
            extern "C" {
                static mut trampoline: [u8; 0];
            }
            let trampoline_pa = unsafe { trampoline.as_ptr() as usize };
            memory
                .page_table
                .map_pages(
                    crate::memlayout::TRAMPOLINE,
                    1,
                    trampoline_pa,
                    PteFlags::R | PteFlags::X,
                )
                .ok()?;
        }

        memory
            .page_table
            .map_pages(TRAPFRAME, 1, trap_frame_pa, PteFlags::R | PteFlags::W)
            .ok()?;

        if let Some(code) = initcode {
            assert!(code.len() < PGSIZE, "initcode more than a page");
            let mut page = kernel().kmem.lock().alloc()?;
            let page_ref = unsafe { page.as_mut() };
            page_ref.write_bytes(0);
            page_ref[..code.len()].copy_from_slice(code);
            memory
                .page_table
                .map_pages(
                    0,
                    1,
                    page.as_ptr() as usize,
                    PteFlags::R | PteFlags::W | PteFlags::X | PteFlags::U,
                )
                .ok()?;
            memory.size = PGSIZE;
        }

        Some(memory)
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn satp(&self) -> usize {
        use crate::arch::{Arch, TargetArch};
        TargetArch::make_satp(self.page_table.addr())
    }

    /// Grow the image to at least `newsz` bytes, allocating zeroed pages
    /// with the given extra permissions. Returns the new size.
    pub fn grow(&mut self, newsz: usize, perm: PteFlags) -> Result<usize, ()> {
        if newsz <= self.size {
            return Ok(self.size);
        }
        if newsz >= MAXVA {
            return Err(());
        }
        let oldsz = self.size;
        let mut va = pgroundup(self.size);
        while va < newsz {
            let page = match kernel().kmem.lock().alloc() {
                Some(p) => p,
                None => {
                    self.size = va;
                    let _ = self.shrink(oldsz);
                    return Err(());
                }
            };
            let mut page = page;
            unsafe { page.as_mut() }.write_bytes(0);
            if self
                .page_table
                .map_pages(
                    va,
                    1,
                    page.as_ptr() as usize,
                    perm | PteFlags::R | PteFlags::U,
                )
                .is_err()
            {
                kernel().kmem.lock().free(page);
                self.size = va;
                let _ = self.shrink(oldsz);
                return Err(());
            }
            va += PGSIZE;
        }
        self.size = newsz;
        Ok(self.size)
    }

    /// Shrink the image to `newsz` bytes, freeing whole pages above it.
    pub fn shrink(&mut self, newsz: usize) -> usize {
        if newsz >= self.size {
            return self.size;
        }
        let mut va = pgroundup(newsz);
        while va < pgroundup(self.size) {
            if let Ok(pa) = self.page_table.unmap_page(va) {
                kernel()
                    .kmem
                    .lock()
                    .free(unsafe { NonNull::new_unchecked(pa as *mut Page) });
            }
            va += PGSIZE;
        }
        self.size = newsz;
        self.size
    }

    /// Map `npages` freshly allocated, zeroed pages at page-aligned `va`
    /// with the given user permissions. Used by mmap.
    pub fn map_anonymous(&mut self, va: usize, npages: usize, perm: PteFlags) -> Result<(), ()> {
        if va % PGSIZE != 0 || va + npages * PGSIZE >= MAXVA {
            return Err(());
        }
        for i in 0..npages {
            let mut page = kernel().kmem.lock().alloc().ok_or(())?;
            unsafe { page.as_mut() }.write_bytes(0);
            if self
                .page_table
                .map_pages(
                    va + i * PGSIZE,
                    1,
                    page.as_ptr() as usize,
                    perm | PteFlags::U,
                )
                .is_err()
            {
                kernel().kmem.lock().free(page);
                // Unwind what this call mapped.
                let _ = self.unmap_range(va, i, true);
                return Err(());
            }
        }
        Ok(())
    }

    /// Unmap `npages` pages starting at page-aligned `va`. Every page in the
    /// range must be mapped. Pages are returned to the allocator when
    /// `free` is set and the mapping is not a shared-memory page.
    pub fn unmap_range(&mut self, va: usize, npages: usize, free: bool) -> Result<(), ()> {
        if va % PGSIZE != 0 {
            return Err(());
        }
        for i in 0..npages {
            let page_va = va + i * PGSIZE;
            let shared = self
                .page_table
                .walk_mut(page_va, false)
                .map(|pte| pte.flags().contains(PteFlags::SHARED))
                .unwrap_or(false);
            let pa = self.page_table.unmap_page(page_va)?;
            if free && !shared {
                kernel()
                    .kmem
                    .lock()
                    .free(unsafe { NonNull::new_unchecked(pa as *mut Page) });
            }
        }
        Ok(())
    }

    /// Map pages owned by the shared-memory registry. They are tagged so
    /// that neither `unmap_range(.., true)` nor teardown frees them.
    pub fn map_shared(&mut self, va: usize, pages: &[NonNull<Page>]) -> Result<(), ()> {
        for (i, page) in pages.iter().enumerate() {
            if self
                .page_table
                .map_pages(
                    va + i * PGSIZE,
                    1,
                    page.as_ptr() as usize,
                    PteFlags::R | PteFlags::W | PteFlags::U | PteFlags::SHARED,
                )
                .is_err()
            {
                let _ = self.unmap_range(va, i, false);
                return Err(());
            }
        }
        Ok(())
    }

    /// Copy the image of this address space into a new one, for fork. The
    /// conventionally-owned [0, size) range is copied; mmap and shared
    /// mappings are a per-policy matter and are not inherited.
    pub fn try_clone(&mut self, trap_frame_pa: usize) -> Option<Self> {
        let mut new = Self::new(trap_frame_pa, None)?;
        let mut va = 0;
        while va < self.size {
            // Stack guard pages leave holes in the image; skip them.
            let src_pa = match self.page_table.translate_user(va) {
                Some(pa) => pa,
                None => {
                    va += PGSIZE;
                    continue;
                }
            };
            let flags = self
                .page_table
                .walk_mut(va, false)
                .expect("try_clone: walk")
                .flags()
                - PteFlags::V;
            let mut page = kernel().kmem.lock().alloc()?;
            unsafe {
                core::ptr::copy_nonoverlapping(
                    src_pa as *const u8,
                    page.as_mut().as_mut_ptr(),
                    PGSIZE,
                );
            }
            if new
                .page_table
                .map_pages(va, 1, page.as_ptr() as usize, flags)
                .is_err()
            {
                kernel().kmem.lock().free(page);
                return None;
            }
            va += PGSIZE;
        }
        new.size = self.size;
        Some(new)
    }

    /// Copy from kernel to user.
    /// Returns Err if any page of the destination is not user-mapped.
    pub fn copy_out(&mut self, dstva: usize, src: &[u8]) -> Result<(), ()> {
        let mut copied = 0;
        while copied < src.len() {
            let va = dstva + copied;
            let pa = self.page_table.translate_user(va).ok_or(())?;
            let in_page = core::cmp::min(
                PGSIZE - (va - pgrounddown(va)),
                src.len() - copied,
            );
            unsafe {
                core::ptr::copy_nonoverlapping(
                    src[copied..].as_ptr(),
                    pa as *mut u8,
                    in_page,
                );
            }
            copied += in_page;
        }
        Ok(())
    }

    /// Copy from user to kernel.
    /// Returns Err if any page of the source is not user-mapped.
    pub fn copy_in(&mut self, dst: &mut [u8], srcva: usize) -> Result<(), ()> {
        let mut copied = 0;
        while copied < dst.len() {
            let va = srcva + copied;
            let pa = self.page_table.translate_user(va).ok_or(())?;
            let in_page = core::cmp::min(
                PGSIZE - (va - pgrounddown(va)),
                dst.len() - copied,
            );
            unsafe {
                core::ptr::copy_nonoverlapping(
                    pa as *const u8,
                    dst[copied..].as_mut_ptr(),
                    in_page,
                );
            }
            copied += in_page;
        }
        Ok(())
    }

    /// Copy a NUL-terminated string from user to kernel, including the NUL.
    /// Returns Err on fault or if the string does not fit in `dst`.
    pub fn copy_in_str(&mut self, dst: &mut [u8], srcva: usize) -> Result<(), ()> {
        let mut copied = 0;
        loop {
            let va = srcva + copied;
            let pa = self.page_table.translate_user(va).ok_or(())?;
            let in_page = PGSIZE - (va - pgrounddown(va));
            for i in 0..in_page {
                if copied >= dst.len() {
                    return Err(());
                }
                let c = unsafe { *((pa + i) as *const u8) };
                dst[copied] = c;
                copied += 1;
                if c == 0 {
                    return Ok(());
                }
            }
        }
    }
}

impl Drop for UserMemory {
    fn drop(&mut self) {
        // Frees every user-owned data page plus the table pages; the
        // trampoline, the trap frame and shared-memory pages are owned
        // elsewhere and survive.
        unsafe { RawPageTable::free_recursive(self.page_table.ptr, 2) };
    }
}

/// The kernel's own address space, shared by all harts. Built once at boot.
#[cfg(target_arch = "riscv64")]
pub struct KernelMemory {
    page_table: PageTable,
}

#[cfg(target_arch = "riscv64")]
static KERNEL_MEMORY: spin::Once<KernelMemory> = spin::Once::new();

#[cfg(target_arch = "riscv64")]
impl KernelMemory {
    /// Build the kernel page table: devices, RAM, the trampoline, and one
    /// stack per process slot, each under its own guard hole.
    pub fn init() -> &'static Self {
        KERNEL_MEMORY.call_once(|| {
            use crate::memlayout::{kstack, KERNBASE, PHYSTOP, PLIC, TRAMPOLINE, UART0, VIRTIO0};
            use crate::param::NPROC;

            extern "C" {
                static mut trampoline: [u8; 0];
            }

            let mut page_table = PageTable::new().expect("KernelMemory");
            let rw = PteFlags::R | PteFlags::W;

            page_table.map_pages(UART0, 1, UART0, rw).expect("uart");
            page_table.map_pages(VIRTIO0, 1, VIRTIO0, rw).expect("virtio");
            page_table
                .map_pages(PLIC, 0x400000 / PGSIZE, PLIC, rw)
                .expect("plic");
            page_table
                .map_pages(
                    KERNBASE,
                    (PHYSTOP - KERNBASE) / PGSIZE,
                    KERNBASE,
                    PteFlags::R | PteFlags::W | PteFlags::X,
                )
                .expect("ram");
            let trampoline_pa = unsafe { trampoline.as_ptr() as usize };
            page_table
                .map_pages(TRAMPOLINE, 1, trampoline_pa, PteFlags::R | PteFlags::X)
                .expect("trampoline");

            // Kernel stacks, with invalid guard pages beneath.
            for i in 0..NPROC {
                let page = kernel().kmem.lock().alloc().expect("kstack");
                page_table
                    .map_pages(kstack(i), 1, page.as_ptr() as usize, rw)
                    .expect("kstack map");
            }

            Self { page_table }
        })
    }

    pub fn shared() -> &'static Self {
        KERNEL_MEMORY.get().expect("kernel memory not initialized")
    }

    /// Switch this hart's translation to the kernel page table.
    ///
    /// # Safety
    ///
    /// The page table must map the executing kernel.
    pub unsafe fn init_hart(&self) {
        use crate::arch::{Arch, TargetArch};
        unsafe {
            crate::arch::riscv::install_pagetable(TargetArch::make_satp(self.page_table.addr()))
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support;

    fn fresh_memory() -> (UserMemory, NonNull<Page>) {
        let tf = kernel().kmem.lock().alloc().unwrap();
        let mem = UserMemory::new(tf.as_ptr() as usize, None).unwrap();
        (mem, tf)
    }

    #[test]
    fn copy_roundtrip_through_mapped_pages() {
        let _t = test_support::setup();
        let (mut mem, tf) = fresh_memory();
        mem.map_anonymous(0x4000_0000, 2, PteFlags::R | PteFlags::W)
            .unwrap();

        let msg = b"paging works";
        mem.copy_out(0x4000_0000 + PGSIZE - 4, msg).unwrap();
        let mut back = [0u8; 12];
        mem.copy_in(&mut back, 0x4000_0000 + PGSIZE - 4).unwrap();
        assert_eq!(&back, msg);

        mem.unmap_range(0x4000_0000, 2, true).unwrap();
        assert!(mem.copy_in(&mut back, 0x4000_0000 + PGSIZE - 4).is_err());
        drop(mem);
        kernel().kmem.lock().free(tf);
    }

    #[test]
    fn unmap_requires_full_mapping() {
        let _t = test_support::setup();
        let (mut mem, tf) = fresh_memory();
        mem.map_anonymous(0x4000_0000, 1, PteFlags::R).unwrap();
        // Second page of the range was never mapped.
        assert!(mem.unmap_range(0x4000_0000, 2, true).is_err());
        drop(mem);
        kernel().kmem.lock().free(tf);
    }

    #[test]
    fn grow_and_shrink_move_the_break() {
        let _t = test_support::setup();
        let (mut mem, tf) = fresh_memory();
        assert_eq!(mem.grow(3 * PGSIZE, PteFlags::W).unwrap(), 3 * PGSIZE);
        mem.copy_out(2 * PGSIZE, b"brk").unwrap();
        assert_eq!(mem.shrink(PGSIZE), PGSIZE);
        assert!(mem.copy_out(2 * PGSIZE, b"brk").is_err());
        drop(mem);
        kernel().kmem.lock().free(tf);
    }

    #[test]
    fn copy_in_str_stops_at_nul() {
        let _t = test_support::setup();
        let (mut mem, tf) = fresh_memory();
        mem.map_anonymous(0x5000_0000, 1, PteFlags::R | PteFlags::W)
            .unwrap();
        mem.copy_out(0x5000_0000, b"/bin/sh\0trailing").unwrap();
        let mut buf = [0u8; 32];
        mem.copy_in_str(&mut buf, 0x5000_0000).unwrap();
        assert_eq!(&buf[..8], b"/bin/sh\0");

        // A string longer than the buffer is an error, not a truncation.
        let mut tiny = [0u8; 4];
        assert!(mem.copy_in_str(&mut tiny, 0x5000_0000).is_err());
        drop(mem);
        kernel().kmem.lock().free(tf);
    }

    #[test]
    fn teardown_returns_pages_to_the_allocator() {
        let _t = test_support::setup();
        let before = kernel().kmem.lock().free_pages();
        let (mut mem, tf) = fresh_memory();
        mem.grow(4 * PGSIZE, PteFlags::W).unwrap();
        mem.map_anonymous(0x4000_0000, 3, PteFlags::R | PteFlags::W)
            .unwrap();
        drop(mem);
        kernel().kmem.lock().free(tf);
        assert_eq!(kernel().kmem.lock().free_pages(), before);
    }

    #[test]
    fn fork_style_clone_copies_the_image() {
        let _t = test_support::setup();
        let (mut mem, tf) = fresh_memory();
        mem.grow(2 * PGSIZE, PteFlags::W).unwrap();
        mem.copy_out(100, b"inherited").unwrap();

        let tf2 = kernel().kmem.lock().alloc().unwrap();
        let mut child = mem.try_clone(tf2.as_ptr() as usize).unwrap();
        assert_eq!(child.size(), mem.size());

        // The copy is deep: writing the child leaves the parent alone.
        child.copy_out(100, b"different").unwrap();
        let mut parent_view = [0u8; 9];
        mem.copy_in(&mut parent_view, 100).unwrap();
        assert_eq!(&parent_view, b"inherited");

        drop(child);
        drop(mem);
        kernel().kmem.lock().free(tf);
        kernel().kmem.lock().free(tf2);
    }
}
