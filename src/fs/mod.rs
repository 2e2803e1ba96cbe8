//! The file-system surface: a table of path-keyed in-memory inodes.
//!
//! The on-disk encoding and the block cache live behind this interface;
//! here an inode's content is a run of allocator pages and its identity is
//! its canonical absolute path. Identity fields are fixed from creation
//! until the slot dies, so holders of an `RcInode` may read them without a
//! lock; reference counts are guarded by the table lock; file content and
//! size sit behind the per-inode sleep-lock, which is held across whole
//! read/write operations.

pub mod path;

use core::cell::UnsafeCell;
use core::ops::Deref;
use core::ptr::NonNull;

use arrayvec::ArrayVec;

use crate::{
    kernel::kernel,
    lock::{RawSpinlock, Sleeplock},
    page::Page,
    param::{BSIZE, MAXPATH, NDIRECT, NINODE},
    stat::{Stat, DT_CHR, DT_DIR, DT_REG, S_IFCHR, S_IFDIR, S_IFREG},
    vm::PGSIZE,
};

pub use path::{resolve, strip_dots, PathBuf};

/// Device number reported for the whole in-memory volume.
pub const ROOTDEV: u64 = 1;

/// Largest regular file.
pub const MAXFILE: usize = NDIRECT * PGSIZE;

#[derive(Copy, Clone, PartialEq, Debug)]
pub enum InodeType {
    None,
    Dir,
    File,
    Device { major: u16, minor: u16 },
}

/// Identity fields; written only while the slot is being created or
/// recycled, when no references exist.
struct InodeMeta {
    inum: u32,
    alive: bool,
    typ: InodeType,
    path: [u8; MAXPATH],
    path_len: usize,
}

impl InodeMeta {
    const fn zero() -> Self {
        Self {
            inum: 0,
            alive: false,
            typ: InodeType::None,
            path: [0; MAXPATH],
            path_len: 0,
        }
    }
}

/// File content; guarded by the inode sleep-lock.
pub struct InodeData {
    size: usize,
    pages: [Option<NonNull<Page>>; NDIRECT],
}

// Page pointers refer to allocator-owned pages, not thread-local data.
unsafe impl Send for InodeData {}

impl InodeData {
    const fn zero() -> Self {
        Self {
            size: 0,
            pages: [None; NDIRECT],
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Read up to `dst.len()` bytes at `off`, returning the count actually
    /// read; 0 at or past end of file. Holes read as zeros.
    pub fn read_at(&self, dst: &mut [u8], off: usize) -> usize {
        if off >= self.size {
            return 0;
        }
        let n = dst.len().min(self.size - off);
        let mut copied = 0;
        while copied < n {
            let pos = off + copied;
            let in_page = (PGSIZE - pos % PGSIZE).min(n - copied);
            match self.pages[pos / PGSIZE] {
                Some(page) => {
                    let page = unsafe { page.as_ref() };
                    dst[copied..copied + in_page]
                        .copy_from_slice(&page[pos % PGSIZE..pos % PGSIZE + in_page]);
                }
                None => {
                    for b in &mut dst[copied..copied + in_page] {
                        *b = 0;
                    }
                }
            }
            copied += in_page;
        }
        n
    }

    /// Write `src` at `off`, extending the file and allocating pages as
    /// needed. Fails without writing if the result would exceed MAXFILE or
    /// a page cannot be allocated.
    pub fn write_at(&mut self, src: &[u8], off: usize) -> Result<usize, ()> {
        let end = off.checked_add(src.len()).ok_or(())?;
        if end > MAXFILE {
            return Err(());
        }
        if src.is_empty() {
            return Ok(0);
        }
        for index in off / PGSIZE..=(end - 1) / PGSIZE {
            if self.pages[index].is_none() {
                let mut page = kernel().kmem.lock().alloc().ok_or(())?;
                unsafe { page.as_mut() }.write_bytes(0);
                self.pages[index] = Some(page);
            }
        }
        let mut copied = 0;
        while copied < src.len() {
            let pos = off + copied;
            let in_page = (PGSIZE - pos % PGSIZE).min(src.len() - copied);
            let mut page = self.pages[pos / PGSIZE].unwrap();
            let page = unsafe { page.as_mut() };
            page[pos % PGSIZE..pos % PGSIZE + in_page]
                .copy_from_slice(&src[copied..copied + in_page]);
            copied += in_page;
        }
        if end > self.size {
            self.size = end;
        }
        Ok(src.len())
    }

    /// Discard the content, returning the pages to the allocator.
    pub fn trunc(&mut self) {
        for slot in self.pages.iter_mut() {
            if let Some(page) = slot.take() {
                kernel().kmem.lock().free(page);
            }
        }
        self.size = 0;
    }
}

pub struct Inode {
    meta: UnsafeCell<InodeMeta>,

    /// Open-handle count; guarded by the table lock.
    nref: UnsafeCell<u32>,

    pub data: Sleeplock<InodeData>,
}

impl Inode {
    const fn zero() -> Self {
        Self {
            meta: UnsafeCell::new(InodeMeta::zero()),
            nref: UnsafeCell::new(0),
            data: Sleeplock::new("inode", InodeData::zero()),
        }
    }

    fn meta(&self) -> &InodeMeta {
        // Identity fields are fixed while the caller can see the inode.
        unsafe { &*self.meta.get() }
    }

    pub fn inum(&self) -> u32 {
        self.meta().inum
    }

    pub fn typ(&self) -> InodeType {
        self.meta().typ
    }

    pub fn is_dir(&self) -> bool {
        self.typ() == InodeType::Dir
    }

    pub fn path(&self) -> &[u8] {
        let meta = self.meta();
        &meta.path[..meta.path_len]
    }

    /// Metadata snapshot; takes the inode sleep-lock to read the size.
    pub fn stat(&self) -> Stat {
        let (mode, rdev) = match self.typ() {
            InodeType::Dir => (S_IFDIR, 0),
            InodeType::Device { major, minor } => {
                (S_IFCHR, ((major as u64) << 8) | minor as u64)
            }
            _ => (S_IFREG, 0),
        };
        let size = self.data.lock().size();
        let mut st = Stat::default();
        st.st_dev = ROOTDEV;
        st.st_ino = self.inum() as u64;
        st.st_mode = mode;
        st.st_nlink = 1;
        st.st_rdev = rdev;
        st.st_size = size as i64;
        st.st_blksize = BSIZE as u32;
        st.st_blocks = ((size + BSIZE - 1) / BSIZE) as i64;
        st
    }
}

/// A counted reference to an inode slot.
pub struct RcInode {
    ptr: NonNull<Inode>,
}

unsafe impl Send for RcInode {}

impl Deref for RcInode {
    type Target = Inode;

    fn deref(&self) -> &Inode {
        unsafe { self.ptr.as_ref() }
    }
}

impl Clone for RcInode {
    fn clone(&self) -> Self {
        kernel().itable.dup(unsafe { self.ptr.as_ref() });
        Self { ptr: self.ptr }
    }
}

impl Drop for RcInode {
    fn drop(&mut self) {
        kernel().itable.put(unsafe { self.ptr.as_ref() });
    }
}

/// One directory entry, as reported by getdents.
pub struct DirEntry {
    pub inum: u32,
    pub d_type: u8,
    pub name: ArrayVec<u8, MAXPATH>,
}

/// The inode table. Slots persist after the last handle is dropped (they
/// are the volume); a slot is recycled only when it was never made alive.
pub struct Itable {
    lock: RawSpinlock,
    inodes: [Inode; NINODE],
    next_inum: UnsafeCell<u32>,
    root_once: spin::Once<()>,
}

impl Itable {
    pub const fn zero() -> Self {
        const SLOT: Inode = Inode::zero();
        Self {
            lock: RawSpinlock::new("itable"),
            inodes: [SLOT; NINODE],
            next_inum: UnsafeCell::new(1),
            root_once: spin::Once::new(),
        }
    }

    /// Create the root directory. Idempotent; runs in whichever context
    /// first touches the file system.
    pub fn init(&self) {
        self.root_once.call_once(|| {
            self.lock.acquire();
            let root = &self.inodes[0];
            let meta = unsafe { &mut *root.meta.get() };
            meta.inum = self.take_inum();
            meta.alive = true;
            meta.typ = InodeType::Dir;
            meta.path[0] = b'/';
            meta.path_len = 1;
            // The root is permanently referenced.
            unsafe { *root.nref.get() = 1 };
            self.lock.release();
        });
    }

    fn take_inum(&self) -> u32 {
        // Guarded by self.lock.
        let next = unsafe { &mut *self.next_inum.get() };
        let inum = *next;
        *next += 1;
        inum
    }

    fn dup(&self, inode: &Inode) {
        self.lock.acquire();
        unsafe { *inode.nref.get() += 1 };
        self.lock.release();
    }

    fn put(&self, inode: &Inode) {
        self.lock.acquire();
        let nref = unsafe { &mut *inode.nref.get() };
        assert!(*nref >= 1, "itable put");
        *nref -= 1;
        self.lock.release();
    }

    fn ref_of(&self, inode: &Inode) -> RcInode {
        unsafe { *inode.nref.get() += 1 };
        RcInode {
            ptr: NonNull::from(inode),
        }
    }

    /// Find an alive inode by canonical path. Caller holds the table lock.
    fn lookup_locked(&self, path: &[u8]) -> Option<&Inode> {
        self.inodes
            .iter()
            .find(|inode| inode.meta().alive && inode.path() == path)
    }

    /// Look an inode up by path and return a counted reference.
    pub fn namei(&self, path: &PathBuf) -> Result<RcInode, ()> {
        self.init();
        self.lock.acquire();
        let found = self.lookup_locked(path.as_bytes()).map(|i| self.ref_of(i));
        self.lock.release();
        found.ok_or(())
    }

    /// The `icreate` service: make (or open) the inode at `path`.
    ///
    /// If the path already exists, a request for a regular file opens an
    /// existing file or device; any other combination fails. Otherwise the
    /// parent must be an existing directory, and a fresh slot is claimed.
    pub fn create(&self, path: &PathBuf, typ: InodeType) -> Result<RcInode, ()> {
        self.init();
        self.lock.acquire();
        let result = self.create_locked(path, typ);
        self.lock.release();
        result
    }

    fn create_locked(&self, path: &PathBuf, typ: InodeType) -> Result<RcInode, ()> {
        if let Some(existing) = self.lookup_locked(path.as_bytes()) {
            return match (typ, existing.typ()) {
                (InodeType::File, InodeType::File) | (InodeType::File, InodeType::Device { .. }) => {
                    Ok(self.ref_of(existing))
                }
                _ => Err(()),
            };
        }

        let (parent, name) = path.parent_and_name().ok_or(())?;
        if name.is_empty() {
            return Err(());
        }
        let dir = self.lookup_locked(parent).ok_or(())?;
        if !dir.is_dir() {
            return Err(());
        }

        let slot = self
            .inodes
            .iter()
            .find(|inode| !inode.meta().alive && unsafe { *inode.nref.get() } == 0)
            .ok_or(())?;
        let meta = unsafe { &mut *slot.meta.get() };
        meta.inum = self.take_inum();
        meta.alive = true;
        meta.typ = typ;
        meta.path[..path.as_bytes().len()].copy_from_slice(path.as_bytes());
        meta.path_len = path.as_bytes().len();
        Ok(self.ref_of(slot))
    }

    /// The `index`th child of the directory at `dir_path`, in table order.
    /// Used to enumerate directories, which store no entry records.
    pub fn nth_child(&self, dir_path: &[u8], index: usize) -> Option<DirEntry> {
        self.lock.acquire();
        let mut seen = 0;
        let mut found = None;
        for inode in &self.inodes {
            if !inode.meta().alive {
                continue;
            }
            if path::parent_of(inode.path()) != Some(dir_path) {
                continue;
            }
            if seen == index {
                let name = path::name_of(inode.path());
                let mut entry = DirEntry {
                    inum: inode.inum(),
                    d_type: match inode.typ() {
                        InodeType::Dir => DT_DIR,
                        InodeType::Device { .. } => DT_CHR,
                        _ => DT_REG,
                    },
                    name: ArrayVec::new(),
                };
                entry.name.try_extend_from_slice(name).ok();
                found = Some(entry);
                break;
            }
            seen += 1;
        }
        self.lock.release();
        found
    }
}
