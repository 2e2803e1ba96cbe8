//! Program loading: ELF validation, image construction, and the execve and
//! spawn entry points built on top of it.

use core::mem;

use zerocopy::{AsBytes, FromBytes};

use crate::{
    fs::{InodeType, PathBuf},
    kernel::kernel,
    proc::{myproc, Procstate},
    vm::{pgroundup, PteFlags, UserMemory, PGSIZE},
};

/// "\x7FELF" in little endian
const ELF_MAGIC: u32 = 0x464c_457f;

/// Values for ProgHdr type
const ELF_PROG_LOAD: u32 = 1;

const ELF_PROG_FLAG_EXEC: u32 = 1;
const ELF_PROG_FLAG_WRITE: u32 = 2;

/// File header. In-memory image of the on-disk layout, hence the explicit
/// C representation.
#[derive(Default, Clone, AsBytes, FromBytes)]
#[repr(C)]
struct ElfHdr {
    /// must equal ELF_MAGIC
    magic: u32,
    elf: [u8; 12],
    typ: u16,
    machine: u16,
    version: u32,
    entry: u64,
    phoff: u64,
    shoff: u64,
    flags: u32,
    ehsize: u16,
    phentsize: u16,
    phnum: u16,
    shentsize: u16,
    shnum: u16,
    shstrndx: u16,
}

/// Program section header.
#[derive(Default, Clone, AsBytes, FromBytes)]
#[repr(C)]
struct ProgHdr {
    typ: u32,
    flags: u32,
    off: u64,
    vaddr: u64,
    paddr: u64,
    filesz: u64,
    memsz: u64,
    align: u64,
}

impl ElfHdr {
    fn is_valid(&self) -> bool {
        self.magic == ELF_MAGIC
    }
}

impl ProgHdr {
    fn is_prog_load(&self) -> bool {
        self.typ == ELF_PROG_LOAD
    }
}

/// Read the ELF at `path` into a fresh address space whose trap frame page
/// is `trap_frame_pa`. Returns the image and its entry point.
fn load_image(path: &PathBuf, trap_frame_pa: usize) -> Result<(UserMemory, usize), ()> {
    let ip = kernel().itable.namei(path)?;
    if ip.typ() != InodeType::File {
        return Err(());
    }
    let data = ip.data.lock();

    let mut elf = ElfHdr::default();
    if data.read_at(elf.as_bytes_mut(), 0) != mem::size_of::<ElfHdr>() {
        return Err(());
    }
    if !elf.is_valid() {
        return Err(());
    }

    let mut memory = UserMemory::new(trap_frame_pa, None).ok_or(())?;

    // Load each program segment.
    for i in 0..elf.phnum as usize {
        let off = elf.phoff as usize + i * mem::size_of::<ProgHdr>();
        let mut ph = ProgHdr::default();
        if data.read_at(ph.as_bytes_mut(), off) != mem::size_of::<ProgHdr>() {
            return Err(());
        }
        if !ph.is_prog_load() {
            continue;
        }
        if ph.memsz < ph.filesz || ph.vaddr % PGSIZE as u64 != 0 {
            return Err(());
        }
        let mut perm = PteFlags::R;
        if ph.flags & ELF_PROG_FLAG_WRITE != 0 {
            perm |= PteFlags::W;
        }
        if ph.flags & ELF_PROG_FLAG_EXEC != 0 {
            perm |= PteFlags::X;
        }
        let end = ph.vaddr.checked_add(ph.memsz).ok_or(())? as usize;
        memory.grow(end, perm)?;

        // Copy the file-backed part of the segment in.
        let mut copied = 0;
        let mut buf = [0u8; 512];
        while copied < ph.filesz as usize {
            let chunk = (ph.filesz as usize - copied).min(buf.len());
            if data.read_at(&mut buf[..chunk], ph.off as usize + copied) != chunk {
                return Err(());
            }
            memory.copy_out(ph.vaddr as usize + copied, &buf[..chunk])?;
            copied += chunk;
        }
    }

    Ok((memory, elf.entry as usize))
}

/// Allocate the user stack (with an unmapped guard page beneath it) and
/// push the argument vector. Returns the initial stack pointer and argc;
/// the argv array pointer ends up just at `sp`.
fn setup_stack(memory: &mut UserMemory, args: &[&[u8]]) -> Result<(usize, usize), ()> {
    let base = pgroundup(memory.size());
    let newsz = memory.grow(base + 2 * PGSIZE, PteFlags::W)?;
    // Popping the guard page leaves a hole that faults on stack overflow.
    memory.unmap_range(base, 1, true)?;
    let stackbase = newsz - PGSIZE;

    let mut sp = newsz;
    let mut ustack = [0usize; crate::param::MAXARG + 1];
    if args.len() > crate::param::MAXARG {
        return Err(());
    }
    for (i, arg) in args.iter().enumerate() {
        sp -= arg.len() + 1;
        // The riscv calling convention keeps sp 16-byte aligned.
        sp &= !0xf;
        if sp < stackbase {
            return Err(());
        }
        memory.copy_out(sp, arg)?;
        memory.copy_out(sp + arg.len(), &[0u8])?;
        ustack[i] = sp;
    }
    ustack[args.len()] = 0;

    let argv_bytes = (args.len() + 1) * mem::size_of::<usize>();
    sp -= argv_bytes;
    sp &= !0xf;
    if sp < stackbase {
        return Err(());
    }
    let (_, raw, _) = unsafe { ustack.align_to::<u8>() };
    memory.copy_out(sp, &raw[..argv_bytes])?;

    Ok((sp, args.len()))
}

fn basename(path: &PathBuf) -> &[u8] {
    crate::fs::path::name_of(path.as_bytes())
}

/// Replace the current process's image. Descriptors and cwd survive.
/// Returns argc, which lands in the first return register.
pub unsafe fn exec(path: &PathBuf, args: &[&[u8]]) -> Result<usize, ()> {
    let p = unsafe { myproc() };
    let data = unsafe { &mut *(*p).data.get() };

    let (mut memory, entry) = load_image(path, data.trap_frame as usize)?;
    let (sp, argc) = setup_stack(&mut memory, args)?;

    // Commit to the new image; dropping the old one frees its pages.
    data.memory = Some(memory);
    data.trap_frame_mut().epc = entry;
    data.trap_frame_mut().sp = sp;
    // argv for user main; argc travels back as the syscall return.
    data.trap_frame_mut().a1 = sp;

    let name = basename(path);
    let len = name.len().min(data.name.len() - 1);
    data.name[..len].copy_from_slice(&name[..len]);
    data.name[len] = 0;

    Ok(argc)
}

/// Create a fresh process running the program at `path`: fork and exec
/// fused. The child inherits the parent's cwd but no descriptors beyond
/// those spawn itself wires up. Returns the child's pid.
pub unsafe fn spawn(path: &PathBuf) -> Result<i32, ()> {
    let p = unsafe { myproc() };
    let pdata = unsafe { &mut *(*p).data.get() };

    let trap_frame = kernel().kmem.lock().alloc().ok_or(())?;
    let trap_frame = scopeguard::guard(trap_frame, |tf| kernel().kmem.lock().free(tf));

    let (mut memory, entry) = load_image(path, trap_frame.as_ptr() as usize)?;
    let (sp, _argc) = setup_stack(&mut memory, &[])?;

    let mut np = kernel()
        .procs
        .alloc_for_spawn(scopeguard::ScopeGuard::into_inner(trap_frame), memory)?;
    let npdata = unsafe { &mut *np.proc_ref().data.get() };
    npdata.trap_frame_mut().epc = entry;
    npdata.trap_frame_mut().sp = sp;
    npdata.cwd = pdata.cwd.clone();

    let name = basename(path);
    let len = name.len().min(npdata.name.len() - 1);
    npdata.name[..len].copy_from_slice(&name[..len]);
    npdata.name[len] = 0;

    let pid = np.deref_info().pid;
    let child = np.proc_ref() as *const crate::proc::Proc;
    drop(np);

    let parent_guard = kernel().procs.wait_lock();
    unsafe { kernel().procs.set_parent(child, p) };
    let mut np = unsafe { (*child).lock() };
    np.deref_mut_info().state = Procstate::RUNNABLE;
    drop(np);
    drop(parent_guard);

    Ok(pid)
}
