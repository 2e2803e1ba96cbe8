//! Process-side system calls.

use core::ptr::NonNull;

use arrayvec::ArrayVec;

use crate::{
    arch::{Arch, TargetArch},
    exec,
    fs::{self, PathBuf},
    info,
    kernel::kernel,
    page::Page,
    param::{MAXARG, MAXPATH, MAX_MAIL_LENGTH, MAX_SHARED_NAME},
    proc::{myproc, yield_cpu},
    syscall::{argaddr, argi64, argint, argstr},
    vm::{pgroundup, PteFlags, UserMemory, PGSIZE},
};

/// clone() accepts only this flag value.
const SIGCHLD: usize = 17;

/// wait4 options: only WNOHANG is honored.
const WNOHANG: i32 = 1;

/// mmap length cap, as in the reference kernel.
const MMAP_MAX_LEN: usize = 1024 * 1024 * 1024;

unsafe fn user_memory<'a>() -> Result<&'a mut UserMemory, ()> {
    let p = unsafe { myproc() };
    unsafe { &mut *(*p).data.get() }.memory.as_mut().ok_or(())
}

pub unsafe fn sys_exit() -> i64 {
    let code = unsafe { argint(0) };
    unsafe { kernel().procs.exit_current(code) }
}

pub unsafe fn sys_sched_yield() -> i64 {
    unsafe { yield_cpu() };
    0
}

pub unsafe fn sys_getpid() -> i64 {
    unsafe { (*myproc()).pid() as i64 }
}

pub unsafe fn sys_getppid() -> i64 {
    unsafe { kernel().procs.parent_pid() }
}

/// Only SIGCHLD is supported; the remaining parameters (ptid, tls, ctid)
/// are ignored.
pub unsafe fn sys_clone() -> i64 {
    let flags = unsafe { argaddr(0) };
    let child_stack = unsafe { argaddr(1) };
    if flags != SIGCHLD {
        info!("clone: flags must be SIGCHLD");
        return -1;
    }
    match unsafe { kernel().procs.fork(child_stack) } {
        Ok(pid) => pid as i64,
        Err(_) => -1,
    }
}

pub unsafe fn sys_execve() -> i64 {
    let mut path_buf = [0u8; MAXPATH];
    let path = match unsafe { argstr(0, &mut path_buf) } {
        Ok(s) => s,
        Err(_) => return -1,
    };
    let uargv = unsafe { argaddr(1) };
    // envp (argument 2) is accepted but not passed to the new image.

    let path = match unsafe { resolve_path(path.to_bytes()) } {
        Ok(p) => p,
        Err(_) => return -1,
    };

    // Gather argument strings into kernel pages.
    let mut pages = ArrayVec::<NonNull<Page>, MAXARG>::new();
    let mut failed = false;
    if uargv != 0 {
        loop {
            if pages.len() >= MAXARG {
                failed = true;
                break;
            }
            let mut ptr_bytes = [0u8; 8];
            let memory = match unsafe { user_memory() } {
                Ok(m) => m,
                Err(_) => {
                    failed = true;
                    break;
                }
            };
            if memory
                .copy_in(&mut ptr_bytes, uargv + pages.len() * 8)
                .is_err()
            {
                failed = true;
                break;
            }
            let uarg = usize::from_ne_bytes(ptr_bytes);
            if uarg == 0 {
                break;
            }
            let mut page = match kernel().kmem.lock().alloc() {
                Some(p) => p,
                None => {
                    failed = true;
                    break;
                }
            };
            let page_buf = unsafe { page.as_mut() };
            if memory.copy_in_str(&mut page_buf[..], uarg).is_err() {
                kernel().kmem.lock().free(page);
                failed = true;
                break;
            }
            pages.push(page);
        }
    }

    let ret = if failed {
        -1
    } else {
        let mut args = ArrayVec::<&[u8], MAXARG>::new();
        for page in &pages {
            let bytes = &unsafe { page.as_ref() }[..];
            let nul = bytes.iter().position(|&c| c == 0).unwrap_or(0);
            args.push(&bytes[..nul]);
        }
        match unsafe { exec::exec(&path, &args) } {
            Ok(argc) => argc as i64,
            Err(_) => -1,
        }
    };

    for page in pages {
        kernel().kmem.lock().free(page);
    }
    ret
}

unsafe fn resolve_path(path: &[u8]) -> Result<PathBuf, ()> {
    let p = unsafe { myproc() };
    let data = unsafe { &*(*p).data.get() };
    let base = match &data.cwd {
        Some(cwd) => Some(PathBuf::from_absolute(cwd.path())?),
        None => None,
    };
    fs::resolve(base.as_ref(), path)
}

/// Only WNOHANG is supported among the options, and rusage must be null.
pub unsafe fn sys_wait4() -> i64 {
    let pid = unsafe { argint(0) };
    let wstatus = unsafe { argaddr(1) };
    let options = unsafe { argint(2) };
    let rusage = unsafe { argaddr(3) };

    if options & !WNOHANG != 0 || rusage != 0 {
        info!("wait4: options={} rusage={:#x} not supported", options, rusage);
        return -1;
    }
    match unsafe { kernel().procs.wait(pid, wstatus, options & WNOHANG != 0) } {
        Ok(pid) => pid as i64,
        Err(_) => -1,
    }
}

pub unsafe fn sys_kill() -> i64 {
    let pid = unsafe { argint(0) };
    match kernel().procs.kill(pid) {
        Ok(()) => 0,
        Err(_) => -1,
    }
}

/// Set the current process's priority; >= 2, higher runs first.
/// Returns the priority set.
pub unsafe fn sys_setpriority() -> i64 {
    let priority = unsafe { argi64(0) };
    if priority < 2 {
        return -1;
    }
    let p = unsafe { myproc() };
    let mut guard = unsafe { (*p).lock() };
    guard.deref_mut_info().priority = priority;
    priority
}

pub unsafe fn sys_getpriority() -> i64 {
    let p = unsafe { myproc() };
    let guard = unsafe { (*p).lock() };
    guard.deref_info().priority
}

pub unsafe fn sys_gettimeofday() -> i64 {
    let tv = unsafe { argaddr(0) };
    // The timezone argument is obsolete and ignored.
    let us = TargetArch::time_us();
    let mut out = [0u8; 16];
    out[..8].copy_from_slice(&(us / 1_000_000).to_ne_bytes());
    out[8..].copy_from_slice(&(us % 1_000_000).to_ne_bytes());

    let memory = match unsafe { user_memory() } {
        Ok(m) => m,
        Err(_) => return -1,
    };
    match memory.copy_out(tv, &out) {
        Ok(()) => 0,
        Err(_) => -1,
    }
}

/// brk(0) reports the current break; otherwise the image is grown or
/// shrunk to `addr` and the new break is returned.
pub unsafe fn sys_brk() -> i64 {
    let addr = unsafe { argaddr(0) };
    let memory = match unsafe { user_memory() } {
        Ok(m) => m,
        Err(_) => return -1,
    };
    let size = memory.size();
    if addr == 0 {
        return size as i64;
    }
    if addr > size {
        match memory.grow(addr, PteFlags::W) {
            Ok(newsz) => newsz as i64,
            Err(_) => -1,
        }
    } else {
        memory.shrink(addr) as i64
    }
}

/// Map `len` (page-rounded) bytes of fresh memory at page-aligned `start`
/// with protection bits {R=1, W=2, X=4}. Returns the mapped size.
pub unsafe fn sys_mmap() -> i64 {
    let start = unsafe { argaddr(0) };
    let len = unsafe { argaddr(1) };
    let prot = unsafe { argint(2) };

    if len == 0 {
        return 0;
    }
    if len > MMAP_MAX_LEN {
        return -1;
    }
    if start % PGSIZE != 0 {
        return -1;
    }
    if prot & !0x7 != 0 || prot & 0x7 == 0 {
        return -1;
    }

    let mut perm = PteFlags::empty();
    if prot & 0x1 != 0 {
        perm |= PteFlags::R;
    }
    if prot & 0x2 != 0 {
        perm |= PteFlags::W;
    }
    if prot & 0x4 != 0 {
        perm |= PteFlags::X;
    }

    let aligned_len = pgroundup(len);
    let memory = match unsafe { user_memory() } {
        Ok(m) => m,
        Err(_) => return -1,
    };
    match memory.map_anonymous(start, aligned_len / PGSIZE, perm) {
        Ok(()) => aligned_len as i64,
        Err(_) => {
            crate::debug!("mmap: mapping {} pages at {:#x} failed", aligned_len / PGSIZE, start);
            -1
        }
    }
}

/// Unmap exactly the page-rounded range starting at page-aligned `start`.
pub unsafe fn sys_munmap() -> i64 {
    let start = unsafe { argaddr(0) };
    let len = unsafe { argaddr(1) };

    if start % PGSIZE != 0 {
        return -1;
    }
    let npages = pgroundup(len) / PGSIZE;
    let memory = match unsafe { user_memory() } {
        Ok(m) => m,
        Err(_) => return -1,
    };
    match memory.unmap_range(start, npages, true) {
        Ok(()) => (npages * PGSIZE) as i64,
        Err(_) => -1,
    }
}

/// Map (creating on first use) the named shared-memory segment; returns
/// the mapped address, or 0 on failure.
pub unsafe fn sys_sharedmem() -> i64 {
    let name_va = unsafe { argaddr(0) };
    let len = unsafe { argaddr(1) };

    let mut name = [0u8; MAX_SHARED_NAME + 1];
    let memory = match unsafe { user_memory() } {
        Ok(m) => m,
        Err(_) => return 0,
    };
    if memory.copy_in_str(&mut name, name_va).is_err() {
        return 0;
    }
    let nul = match name.iter().position(|&c| c == 0) {
        Some(n) => n,
        None => return 0,
    };

    match unsafe { crate::shm::map_current(&name[..nul], len) } {
        Ok(va) => va as i64,
        Err(_) => 0,
    }
}

pub unsafe fn sys_spawn() -> i64 {
    let mut path_buf = [0u8; MAXPATH];
    let path = match unsafe { argstr(0, &mut path_buf) } {
        Ok(s) => s,
        Err(_) => return -1,
    };
    let path = match unsafe { resolve_path(path.to_bytes()) } {
        Ok(p) => p,
        Err(_) => return -1,
    };
    match unsafe { exec::spawn(&path) } {
        Ok(pid) => pid as i64,
        Err(_) => -1,
    }
}

/// Pop the oldest message from the caller's mailbox. A zero-length read
/// reports readability: 0 when mail is waiting, -1 otherwise.
pub unsafe fn sys_mailread() -> i64 {
    let buf = unsafe { argaddr(0) };
    let len = unsafe { argaddr(1) }.min(MAX_MAIL_LENGTH);

    let p = unsafe { myproc() };
    if unsafe { argaddr(1) } == 0 {
        let empty = unsafe { (*p).mailbox.lock().is_empty() };
        return if empty { -1 } else { 0 };
    }

    let mut msg = [0u8; MAX_MAIL_LENGTH];
    let n = match unsafe { (*p).mailbox.lock().pop(&mut msg[..len]) } {
        Some(n) => n,
        None => return -1,
    };

    let memory = match unsafe { user_memory() } {
        Ok(m) => m,
        Err(_) => return -1,
    };
    match memory.copy_out(buf, &msg[..n]) {
        Ok(()) => n as i64,
        Err(_) => -1,
    }
}

/// Append a message to the mailbox of process `pid`. A zero-length write
/// probes: 0 when the target exists and has room, -1 otherwise.
pub unsafe fn sys_mailwrite() -> i64 {
    let pid = unsafe { argint(0) };
    let buf = unsafe { argaddr(1) };
    let len = unsafe { argaddr(2) };

    if len > MAX_MAIL_LENGTH {
        return -1;
    }
    if len == 0 {
        return match kernel().procs.with_mailbox_of(pid, |m| m.is_full()) {
            Ok(false) => 0,
            _ => -1,
        };
    }

    let mut msg = [0u8; MAX_MAIL_LENGTH];
    let memory = match unsafe { user_memory() } {
        Ok(m) => m,
        Err(_) => return -1,
    };
    if memory.copy_in(&mut msg[..len], buf).is_err() {
        return -1;
    }

    match kernel().procs.with_mailbox_of(pid, |m| m.push(&msg[..len])) {
        Ok(Ok(n)) => n as i64,
        _ => -1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{self, UBUF};

    #[test]
    fn mmap_and_munmap_roundtrip() {
        let _t = test_support::setup();
        let ctx = test_support::enter_proc();
        unsafe {
            // Length is rounded up to whole pages.
            ctx.set_args(&[0x4000_0000, 2 * PGSIZE, 0x3]);
            assert_eq!(sys_mmap(), (2 * PGSIZE) as i64);

            // The mapping is usable.
            ctx.mem().copy_out(0x4000_0000 + 100, b"mapped").unwrap();
            assert_eq!(ctx.read_user(0x4000_0000 + 100, 6), b"mapped");

            ctx.set_args(&[0x4000_0000, 2 * PGSIZE, 0]);
            assert_eq!(sys_munmap(), (2 * PGSIZE) as i64);
            // Access after unmap faults.
            assert!(ctx.mem().copy_out(0x4000_0000 + 100, b"mapped").is_err());
        }
    }

    #[test]
    fn mmap_rejects_bad_arguments() {
        let _t = test_support::setup();
        let ctx = test_support::enter_proc();
        unsafe {
            // Unaligned address.
            ctx.set_args(&[0x4000_0001, PGSIZE, 0x3]);
            assert_eq!(sys_mmap(), -1);
            // No permissions / unknown bits.
            ctx.set_args(&[0x4000_0000, PGSIZE, 0]);
            assert_eq!(sys_mmap(), -1);
            ctx.set_args(&[0x4000_0000, PGSIZE, 0x9]);
            assert_eq!(sys_mmap(), -1);
            // Zero length maps nothing.
            ctx.set_args(&[0x4000_0000, 0, 0x3]);
            assert_eq!(sys_mmap(), 0);
            // Odd lengths round up.
            ctx.set_args(&[0x4100_0000, 100, 0x3]);
            assert_eq!(sys_mmap(), PGSIZE as i64);
            ctx.set_args(&[0x4100_0000, 100, 0]);
            assert_eq!(sys_munmap(), PGSIZE as i64);
            // Unmapping a hole is an error.
            ctx.set_args(&[0x4200_0000, PGSIZE, 0]);
            assert_eq!(sys_munmap(), -1);
        }
    }

    #[test]
    fn brk_queries_and_moves_the_break() {
        let _t = test_support::setup();
        let ctx = test_support::enter_proc();
        unsafe {
            ctx.set_args(&[0]);
            let base = sys_brk();
            assert!(base >= 0);

            ctx.set_args(&[base as usize + 2 * PGSIZE]);
            assert_eq!(sys_brk(), base + 2 * PGSIZE as i64);
            ctx.mem().copy_out(base as usize + PGSIZE, b"heap").unwrap();

            // Shrinking back releases the top page.
            ctx.set_args(&[base as usize + PGSIZE]);
            assert_eq!(sys_brk(), base + PGSIZE as i64);
            assert!(ctx.mem().copy_out(base as usize + PGSIZE, b"x").is_err());
        }
    }

    #[test]
    fn priority_is_clamped_and_persisted() {
        let _t = test_support::setup();
        let ctx = test_support::enter_proc();
        unsafe {
            ctx.set_args(&[10]);
            assert_eq!(sys_setpriority(), 10);
            assert_eq!(sys_getpriority(), 10);
            ctx.set_args(&[1]);
            assert_eq!(sys_setpriority(), -1);
            assert_eq!(sys_getpriority(), 10);
        }
        drop(ctx);
    }

    #[test]
    fn gettimeofday_fills_a_timeval() {
        let _t = test_support::setup();
        let ctx = test_support::enter_proc();
        unsafe {
            ctx.set_args(&[UBUF + 0x900, 0]);
            assert_eq!(sys_gettimeofday(), 0);
            let bytes = ctx.read_user(UBUF + 0x900 + 8, 8);
            let usec = u64::from_ne_bytes([
                bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
            ]);
            assert!(usec < 1_000_000);
        }
    }

    #[test]
    fn clone_accepts_only_sigchld() {
        let _t = test_support::setup();
        let ctx = test_support::enter_proc();
        unsafe {
            ctx.set_args(&[0, 0, 0, 0, 0]);
            assert_eq!(sys_clone(), -1);
            ctx.set_args(&[SIGCHLD | 0x100, 0, 0, 0, 0]);
            assert_eq!(sys_clone(), -1);
        }
        drop(ctx);
    }

    #[test]
    fn wait4_validates_its_arguments() {
        let _t = test_support::setup();
        let ctx = test_support::enter_proc();
        unsafe {
            // Unsupported options and rusage are rejected outright.
            ctx.set_args(&[usize::MAX, 0, 2, 0]);
            assert_eq!(sys_wait4(), -1);
            ctx.set_args(&[usize::MAX, 0, 0, UBUF]);
            assert_eq!(sys_wait4(), -1);
            // No children at all: -1 even with WNOHANG.
            ctx.set_args(&[usize::MAX, 0, WNOHANG as usize, 0]);
            assert_eq!(sys_wait4(), -1);
        }
        drop(ctx);
    }

    #[test]
    fn getpid_reports_the_current_process() {
        let _t = test_support::setup();
        let ctx = test_support::enter_proc();
        unsafe {
            assert_eq!(sys_getpid(), (*ctx.proc()).pid() as i64);
            // The test process has no parent.
            assert_eq!(sys_getppid(), -1);
        }
        drop(ctx);
    }

    #[test]
    fn kill_flags_a_victim() {
        let _t = test_support::setup();
        let ctx = test_support::enter_proc();
        unsafe {
            let pid = (*ctx.proc()).pid();
            ctx.set_args(&[pid as usize]);
            assert_eq!(sys_kill(), 0);
            assert!((*ctx.proc()).killed());
            // Unknown pids fail.
            ctx.set_args(&[999_999]);
            assert_eq!(sys_kill(), -1);
        }
        drop(ctx);
    }

    #[test]
    fn sharedmem_maps_by_name() {
        let _t = test_support::setup();
        let ctx = test_support::enter_proc();
        unsafe {
            let name = ctx.put_str(UBUF, b"sc-seg");
            // Unaligned lengths are rejected with a null address.
            ctx.set_args(&[name, 100]);
            assert_eq!(sys_sharedmem(), 0);

            ctx.set_args(&[name, PGSIZE]);
            let va = sys_sharedmem();
            assert!(va > 0);
            ctx.mem().copy_out(va as usize, b"shared!").unwrap();
            assert_eq!(ctx.read_user(va as usize, 7), b"shared!");

            // Opening it again (len 0) maps a second view of the same pages.
            ctx.set_args(&[name, 0]);
            let vb = sys_sharedmem();
            assert!(vb > 0 && vb != va);
            assert_eq!(ctx.read_user(vb as usize, 7), b"shared!");
        }
        drop(ctx);
    }

    #[test]
    fn mail_flows_between_probe_write_and_read() {
        let _t = test_support::setup();
        let ctx = test_support::enter_proc();
        unsafe {
            let pid = (*ctx.proc()).pid() as usize;

            // Empty box: zero-length read probes say "nothing".
            ctx.set_args(&[UBUF + 0x100, 0]);
            assert_eq!(sys_mailread(), -1);

            // Zero-length write probes for capacity.
            ctx.set_args(&[pid, UBUF + 0x100, 0]);
            assert_eq!(sys_mailwrite(), 0);

            ctx.put_str(UBUF + 0x100, b"note to self");
            ctx.set_args(&[pid, UBUF + 0x100, 12]);
            assert_eq!(sys_mailwrite(), 12);

            ctx.set_args(&[UBUF + 0x200, 0]);
            assert_eq!(sys_mailread(), 0);
            ctx.set_args(&[UBUF + 0x200, 64]);
            assert_eq!(sys_mailread(), 12);
            assert_eq!(ctx.read_user(UBUF + 0x200, 12), b"note to self");

            // Unknown recipient.
            ctx.set_args(&[777_777, UBUF + 0x100, 3]);
            assert_eq!(sys_mailwrite(), -1);
        }
        drop(ctx);
    }
}
