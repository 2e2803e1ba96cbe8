//! System-call dispatch: argument marshalling from the trap frame and the
//! per-ID dispatch table. IDs follow the Linux RV64 numbering.

use cstr_core::CStr;

use crate::{
    file::RcFile,
    proc::myproc,
    sysfile, sysproc, warn,
};

pub const SYS_GETCWD: usize = 17;
pub const SYS_DUP: usize = 23;
pub const SYS_DUP3: usize = 24;
pub const SYS_MKNOD: usize = 33;
pub const SYS_MKDIRAT: usize = 34;
pub const SYS_LINK: usize = 37;
pub const SYS_UNLINK: usize = 38;
pub const SYS_CHDIR: usize = 49;
pub const SYS_OPENAT: usize = 56;
pub const SYS_CLOSE: usize = 57;
pub const SYS_PIPE2: usize = 59;
pub const SYS_GETDENTS64: usize = 61;
pub const SYS_READ: usize = 63;
pub const SYS_WRITE: usize = 64;
pub const SYS_FSTAT: usize = 80;
pub const SYS_EXIT: usize = 93;
pub const SYS_SCHED_YIELD: usize = 124;
pub const SYS_KILL: usize = 129;
pub const SYS_SETPRIORITY: usize = 140;
pub const SYS_GETPRIORITY: usize = 141;
pub const SYS_GETTIMEOFDAY: usize = 169;
pub const SYS_GETPID: usize = 172;
pub const SYS_GETPPID: usize = 173;
pub const SYS_BRK: usize = 214;
pub const SYS_MUNMAP: usize = 215;
pub const SYS_CLONE: usize = 220;
pub const SYS_EXECVE: usize = 221;
pub const SYS_MMAP: usize = 222;
pub const SYS_WAIT4: usize = 260;
pub const SYS_SHAREDMEM: usize = 282;
pub const SYS_SPAWN: usize = 400;
pub const SYS_MAILREAD: usize = 401;
pub const SYS_MAILWRITE: usize = 402;

/// Fetch the raw n'th argument register of the current syscall.
///
/// # Safety
///
/// Must run in the context of a process that entered the kernel through a
/// user trap.
unsafe fn argraw(n: usize) -> usize {
    let p = unsafe { myproc() };
    let tf = unsafe { (*(*p).data.get()).trap_frame() };
    match n {
        0 => tf.a0,
        1 => tf.a1,
        2 => tf.a2,
        3 => tf.a3,
        4 => tf.a4,
        5 => tf.a5,
        6 => tf.a6,
        _ => panic!("argraw"),
    }
}

/// The n'th argument as a 32-bit integer.
pub unsafe fn argint(n: usize) -> i32 {
    unsafe { argraw(n) as i32 }
}

/// The n'th argument as a 64-bit integer.
pub unsafe fn argi64(n: usize) -> i64 {
    unsafe { argraw(n) as i64 }
}

/// The n'th argument as a user address. Legality is checked by the copy
/// primitives when the address is used.
pub unsafe fn argaddr(n: usize) -> usize {
    unsafe { argraw(n) }
}

/// The n'th argument as a NUL-terminated user string, copied into `buf`.
pub unsafe fn argstr<'a>(n: usize, buf: &'a mut [u8]) -> Result<&'a CStr, ()> {
    let addr = unsafe { argaddr(n) };
    let p = unsafe { myproc() };
    let data = unsafe { &mut *(*p).data.get() };
    let memory = data.memory.as_mut().ok_or(())?;
    memory.copy_in_str(buf, addr)?;
    let nul = buf.iter().position(|&c| c == 0).ok_or(())?;
    CStr::from_bytes_with_nul(&buf[..=nul]).map_err(|_| ())
}

/// The n'th argument as an open file descriptor: the number and a counted
/// reference to the file.
pub unsafe fn argfd(n: usize) -> Result<(i32, RcFile), ()> {
    let fd = unsafe { argint(n) };
    let p = unsafe { myproc() };
    let data = unsafe { &*(*p).data.get() };
    let f = data.fd_get(fd).ok_or(())?;
    Ok((fd, f.clone()))
}

/// Decode and dispatch the pending system call, writing the signed return
/// value into the first return register.
///
/// # Safety
///
/// Must be called from `usertrap` with the trap frame populated.
pub unsafe fn syscall() {
    let p = unsafe { myproc() };
    let data = unsafe { &mut *(*p).data.get() };
    let id = data.trap_frame().a7;

    let ret: i64 = unsafe {
        match id {
            SYS_GETCWD => sysfile::sys_getcwd(),
            SYS_DUP => sysfile::sys_dup(),
            SYS_DUP3 => sysfile::sys_dup3(),
            SYS_MKNOD => sysfile::sys_mknod(),
            SYS_MKDIRAT => sysfile::sys_mkdirat(),
            SYS_LINK => sysfile::sys_link(),
            SYS_UNLINK => sysfile::sys_unlink(),
            SYS_CHDIR => sysfile::sys_chdir(),
            SYS_OPENAT => sysfile::sys_openat(),
            SYS_CLOSE => sysfile::sys_close(),
            SYS_PIPE2 => sysfile::sys_pipe2(),
            SYS_GETDENTS64 => sysfile::sys_getdents64(),
            SYS_READ => sysfile::sys_read(),
            SYS_WRITE => sysfile::sys_write(),
            SYS_FSTAT => sysfile::sys_fstat(),
            SYS_EXIT => sysproc::sys_exit(),
            SYS_SCHED_YIELD => sysproc::sys_sched_yield(),
            SYS_KILL => sysproc::sys_kill(),
            SYS_SETPRIORITY => sysproc::sys_setpriority(),
            SYS_GETPRIORITY => sysproc::sys_getpriority(),
            SYS_GETTIMEOFDAY => sysproc::sys_gettimeofday(),
            SYS_GETPID => sysproc::sys_getpid(),
            SYS_GETPPID => sysproc::sys_getppid(),
            SYS_BRK => sysproc::sys_brk(),
            SYS_MUNMAP => sysproc::sys_munmap(),
            SYS_CLONE => sysproc::sys_clone(),
            SYS_EXECVE => sysproc::sys_execve(),
            SYS_MMAP => sysproc::sys_mmap(),
            SYS_WAIT4 => sysproc::sys_wait4(),
            SYS_SHAREDMEM => sysproc::sys_sharedmem(),
            SYS_SPAWN => sysproc::sys_spawn(),
            SYS_MAILREAD => sysproc::sys_mailread(),
            SYS_MAILWRITE => sysproc::sys_mailwrite(),
            _ => {
                warn!("unknown syscall {}", id);
                -1
            }
        }
    };

    let data = unsafe { &mut *(*p).data.get() };
    data.trap_frame_mut().a0 = ret as usize;
}
