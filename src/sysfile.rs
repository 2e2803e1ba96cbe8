//! File-system system calls. Mostly argument checking, since we don't
//! trust user code, and calls into the file and inode layers.

use core::cell::UnsafeCell;

use bitflags::bitflags;

use crate::{
    file::{FileType, RcFile},
    fs::{self, InodeType, PathBuf},
    info,
    kernel::kernel,
    param::{MAXPATH, NDEV},
    pipe::AllocatedPipe,
    proc::{myproc, ProcData},
    stat::Dirent64Head,
    syscall::{argaddr, argfd, argint, argstr},
    vm::UserMemory,
    warn,
};

use zerocopy::AsBytes;

pub const AT_FDCWD: i32 = -100;

bitflags! {
    /// openat flags, asm-generic values.
    pub struct OpenFlags: i32 {
        const O_WRONLY = 0o1;
        const O_RDWR = 0o2;
        const O_CREAT = 0o100;
        const O_TRUNC = 0o1000;
        const O_APPEND = 0o2000;
        const O_DIRECTORY = 0o40000;
    }
}

unsafe fn proc_data<'a>() -> &'a mut ProcData {
    let p = unsafe { myproc() };
    unsafe { &mut *(*p).data.get() }
}

unsafe fn user_memory<'a>() -> Result<&'a mut UserMemory, ()> {
    unsafe { proc_data() }.memory.as_mut().ok_or(())
}

/// The directory a relative path is resolved against: the cwd for
/// AT_FDCWD, otherwise the open directory behind `dirfd`.
unsafe fn dir_base(dirfd: i32) -> Result<Option<PathBuf>, ()> {
    let data = unsafe { proc_data() };
    if dirfd == AT_FDCWD {
        return match &data.cwd {
            Some(cwd) => Ok(Some(PathBuf::from_absolute(cwd.path())?)),
            None => Ok(None),
        };
    }
    let f = data.fd_get(dirfd).ok_or(())?;
    match f.typ() {
        FileType::Inode { ip, .. } if ip.is_dir() => {
            Ok(Some(PathBuf::from_absolute(ip.path())?))
        }
        _ => Err(()),
    }
}

/// Resolve a user path argument against `dirfd` into a canonical path.
unsafe fn resolve_at(dirfd: i32, path: &[u8]) -> Result<PathBuf, ()> {
    let stripped = fs::strip_dots(path);
    if stripped.first() == Some(&b'/') {
        return PathBuf::from_absolute(stripped);
    }
    let base = unsafe { dir_base(dirfd) }?;
    fs::resolve(base.as_ref(), stripped)
}

pub unsafe fn sys_getcwd() -> i64 {
    let buf = unsafe { argaddr(0) };
    let size = unsafe { argaddr(1) };
    let data = unsafe { proc_data() };

    let mut path = [0u8; MAXPATH + 1];
    let len = match &data.cwd {
        Some(cwd) => {
            let bytes = cwd.path();
            path[..bytes.len()].copy_from_slice(bytes);
            bytes.len()
        }
        None => {
            path[0] = b'/';
            1
        }
    };
    if len + 1 > size {
        return 0;
    }
    let memory = match unsafe { user_memory() } {
        Ok(m) => m,
        Err(_) => return 0,
    };
    if memory.copy_out(buf, &path[..len + 1]).is_err() {
        return 0;
    }
    buf as i64
}

pub unsafe fn sys_dup() -> i64 {
    let (_, f) = match unsafe { argfd(0) } {
        Ok(v) => v,
        Err(_) => {
            info!("dup: old fd is not valid");
            return -1;
        }
    };
    match unsafe { proc_data() }.fd_alloc(f) {
        Ok(fd) => fd as i64,
        Err(_) => {
            info!("dup: cannot allocate new fd");
            -1
        }
    }
}

pub unsafe fn sys_dup3() -> i64 {
    let newfd = unsafe { argint(1) };
    let flags = unsafe { argint(2) };
    if flags != 0 {
        info!("dup3: flags must be 0");
        return -1;
    }
    let (oldfd, f) = match unsafe { argfd(0) } {
        Ok(v) => v,
        Err(_) => return -1,
    };
    if newfd == oldfd {
        return newfd as i64;
    }
    match unsafe { proc_data() }.fd_alloc_at(f, newfd) {
        Ok(fd) => fd as i64,
        Err(_) => -1,
    }
}

pub unsafe fn sys_mknod() -> i64 {
    let mut buf = [0u8; MAXPATH];
    let path = match unsafe { argstr(0, &mut buf) } {
        Ok(s) => s,
        Err(_) => return -1,
    };
    let major = unsafe { argint(1) } as u16;
    let minor = unsafe { argint(2) } as u16;

    let path = match unsafe { resolve_at(AT_FDCWD, path.to_bytes()) } {
        Ok(p) => p,
        Err(_) => return -1,
    };
    match kernel()
        .itable
        .create(&path, InodeType::Device { major, minor })
    {
        Ok(_ip) => 0,
        Err(_) => -1,
    }
}

/// mode is accepted and ignored.
pub unsafe fn sys_mkdirat() -> i64 {
    let dirfd = unsafe { argint(0) };
    let mut buf = [0u8; MAXPATH];
    let path = match unsafe { argstr(1, &mut buf) } {
        Ok(s) => s,
        Err(_) => return -2,
    };

    let path = match unsafe { resolve_at(dirfd, path.to_bytes()) } {
        Ok(p) => p,
        Err(_) => return -1,
    };
    match kernel().itable.create(&path, InodeType::Dir) {
        Ok(_ip) => 0,
        Err(_) => -1,
    }
}

pub unsafe fn sys_chdir() -> i64 {
    let mut buf = [0u8; MAXPATH];
    let path = match unsafe { argstr(0, &mut buf) } {
        Ok(s) => s,
        Err(_) => return -2,
    };
    let path = match unsafe { resolve_at(AT_FDCWD, path.to_bytes()) } {
        Ok(p) => p,
        Err(_) => return -1,
    };
    let ip = match kernel().itable.namei(&path) {
        Ok(ip) => ip,
        Err(_) => return -1,
    };
    if !ip.is_dir() {
        return -1;
    }
    unsafe { proc_data() }.cwd = Some(ip);
    0
}

/// Create the path new as a link to the same inode as old.
pub unsafe fn sys_link() -> i64 {
    // Hard links need on-disk link counts; the inode service does not
    // provide them.
    warn!("link: not supported");
    -1
}

pub unsafe fn sys_unlink() -> i64 {
    warn!("unlink: not supported");
    -1
}

/// Open (optionally creating) the file at `path` relative to `dirfd`.
pub unsafe fn sys_openat() -> i64 {
    let dirfd = unsafe { argint(0) };
    let mut buf = [0u8; MAXPATH];
    let path = match unsafe { argstr(1, &mut buf) } {
        Ok(s) => s,
        Err(_) => return -1,
    };
    let flags = OpenFlags::from_bits_truncate(unsafe { argint(2) });
    // mode (argument 3) is accepted and ignored.

    let path = match unsafe { resolve_at(dirfd, path.to_bytes()) } {
        Ok(p) => p,
        Err(_) => return -1,
    };

    let ip = if flags.contains(OpenFlags::O_CREAT) {
        let typ = if flags.contains(OpenFlags::O_DIRECTORY) {
            InodeType::Dir
        } else {
            InodeType::File
        };
        match kernel().itable.create(&path, typ) {
            Ok(ip) => ip,
            Err(_) => {
                info!("openat: cannot create inode");
                return -1;
            }
        }
    } else {
        match kernel().itable.namei(&path) {
            Ok(ip) => ip,
            Err(_) => {
                info!("openat: cannot find inode");
                return -2;
            }
        }
    };

    if flags.contains(OpenFlags::O_DIRECTORY) && !ip.is_dir() {
        info!("openat: O_DIRECTORY on a non-directory");
        return -20; // -ENOTDIR
    }

    let readable = !flags.contains(OpenFlags::O_WRONLY);
    let writable = flags.intersects(OpenFlags::O_WRONLY | OpenFlags::O_RDWR);

    let typ = match ip.typ() {
        InodeType::Device { major, .. } => {
            if major as usize >= NDEV {
                return -1;
            }
            FileType::Device { ip, major }
        }
        _ => {
            if flags.contains(OpenFlags::O_TRUNC) && ip.typ() == InodeType::File {
                ip.data.lock().trunc();
            }
            let off = if flags.contains(OpenFlags::O_APPEND) && ip.typ() == InodeType::File {
                ip.data.lock().size()
            } else {
                0
            };
            FileType::Inode {
                ip,
                off: UnsafeCell::new(off),
            }
        }
    };

    let f = match kernel().ftable.alloc(typ, readable, writable) {
        Some(f) => f,
        None => return -1,
    };
    match unsafe { proc_data() }.fd_alloc(f) {
        Ok(fd) => fd as i64,
        Err(_) => -1,
    }
}

pub unsafe fn sys_close() -> i64 {
    let fd = unsafe { argint(0) };
    let data = unsafe { proc_data() };
    if fd < 0 || fd as usize >= data.files.len() {
        info!("close: invalid fd {}", fd);
        return -1;
    }
    match data.files[fd as usize].take() {
        // Dropping the reference closes the file.
        Some(_f) => 0,
        None => {
            info!("close: fd {} is not open", fd);
            -1
        }
    }
}

pub unsafe fn sys_pipe2() -> i64 {
    let fdarray = unsafe { argaddr(0) };
    let flags = unsafe { argint(1) };
    if flags != 0 {
        info!("pipe2: flags must be 0");
        return -1;
    }

    let (reader, writer) = match AllocatedPipe::alloc() {
        Ok(ends) => ends,
        Err(_) => return -1,
    };

    let data = unsafe { proc_data() };
    let fd0 = match data.fd_alloc(reader) {
        Ok(fd) => fd,
        Err(_) => return -1,
    };
    let fd1 = match data.fd_alloc(writer) {
        Ok(fd) => fd,
        Err(_) => {
            data.files[fd0 as usize] = None;
            return -1;
        }
    };

    let mut out = [0u8; 8];
    out[..4].copy_from_slice(&fd0.to_ne_bytes());
    out[4..].copy_from_slice(&fd1.to_ne_bytes());
    let memory = match unsafe { user_memory() } {
        Ok(m) => m,
        Err(_) => return -1,
    };
    if memory.copy_out(fdarray, &out).is_err() {
        let data = unsafe { proc_data() };
        data.files[fd0 as usize] = None;
        data.files[fd1 as usize] = None;
        return -1;
    }
    0
}

pub unsafe fn sys_getdents64() -> i64 {
    let (_, f) = match unsafe { argfd(0) } {
        Ok(v) => v,
        Err(_) => return -1,
    };
    let dirp = unsafe { argaddr(1) };
    let len = unsafe { argaddr(2) };

    let (ip, off) = match f.typ() {
        FileType::Inode { ip, off } => (ip, off),
        _ => return -1,
    };
    if !ip.is_dir() {
        return -1;
    }

    // The offset, interpreted as the index of the next child, is guarded by
    // the inode lock like any other file offset.
    let _data = ip.data.lock();
    let mut index = unsafe { *off.get() };
    let mut buf = [0u8; 512];
    let mut used = 0;
    let mut truncated = false;

    while let Some(entry) = kernel().itable.nth_child(ip.path(), index) {
        let reclen = Dirent64Head::reclen(entry.name.len());
        if used + reclen > len.min(buf.len()) {
            truncated = true;
            break;
        }
        let head = Dirent64Head {
            d_ino: entry.inum as u64,
            d_off: (index + 1) as i64,
            d_reclen: reclen as u16,
            d_type: entry.d_type,
        };
        match head.emit(&entry.name, &mut buf[used..]) {
            Some(n) => used += n,
            None => {
                truncated = true;
                break;
            }
        }
        index += 1;
    }

    // A zero return means end of directory; a buffer that cannot hold even
    // the next record must be reported as an error instead.
    if used == 0 && truncated {
        return -1;
    }

    let memory = match unsafe { user_memory() } {
        Ok(m) => m,
        Err(_) => return -1,
    };
    if memory.copy_out(dirp, &buf[..used]).is_err() {
        return -1;
    }
    unsafe { *off.get() = index };
    used as i64
}

pub unsafe fn sys_read() -> i64 {
    let (_, f) = match unsafe { argfd(0) } {
        Ok(v) => v,
        Err(_) => return -1,
    };
    let addr = unsafe { argaddr(1) };
    let n = unsafe { argaddr(2) };
    let memory = match unsafe { user_memory() } {
        Ok(m) => m,
        Err(_) => return -1,
    };
    match f.read(memory, addr, n) {
        Ok(count) => count as i64,
        Err(_) => -1,
    }
}

pub unsafe fn sys_write() -> i64 {
    let (_, f) = match unsafe { argfd(0) } {
        Ok(v) => v,
        Err(_) => return -1,
    };
    let addr = unsafe { argaddr(1) };
    let n = unsafe { argaddr(2) };
    let memory = match unsafe { user_memory() } {
        Ok(m) => m,
        Err(_) => return -1,
    };
    match f.write(memory, addr, n) {
        Ok(count) => count as i64,
        Err(_) => -1,
    }
}

pub unsafe fn sys_fstat() -> i64 {
    let (fd, f) = match unsafe { argfd(0) } {
        Ok(v) => v,
        Err(_) => {
            info!("fstat: invalid fd");
            return -1;
        }
    };
    let addr = unsafe { argaddr(1) };

    let st = match f.stat() {
        Ok(st) => st,
        Err(_) => {
            info!("fstat: fd {} is not a file, directory, or device", fd);
            return -1;
        }
    };
    let memory = match unsafe { user_memory() } {
        Ok(m) => m,
        Err(_) => return -1,
    };
    if memory.copy_out(addr, st.as_bytes()).is_err() {
        return -1;
    }
    0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{self, UBUF};

    const O_RDONLY: usize = 0;
    const O_WRONLY: usize = 0o1;
    const O_CREAT: usize = 0o100;
    const O_DIRECTORY: usize = 0o40000;
    const O_TRUNC: usize = 0o1000;
    const O_APPEND: usize = 0o2000;

    fn at_fdcwd() -> usize {
        AT_FDCWD as usize
    }

    unsafe fn openat(ctx: &test_support::ProcContext, path: &[u8], flags: usize) -> i64 {
        let p = ctx.put_str(UBUF, path);
        ctx.set_args(&[at_fdcwd(), p, flags, 0]);
        sys_openat()
    }

    #[test]
    fn openat_roundtrip_reports_size_zero() {
        let _t = test_support::setup();
        let ctx = test_support::enter_proc();
        unsafe {
            let fd = openat(&ctx, b"/sc-roundtrip", O_CREAT | O_WRONLY);
            assert!(fd >= 0);
            ctx.set_args(&[fd as usize]);
            assert_eq!(sys_close(), 0);

            let fd = openat(&ctx, b"/sc-roundtrip", O_RDONLY);
            assert!(fd >= 0);
            ctx.set_args(&[fd as usize, UBUF + 0x800]);
            assert_eq!(sys_fstat(), 0);
            // st_size sits at byte offset 48 of the kstat record.
            let size = ctx.read_user(UBUF + 0x800 + 48, 8);
            assert_eq!(size, 0i64.to_ne_bytes());
        }
    }

    #[test]
    fn openat_error_paths() {
        let _t = test_support::setup();
        let ctx = test_support::enter_proc();
        unsafe {
            // Not-found is a distinct error.
            assert_eq!(openat(&ctx, b"notthere", O_RDONLY), -2);

            // A directory opens fine without O_DIRECTORY...
            let d = openat(&ctx, b"/sc-bin", O_CREAT | O_DIRECTORY);
            assert!(d >= 0);
            assert!(openat(&ctx, b"/sc-bin", O_RDONLY) >= 0);

            // ...but O_DIRECTORY on a regular file is ENOTDIR.
            let f = openat(&ctx, b"/sc-notdir", O_CREAT | O_WRONLY);
            assert!(f >= 0);
            assert_eq!(openat(&ctx, b"/sc-notdir", O_DIRECTORY), -20);
        }
    }

    #[test]
    fn relative_paths_resolve_against_dirfd_and_cwd() {
        let _t = test_support::setup();
        let ctx = test_support::enter_proc();
        unsafe {
            let d = openat(&ctx, b"/sc-rel", O_CREAT | O_DIRECTORY);
            assert!(d >= 0);
            let f = openat(&ctx, b"/sc-rel/inner", O_CREAT | O_WRONLY);
            assert!(f >= 0);

            // dirfd-relative lookup.
            let p = ctx.put_str(UBUF, b"inner");
            ctx.set_args(&[d as usize, p, O_RDONLY, 0]);
            assert!(sys_openat() >= 0);

            // ./-prefixed paths are stripped before lookup.
            let p = ctx.put_str(UBUF, b"./inner");
            ctx.set_args(&[d as usize, p, O_RDONLY, 0]);
            assert!(sys_openat() >= 0);

            // chdir moves the cwd; a bare name now resolves under it.
            let p = ctx.put_str(UBUF, b"/sc-rel");
            ctx.set_args(&[p]);
            assert_eq!(sys_chdir(), 0);
            let p = ctx.put_str(UBUF, b"inner");
            ctx.set_args(&[at_fdcwd(), p, O_RDONLY, 0]);
            assert!(sys_openat() >= 0);

            // getcwd reports the new directory (and its NUL).
            ctx.set_args(&[UBUF + 0x800, 64]);
            assert_eq!(sys_getcwd(), (UBUF + 0x800) as i64);
            assert_eq!(ctx.read_user(UBUF + 0x800, 8), b"/sc-rel\0");

            // A too-small buffer yields a null return.
            ctx.set_args(&[UBUF + 0x800, 4]);
            assert_eq!(sys_getcwd(), 0);
        }
    }

    #[test]
    fn append_and_trunc_position_the_offset() {
        let _t = test_support::setup();
        let ctx = test_support::enter_proc();
        unsafe {
            let fd = openat(&ctx, b"/sc-app", O_CREAT | O_WRONLY);
            ctx.put_str(UBUF + 0x100, b"12345678");
            ctx.set_args(&[fd as usize, UBUF + 0x100, 8]);
            assert_eq!(sys_write(), 8);
            ctx.set_args(&[fd as usize]);
            sys_close();

            // O_APPEND starts at the current size.
            let fd = openat(&ctx, b"/sc-app", O_WRONLY | O_APPEND);
            ctx.set_args(&[fd as usize, UBUF + 0x100, 4]);
            assert_eq!(sys_write(), 4);
            ctx.set_args(&[fd as usize, UBUF + 0x800]);
            assert_eq!(sys_fstat(), 0);
            assert_eq!(ctx.read_user(UBUF + 0x800 + 48, 8), 12i64.to_ne_bytes());
            ctx.set_args(&[fd as usize]);
            sys_close();

            // O_TRUNC resets it to zero length.
            let fd = openat(&ctx, b"/sc-app", O_WRONLY | O_TRUNC);
            ctx.set_args(&[fd as usize, UBUF + 0x800]);
            assert_eq!(sys_fstat(), 0);
            assert_eq!(ctx.read_user(UBUF + 0x800 + 48, 8), 0i64.to_ne_bytes());
        }
    }

    #[test]
    fn dup_and_dup3_duplicate_descriptors() {
        let _t = test_support::setup();
        let ctx = test_support::enter_proc();
        unsafe {
            let fd = openat(&ctx, b"/sc-dup", O_CREAT | O_WRONLY);
            assert!(fd >= 0);

            ctx.set_args(&[fd as usize]);
            let dup = sys_dup();
            assert!(dup >= 0 && dup != fd);

            // dup3 with flags is rejected; same-fd dup3 is the identity.
            ctx.set_args(&[fd as usize, 9, 1]);
            assert_eq!(sys_dup3(), -1);
            ctx.set_args(&[fd as usize, fd as usize, 0]);
            assert_eq!(sys_dup3(), fd);
            ctx.set_args(&[fd as usize, 9, 0]);
            assert_eq!(sys_dup3(), 9);

            // Bad descriptors are rejected.
            ctx.set_args(&[42]);
            assert_eq!(sys_dup(), -1);
            ctx.set_args(&[42]);
            assert_eq!(sys_close(), -1);
        }
    }

    #[test]
    fn pipe2_connects_two_descriptors() {
        let _t = test_support::setup();
        let ctx = test_support::enter_proc();
        unsafe {
            // Nonzero flags are rejected.
            ctx.set_args(&[UBUF + 0x700, 1]);
            assert_eq!(sys_pipe2(), -1);

            ctx.set_args(&[UBUF + 0x700, 0]);
            assert_eq!(sys_pipe2(), 0);
            let fds = ctx.read_user(UBUF + 0x700, 8);
            let rfd = i32::from_ne_bytes([fds[0], fds[1], fds[2], fds[3]]);
            let wfd = i32::from_ne_bytes([fds[4], fds[5], fds[6], fds[7]]);

            ctx.put_str(UBUF + 0x100, b"ping");
            ctx.set_args(&[wfd as usize, UBUF + 0x100, 4]);
            assert_eq!(sys_write(), 4);
            ctx.set_args(&[rfd as usize, UBUF + 0x200, 4]);
            assert_eq!(sys_read(), 4);
            assert_eq!(ctx.read_user(UBUF + 0x200, 4), b"ping");

            // Wrong directions are permission errors.
            ctx.set_args(&[rfd as usize, UBUF + 0x100, 4]);
            assert_eq!(sys_write(), -1);
            ctx.set_args(&[wfd as usize, UBUF + 0x200, 4]);
            assert_eq!(sys_read(), -1);

            // Close the writer: EOF after the buffer drains.
            ctx.set_args(&[wfd as usize]);
            assert_eq!(sys_close(), 0);
            ctx.set_args(&[rfd as usize, UBUF + 0x200, 4]);
            assert_eq!(sys_read(), 0);
        }
    }

    #[test]
    fn getdents64_lists_a_directory() {
        let _t = test_support::setup();
        let ctx = test_support::enter_proc();
        unsafe {
            let d = openat(&ctx, b"/sc-ls", O_CREAT | O_DIRECTORY);
            assert!(d >= 0);
            let f = openat(&ctx, b"/sc-ls/only", O_CREAT | O_WRONLY);
            assert!(f >= 0);

            // A buffer too small for the next record is an error, not end
            // of directory, and does not consume the entry.
            ctx.set_args(&[d as usize, UBUF + 0x800, 8]);
            assert_eq!(sys_getdents64(), -1);

            ctx.set_args(&[d as usize, UBUF + 0x800, 256]);
            let n = sys_getdents64();
            assert!(n > 0);
            let rec = ctx.read_user(UBUF + 0x800, n as usize);
            // d_reclen covers the head, the name, its NUL and padding.
            let reclen = u16::from_ne_bytes([rec[16], rec[17]]) as usize;
            assert_eq!(reclen, n as usize);
            assert_eq!(&rec[19..23], b"only");

            // The offset advanced past the single entry.
            ctx.set_args(&[d as usize, UBUF + 0x800, 256]);
            assert_eq!(sys_getdents64(), 0);

            // getdents on a regular file fails.
            ctx.set_args(&[f as usize, UBUF + 0x800, 256]);
            assert_eq!(sys_getdents64(), -1);
        }
    }

    #[test]
    fn mknod_registers_a_device_inode() {
        let _t = test_support::setup();
        let ctx = test_support::enter_proc();
        crate::console::init();
        unsafe {
            let p = ctx.put_str(UBUF, b"/sc-console");
            ctx.set_args(&[p, crate::param::CONSOLE_MAJOR, 0]);
            assert_eq!(sys_mknod(), 0);

            let fd = openat(&ctx, b"/sc-console", O_WRONLY);
            assert!(fd >= 0);
            ctx.put_str(UBUF + 0x100, b"hi");
            ctx.set_args(&[fd as usize, UBUF + 0x100, 2]);
            assert_eq!(sys_write(), 2);
        }
    }

    #[test]
    fn link_and_unlink_are_stubbed() {
        let _t = test_support::setup();
        let ctx = test_support::enter_proc();
        unsafe {
            let p = ctx.put_str(UBUF, b"/sc-a");
            let q = ctx.put_str(UBUF + 0x80, b"/sc-b");
            ctx.set_args(&[p, q]);
            assert_eq!(sys_link(), -1);
            ctx.set_args(&[p]);
            assert_eq!(sys_unlink(), -1);
        }
        drop(ctx);
    }
}
