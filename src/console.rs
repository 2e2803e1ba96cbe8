//! Console device, reachable both as the kernel log sink and as the
//! character device behind major number 1 (`/dev/console` once mknod'd).
//! Output goes through the platform console; input requires the UART
//! receive path, which this kernel delegates to the firmware console and
//! does not buffer, so reads report end-of-file.

use crate::{
    arch::{Arch, TargetArch},
    file::Devsw,
    kernel::kernel,
    param::CONSOLE_MAJOR,
    vm::UserMemory,
};

/// Hook the console into the device-handler table.
pub fn init() {
    let mut devsw = kernel().devsw.lock();
    devsw[CONSOLE_MAJOR] = Devsw {
        read: Some(console_read),
        write: Some(console_write),
    };
}

fn console_write(mem: &mut UserMemory, addr: usize, n: usize) -> Result<usize, ()> {
    let mut buf = [0u8; 128];
    let mut done = 0;
    while done < n {
        let chunk = (n - done).min(buf.len());
        mem.copy_in(&mut buf[..chunk], addr + done)?;
        for &c in &buf[..chunk] {
            TargetArch::console_putc(c);
        }
        done += chunk;
    }
    Ok(n)
}

fn console_read(_mem: &mut UserMemory, _addr: usize, _n: usize) -> Result<usize, ()> {
    Ok(0)
}

/// UART interrupt: nothing buffered kernel-side.
pub fn intr() {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file::FileType;
    use crate::fs::{InodeType, PathBuf};
    use crate::test_support;
    use crate::vm::PteFlags;

    #[test]
    fn console_registers_and_writes() {
        let _t = test_support::setup();
        init();
        assert!(kernel().devsw.lock()[CONSOLE_MAJOR].write.is_some());

        let tf = kernel().kmem.lock().alloc().unwrap();
        let mut mem = UserMemory::new(tf.as_ptr() as usize, None).unwrap();
        mem.map_anonymous(0x3000_0000, 1, PteFlags::R | PteFlags::W)
            .unwrap();
        mem.copy_out(0x3000_0000, b"hello console\n").unwrap();

        let ip = kernel()
            .itable
            .create(
                &PathBuf::from_absolute(b"/console-dev").unwrap(),
                InodeType::Device {
                    major: CONSOLE_MAJOR as u16,
                    minor: 0,
                },
            )
            .unwrap();
        let f = kernel()
            .ftable
            .alloc(
                FileType::Device {
                    ip,
                    major: CONSOLE_MAJOR as u16,
                },
                true,
                true,
            )
            .unwrap();

        assert_eq!(f.write(&mut mem, 0x3000_0000, 14).unwrap(), 14);
        // No input service: reads are EOF.
        assert_eq!(f.read(&mut mem, 0x3000_0000, 8).unwrap(), 0);

        drop(f);
        drop(mem);
        kernel().kmem.lock().free(tf);
    }

    #[test]
    fn unregistered_major_is_rejected() {
        let _t = test_support::setup();
        let tf = kernel().kmem.lock().alloc().unwrap();
        let mut mem = UserMemory::new(tf.as_ptr() as usize, None).unwrap();

        let ip = kernel()
            .itable
            .create(
                &PathBuf::from_absolute(b"/bogus-dev").unwrap(),
                InodeType::Device { major: 9, minor: 0 },
            )
            .unwrap();
        let f = kernel()
            .ftable
            .alloc(FileType::Device { ip, major: 9 }, true, true)
            .unwrap();
        assert!(f.write(&mut mem, 0x3000_0000, 1).is_err());

        drop(f);
        drop(mem);
        kernel().kmem.lock().free(tf);
    }
}
