/// Maximum number of processes.
pub const NPROC: usize = 64;

/// Maximum number of CPUs.
pub const NCPU: usize = 8;

/// Open files per process.
pub const FD_MAX: usize = 16;

/// Open files per system.
pub const NFILE: usize = 100;

/// Maximum number of active i-nodes.
pub const NINODE: usize = 50;

/// Maximum major device number.
pub const NDEV: usize = 11;

/// Major device number of the console.
pub const CONSOLE_MAJOR: usize = 1;

/// Max exec arguments.
pub const MAXARG: usize = 32;

/// Block size of the backing store.
pub const BSIZE: usize = 512;

/// Max # of blocks any FS op writes.
pub const MAXOPBLOCKS: usize = 10;

/// Maximum file path name.
pub const MAXPATH: usize = 128;

/// Maximum length of a single path component.
pub const DIRSIZ: usize = 255;

/// Maximum length of process name.
pub const MAXPROCNAME: usize = 16;

/// Data pages per inode; bounds the size of a regular file.
pub const NDIRECT: usize = 32;

/// Priority assigned to freshly allocated processes. Priorities are >= 2;
/// higher values are favored by the scheduler.
pub const INIT_PRIORITY: i64 = 16;

/// Messages a mailbox can hold.
pub const MAX_MAIL_IN_BOX: usize = 16;

/// Longest mail message, in bytes.
pub const MAX_MAIL_LENGTH: usize = 256;

/// Named shared-memory segments in the system.
pub const NSHM: usize = 8;

/// Longest shared-memory segment name.
pub const MAX_SHARED_NAME: usize = 16;

/// Pages per shared-memory segment.
pub const MAX_SHARED_PAGES: usize = 16;

/// Shared-memory segments a single process may have mapped.
pub const MAX_PROC_SHM: usize = 4;
