/// maximum number of CPUs
pub const NCPU: usize = 8;
/// maximum number of processes
pub const NPROC: usize = 64;
/// max # of blocks any FS op writes
pub const MAXOPBLOCKS: usize = 10;
/// max data blocks in on-disk log
pub const LOGSIZE: usize = MAXOPBLOCKS * 3;
/// size of disk block cache
pub const NBUF: usize = MAXOPBLOCKS * 3;
/// size of in-core inode cache
pub const NINODE: usize = 50;
/// device number of file system root disk
pub const ROOTDEV: u32 = 1;
/// max length of a path name
pub const MAXPATH: usize = 128;
/// max number of device drivers
pub const NDEV: usize = 10;
/// open files per system
pub const NFILE: usize = 100;
/// open files per process
pub const NOFILE: usize = 16;
/// kernel stack size, in pages
pub const NKSTACK_PAGES: usize = 1;
/// max exec arguments
pub const MAXARG: usize = 32;
/// user stack size, in pages
pub const USERSTACK: usize = 1;
/// pipe buffer size, in bytes
pub const PIPESIZE: usize = 512;
