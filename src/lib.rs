#![no_std]
#![feature(fn_align)]
#![feature(allocator_api)]
#![feature(alloc_error_handler)]

extern crate alloc;

pub mod abi;
pub mod buf;
pub mod console;
pub mod entry;
pub mod error;
pub mod exec;
pub mod frame;
pub mod fs;
pub mod kalloc;
pub mod kernelvec;
pub mod log;
pub mod memlayout;
pub mod param;
pub mod pipe;
pub mod plic;
pub mod printf;
pub mod proc;
pub mod riscv;
pub mod sleeplock;
pub mod spinlock;
pub mod start;
pub mod swtch;
pub mod sync;
pub mod syscall;
pub mod sysfile;
pub mod sysproc;
pub mod trampoline;
pub mod trap;
pub mod uart;
pub mod virtio_disk;
pub mod vm;
