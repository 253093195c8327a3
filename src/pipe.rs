use alloc::sync::Arc;

use crate::error::KernelError;
use crate::file::{FILE_TABLE, File, FileType};
use crate::param::PIPESIZE;
use crate::proc::{self, CPU_POOL, Channel};
use crate::spinlock::{SpinLock, SpinLockGuard};
use crate::syscall::SyscallError;
use crate::vm::VA;

/// Inner state of a pipe, protected by one spin-lock shared by both ends.
#[derive(Debug)]
struct PipeInner {
    data: [u8; PIPESIZE],
    /// Total bytes read so far; `num_write - num_read` is the number of bytes buffered.
    num_read: usize,
    /// Total bytes written so far.
    num_write: usize,
    read_open: bool,
    write_open: bool,
}

/// A unidirectional byte pipe shared between a read end and a write end. Both ends hold an `Arc`
/// so the pipe is freed once both file descriptors are closed.
#[derive(Debug)]
pub struct Pipe {
    inner: SpinLock<PipeInner>,
}

impl PartialEq for Pipe {
    fn eq(&self, other: &Self) -> bool {
        core::ptr::eq(self, other)
    }
}

impl Eq for Pipe {}

impl Pipe {
    /// Allocates a pipe plus the two file descriptors for its ends. On any failure, everything
    /// allocated so far is torn down and no resources leak.
    pub fn alloc() -> Result<(File, File), KernelError> {
        let mut read_file = File::alloc()?;

        let mut write_file = match File::alloc() {
            Ok(file) => file,
            Err(_) => {
                read_file.close();
                return Err(KernelError::Fs);
            }
        };

        let pipe = match Arc::try_new(Pipe {
            inner: SpinLock::new(
                PipeInner {
                    data: [0; PIPESIZE],
                    num_read: 0,
                    num_write: 0,
                    read_open: true,
                    write_open: true,
                },
                "pipe",
            ),
        }) {
            Ok(pipe) => pipe,
            Err(_) => {
                read_file.close();
                write_file.close();
                return Err(KernelError::AllocError);
            }
        };

        {
            let mut inner = FILE_TABLE.inner[read_file.id].lock();
            inner.readable = true;
            inner.writeable = false;
            inner.r#type = FileType::Pipe {
                pipe: Arc::clone(&pipe),
            };
        }

        {
            let mut inner = FILE_TABLE.inner[write_file.id].lock();
            inner.readable = false;
            inner.writeable = true;
            inner.r#type = FileType::Pipe { pipe };
        }

        Ok((read_file, write_file))
    }

    /// The `Arc`'s address, stable for the lifetime of this pipe, used as the sleep channel's
    /// identity. Distinct from the address of either file descriptor, which may be reused once
    /// closed.
    fn id(&self) -> usize {
        self as *const Pipe as usize
    }

    /// Closes one end of the pipe, waking the other side so it notices. Called from
    /// [`File::close`] once the last reference to that end's file goes away.
    pub fn close(&self, writeable: bool) {
        let mut inner = self.inner.lock();

        if writeable {
            inner.write_open = false;
            proc::wakeup(Channel::PipeRead(self.id()));
        } else {
            inner.read_open = false;
            proc::wakeup(Channel::PipeWrite(self.id()));
        }
    }

    /// Writes `n` bytes from the user address `addr` into the pipe, blocking while the buffer is
    /// full. Fails once the read end has closed or the writer is killed.
    pub fn write(&self, addr: VA, n: usize) -> Result<usize, SyscallError> {
        let mut inner = self.inner.lock();

        let mut i = 0;
        while i < n {
            let proc = CPU_POOL.current_proc().ok_or(SyscallError::Write)?;

            if !inner.read_open || proc.is_killed() {
                return Err(SyscallError::Write);
            }

            if inner.num_write == inner.num_read + PIPESIZE {
                proc::wakeup(Channel::PipeRead(self.id()));
                inner = proc::sleep(Channel::PipeWrite(self.id()), inner);
                continue;
            }

            let mut byte = [0u8];
            if proc::copy_in_user(&mut byte, addr + i).is_err() {
                break;
            }

            let index = inner.num_write % PIPESIZE;
            inner.data[index] = byte[0];
            inner.num_write += 1;
            i += 1;
        }

        proc::wakeup(Channel::PipeRead(self.id()));

        Ok(i)
    }

    /// Reads up to `n` bytes from the pipe into the user address `addr`, blocking until at least
    /// one byte is available or the write end has closed with nothing buffered.
    pub fn read(&self, addr: VA, n: usize) -> Result<usize, SyscallError> {
        let mut inner: SpinLockGuard<'_, PipeInner> = self.inner.lock();

        loop {
            let proc = CPU_POOL.current_proc().ok_or(SyscallError::Read)?;

            if proc.is_killed() {
                return Err(SyscallError::Read);
            }

            if inner.num_read != inner.num_write || !inner.write_open {
                break;
            }

            inner = proc::sleep(Channel::PipeRead(self.id()), inner);
        }

        let mut i = 0;
        while i < n && inner.num_read != inner.num_write {
            let byte = inner.data[inner.num_read % PIPESIZE];

            if proc::copy_out_user(&[byte], addr + i).is_err() {
                break;
            }

            inner.num_read += 1;
            i += 1;
        }

        proc::wakeup(Channel::PipeWrite(self.id()));

        Ok(i)
    }
}
