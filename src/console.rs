use core::num::Wrapping;

use crate::proc::{self, Channel};
use crate::spinlock::SpinLock;
use crate::syscall::SyscallError;
use crate::uart;
use crate::vm::VA;

const INPUT_BUF_SIZE: usize = 128;

/// ^D
const CTRL_D: u8 = b'D' & 0x1f;
/// ^H, backspace
const CTRL_H: u8 = b'H' & 0x1f;
/// ^U, kill line
const CTRL_U: u8 = b'U' & 0x1f;
const BACKSPACE: u8 = 0x7f;

pub static CONSOLE: SpinLock<Console> = SpinLock::new(Console::new(), "console");

/// A classic xv6-style line-buffered terminal: typed characters accumulate in `buf` up to the
/// edit cursor `e`, and a newline or ^D publishes everything between `r` and `e` for
/// `consoleread` to consume, moving the read boundary forward. `w` trails `e`/`r` so multiple
/// complete lines can queue up before any of them is read.
pub struct Console {
    buf: [u8; INPUT_BUF_SIZE],
    /// next reader index
    r: Wrapping<usize>,
    /// next index a completed line will be handed off at
    w: Wrapping<usize>,
    /// next index a typed character is written to
    e: Wrapping<usize>,
}

impl Console {
    const fn new() -> Self {
        Self {
            buf: [0; INPUT_BUF_SIZE],
            r: Wrapping(0),
            w: Wrapping(0),
            e: Wrapping(0),
        }
    }

    fn slot(index: Wrapping<usize>) -> usize {
        index.0 % INPUT_BUF_SIZE
    }

    /// Handles one input character from the UART, doing line editing and echoing it back.
    pub fn interrupt(c: u8) {
        let mut console = CONSOLE.lock();

        match c {
            CTRL_U => {
                while console.e != console.w
                    && console.buf[Self::slot(console.e - Wrapping(1))] != b'\n'
                {
                    console.e -= 1;
                    putc(BACKSPACE);
                }
            }

            CTRL_H | BACKSPACE => {
                if console.e != console.w {
                    console.e -= 1;
                    putc(BACKSPACE);
                }
            }

            _ => {
                if c != 0 && (console.e - console.r).0 < INPUT_BUF_SIZE {
                    let c = if c == b'\r' { b'\n' } else { c };

                    // echo back to the user
                    putc(c);

                    let slot = Self::slot(console.e);
                    console.e += 1;
                    console.buf[slot] = c;

                    if c == b'\n' || c == CTRL_D || (console.e - console.r).0 == INPUT_BUF_SIZE {
                        // a whole line (or the whole buffer) has arrived; wake any reader
                        console.w = console.e;
                        proc::wakeup(Channel::Addr(&CONSOLE as *const _ as usize));
                    }
                }
            }
        }
    }

    /// Reads at most `n` bytes into the user buffer at `addr`, blocking until a full line is
    /// available. Returns the number of bytes read, possibly fewer than `n`.
    pub fn read(addr: VA, n: usize) -> Result<usize, SyscallError> {
        let mut target = n;
        let mut dst = addr;
        let mut console = CONSOLE.lock();

        while target > 0 {
            while console.r == console.w {
                if current_proc_killed() {
                    return Err(SyscallError::Read);
                }

                console = proc::sleep(Channel::Addr(&CONSOLE as *const _ as usize), console);
            }

            let slot = Self::slot(console.r);
            let c = console.buf[slot];
            console.r += 1;

            if c == CTRL_D {
                if target < n {
                    // leave ^D for the next read
                    console.r -= 1;
                }
                break;
            }

            let byte = [c];
            if proc::copy_out_user(&byte, dst).is_err() {
                break;
            }

            dst = dst + 1;
            target -= 1;

            if c == b'\n' {
                break;
            }
        }

        Ok(n - target)
    }

    /// Writes `n` bytes from the user buffer at `addr` to the UART, one at a time.
    pub fn write(addr: VA, n: usize) -> Result<usize, SyscallError> {
        for i in 0..n {
            let mut byte = [0u8];

            if proc::copy_in_user(&mut byte, addr + i).is_err() {
                return Ok(i);
            }

            putc(byte[0]);
        }

        Ok(n)
    }
}

fn current_proc_killed() -> bool {
    crate::proc::CPU_POOL
        .current_proc()
        .is_some_and(|p| p.is_killed())
}

pub fn putc(c: u8) {
    uart::putc_sync(c);
}

/// Initialize console and system calls.
///
/// # Safety
/// Must be called only once during kernel initialization.
pub unsafe fn init() {
    unsafe { uart::init() };
}
