use core::cell::UnsafeCell;
use core::hint;
use core::ops::{Deref, DerefMut};
use core::ptr;
use core::sync::atomic::{AtomicPtr, Ordering};

use crate::proc::InterruptLock;
use crate::proc::{Cpu, Cpus};
use crate::riscv::interrupts;

pub fn push_off() {
    let old = interrupts::get();
    interrupts::disable();
    unsafe {
        let c = &mut *Cpus::mycpu();
        if c.num_off == 0 {
            c.interrupt_enabled = old;
        }
        c.num_off += 1;
    }
}

pub fn pop_off() {
    assert!(!interrupts::get(), "pop_off - interruptable");

    unsafe {
        let c = &mut *Cpus::mycpu();
        assert!(c.num_off >= 1, "pop_off");

        c.num_off -= 1;
        if c.num_off == 0 && c.interrupt_enabled {
            interrupts::enable();
        }
    }
}

/// A spin-lock guarding `T`. Acquiring pushes an interrupt-disable onto the per-CPU nesting
/// counter before spinning, so a lock held by this CPU can never be retaken by an interrupt
/// handler on the same CPU. The CPU pointer doubles as the locked flag: null means free.
#[derive(Debug)]
pub struct SpinLock<T> {
    name: &'static str,
    cpu: AtomicPtr<Cpu>,
    data: UnsafeCell<T>,
}

// Safety: UnsafeCell is not Sync but it can only be consumed with a guard or an exclusive
// reference. So SpinLock is safe to sync, if the inner type T is.
unsafe impl<T> Sync for SpinLock<T> where T: Send {}

pub struct SpinLockGuard<'a, T: 'a> {
    lock: &'a SpinLock<T>,
    _intr_lock: InterruptLock,
}

// Safety: only one thread can hold this guard at a time.
unsafe impl<T> Sync for SpinLockGuard<'_, T> where T: Sync {}

impl<T> SpinLock<T> {
    pub const fn new(value: T, name: &'static str) -> Self {
        SpinLock {
            name,
            cpu: AtomicPtr::new(ptr::null_mut()),
            data: UnsafeCell::new(value),
        }
    }

    // Safety: must be called with interrupts disabled.
    unsafe fn holding(&self) -> bool {
        self.cpu.load(Ordering::Relaxed) == unsafe { Cpus::mycpu() }
    }

    pub fn lock(&self) -> SpinLockGuard<T> {
        let _intr_lock = Cpus::lock_mycpu();

        unsafe {
            assert!(!self.holding(), "acquire lock {}", self.name);

            loop {
                if self
                    .cpu
                    .compare_exchange(
                        ptr::null_mut(),
                        Cpus::mycpu(),
                        Ordering::Acquire,
                        Ordering::Relaxed,
                    )
                    .is_ok()
                {
                    break SpinLockGuard {
                        lock: self,
                        _intr_lock,
                    };
                }

                hint::spin_loop()
            }
        }
    }

    /// Returns whether this lock is currently held by any CPU.
    pub fn is_locked(&self) -> bool {
        !self.cpu.load(Ordering::Relaxed).is_null()
    }

    // Since this call consumes self, we can guarantee no one else is holding a reference.
    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }

    // Since this call mutably borrows self, we can guarantee no one else is holding a reference.
    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }

    /// Use this over `get_mut` when you need unsafe mutable access without a guard, e.g. once
    /// interrupts are already known to be disabled by the caller (panic path, single-hart setup).
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn get_mut_unchecked(&self) -> &mut T {
        &mut *self.data.get()
    }
}

// Dropping the guard releases the lock and the interrupt-disable it carries.
impl<'a, T: 'a> Drop for SpinLockGuard<'a, T> {
    fn drop(&mut self) {
        // Safety: the guard's interrupt lock guarantees interrupts are off here.
        unsafe {
            assert!(self.lock.holding(), "release lock {}", self.lock.name);
        }

        self.lock.cpu.store(ptr::null_mut(), Ordering::Release);
    }
}

impl<'a, T: 'a> SpinLockGuard<'a, T> {
    /// Returns the lock this guard holds, so callers can drop the guard and relock later (used by
    /// `proc::sleep`, which must release the caller's lock before going to sleep).
    pub(crate) fn spinlock(&self) -> &'a SpinLock<T> {
        self.lock
    }
}

impl<T> Deref for SpinLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}
