//! Physical frame allocator with per-frame reference counting.
//!
//! User-page frames are still carved out of the general kernel heap (`kalloc.rs`'s buddy
//! allocator is the only free-list the kernel has), but every frame handed to a user address
//! space is tracked here by an atomic reference count indexed by frame number. This is the layer
//! copy-on-write depends on: `try_clone` is the only path that may duplicate a frame, and
//! `free_frame` is the only path that may hand one back to the heap, so the two can never race
//! each other into a double-free.

use alloc::boxed::Box;
use core::mem::MaybeUninit;
use core::sync::atomic::{AtomicUsize, Ordering};

use crate::error::KernelError;
use crate::memlayout::{KERNBASE, PHYSTOP};
use crate::riscv::PGSIZE;
use crate::vm::{PA, Page};

const NFRAMES: usize = (PHYSTOP - KERNBASE) / PGSIZE;

struct RefcountTable {
    counts: [AtomicUsize; NFRAMES],
}

fn index_of(pa: PA) -> usize {
    (pa.0 - KERNBASE) / PGSIZE
}

static FRAMES: RefcountTable = RefcountTable {
    counts: [const { AtomicUsize::new(0) }; NFRAMES],
};

/// Allocates one zero-filled frame with reference count 1.
pub fn alloc_frame() -> Result<PA, KernelError> {
    let mem: Box<MaybeUninit<Page>> = Box::try_new_zeroed()?;
    let mem = unsafe { mem.assume_init() };
    let pa = PA(Box::into_raw(mem) as usize);

    FRAMES.counts[index_of(pa)].store(1, Ordering::Relaxed);
    Ok(pa)
}

/// Bumps a frame's reference count. Caller must already hold a reference.
pub fn inc_ref(pa: PA) {
    FRAMES.counts[index_of(pa)].fetch_add(1, Ordering::Relaxed);
}

/// Drops one reference to a frame; frees it back to the heap on the transition to zero.
///
/// # Safety
/// Caller must not use `pa` again if this was the last reference.
pub unsafe fn free_frame(pa: PA) {
    let prev = FRAMES.counts[index_of(pa)].fetch_sub(1, Ordering::AcqRel);
    assert!(prev >= 1, "free_frame: refcount underflow");

    if prev == 1 {
        unsafe { drop(Box::from_raw(pa.0 as *mut Page)) };
    }
}

/// Current reference count of a frame. Only meaningful for frames this allocator handed out.
pub fn refcount(pa: PA) -> usize {
    FRAMES.counts[index_of(pa)].load(Ordering::Relaxed)
}

/// Copy-on-write clone helper: if the frame is uniquely referenced, hands the same frame back
/// (no copy needed); otherwise allocates a fresh frame, copies the contents, and drops the
/// caller's reference to the original.
///
/// # Safety
/// Caller must hold a reference to `pa` that it is giving up in exchange for the returned frame.
pub unsafe fn try_clone(pa: PA) -> Result<PA, KernelError> {
    if refcount(pa) <= 1 {
        return Ok(pa);
    }

    let new_pa = alloc_frame()?;
    unsafe {
        core::ptr::copy_nonoverlapping(pa.0 as *const u8, new_pa.0 as *mut u8, PGSIZE);
        free_frame(pa);
    }
    Ok(new_pa)
}

#[cfg(test)]
mod tests {
    use super::*;

    // distinct indices per test so they don't race on the shared static FRAMES table when
    // `cargo test` runs them concurrently; never call `alloc_frame`/`free_frame` here since these
    // indices have no real backing allocation.
    fn fake_pa(index: usize) -> PA {
        PA(KERNBASE + index * PGSIZE)
    }

    #[test]
    fn index_of_is_page_aligned() {
        assert_eq!(index_of(PA(KERNBASE)), 0);
        assert_eq!(index_of(PA(KERNBASE + PGSIZE)), 1);
        assert_eq!(index_of(PA(KERNBASE + 42 * PGSIZE)), 42);
    }

    #[test]
    fn fresh_frame_has_zero_refcount() {
        assert_eq!(refcount(fake_pa(9000)), 0);
    }

    #[test]
    fn inc_ref_increments_count() {
        let pa = fake_pa(9001);
        let before = refcount(pa);
        inc_ref(pa);
        assert_eq!(refcount(pa), before + 1);
        inc_ref(pa);
        assert_eq!(refcount(pa), before + 2);
    }
}
