use core::ops::{Deref, DerefMut};

use crate::fs::BSIZE;
use crate::param::NBUF;
use crate::sleeplock::{SleepLock, SleepLockGuard};
use crate::spinlock::SpinLock;
use crate::virtio_disk;

/// Allocation and LRU bookkeeping for one slot, protected by `BCache::inner`.
#[derive(Debug, Clone, Copy)]
pub struct BufMeta {
    pub dev: u32,
    pub block_no: u32,
    pub ref_count: usize,
    /// True while an in-flight disk request owns this slot's data.
    pub disk: bool,

    // doubly-linked LRU ring, indices into `BCacheInner::meta`
    prev: usize,
    next: usize,
}

#[derive(Debug)]
pub struct BCacheInner {
    pub meta: [BufMeta; NBUF],
    /// Most-recently-used slot; `meta[head].prev` is the least-recently-used.
    head: usize,
}

impl BCacheInner {
    const fn new() -> Self {
        let mut meta = [BufMeta {
            dev: 0,
            block_no: 0,
            ref_count: 0,
            disk: false,
            prev: 0,
            next: 0,
        }; NBUF];

        let mut i = 0;
        while i < NBUF {
            meta[i].prev = (i + NBUF - 1) % NBUF;
            meta[i].next = (i + 1) % NBUF;
            i += 1;
        }

        Self { meta, head: 0 }
    }

    fn unlink(&mut self, id: usize) {
        let prev = self.meta[id].prev;
        let next = self.meta[id].next;
        self.meta[prev].next = next;
        self.meta[next].prev = prev;
    }

    fn link_after_head(&mut self, id: usize) {
        let first = self.meta[self.head].next;
        self.meta[id].next = first;
        self.meta[id].prev = self.head;
        self.meta[self.head].next = id;
        self.meta[first].prev = id;
    }

    /// Moves `id` to the front of the LRU ring, marking it most-recently-used.
    fn move_to_front(&mut self, id: usize) {
        self.unlink(id);
        self.link_after_head(id);
        self.head = id;
    }

    /// Finds the least-recently-used slot with no outstanding references.
    fn find_lru(&self) -> Option<usize> {
        let mut current = self.meta[self.head].prev;

        loop {
            if self.meta[current].ref_count == 0 {
                return Some(current);
            }

            if current == self.head {
                return None;
            }

            current = self.meta[current].prev;
        }
    }

    fn find_cached(&self, dev: u32, block_no: u32) -> Option<usize> {
        (0..NBUF).find(|&id| {
            self.meta[id].ref_count > 0
                && self.meta[id].dev == dev
                && self.meta[id].block_no == block_no
        })
    }
}

/// Data held by one cache slot, protected by a per-slot sleep-lock so disk I/O on one buffer never
/// blocks lookups of unrelated buffers.
#[derive(Debug)]
pub struct BufData {
    valid: bool,
    data: [u8; BSIZE],
}

pub static BCACHE: BCache = BCache::new();

/// Buffer cache.
///
/// The buffer cache is a set of in-memory copies of disk blocks, shared so concurrent system
/// calls touching the same block see consistent data and the disk is read at most once per
/// block. Allocation and LRU order are guarded by a single spinlock (`inner`); once a slot is
/// handed out, further access to its bytes goes through that slot's own sleep-lock so a slow disk
/// operation never blocks unrelated blocks.
#[derive(Debug)]
pub struct BCache {
    pub inner: SpinLock<BCacheInner>,
    data: [SleepLock<BufData>; NBUF],
}

impl BCache {
    const fn new() -> Self {
        Self {
            inner: SpinLock::new(BCacheInner::new(), "bcache"),
            data: [const {
                SleepLock::new(
                    BufData {
                        valid: false,
                        data: [0; BSIZE],
                    },
                    "buffer",
                )
            }; NBUF],
        }
    }

    /// Returns the buffer for `(dev, block_no)`, reading it from disk if not already cached.
    pub fn read(&self, dev: u32, block_no: u32) -> Buf<'_> {
        let id = {
            let mut inner = self.inner.lock();

            if let Some(id) = inner.find_cached(dev, block_no) {
                inner.meta[id].ref_count += 1;
                inner.move_to_front(id);
                id
            } else {
                let id = inner.find_lru().expect("bread: no free buffers");
                inner.meta[id].dev = dev;
                inner.meta[id].block_no = block_no;
                inner.meta[id].ref_count = 1;
                inner.move_to_front(id);

                // Safety: ref_count just went 0 -> 1, so no other holder of this slot's data
                // sleep-lock exists to race with this unsynchronized write.
                unsafe { self.data[id].get_mut_unchecked() }.valid = false;

                id
            }
        };

        let mut guard = self.data[id].lock();

        if !guard.valid {
            let mut buf = Buf { id, guard };
            virtio_disk::rw(&mut buf, false);
            buf.guard.valid = true;
            return buf;
        }

        Buf { id, guard }
    }

    /// Writes `buf`'s contents to disk. Caller must hold the buffer locked via `read()`.
    pub fn write(&self, buf: &mut Buf<'_>) {
        virtio_disk::rw(buf, true);
    }

    /// Releases a buffer obtained from `read()`, dropping its reference count.
    pub fn release(&self, buf: Buf<'_>) {
        let id = buf.id;
        drop(buf);

        let mut inner = self.inner.lock();
        inner.meta[id].ref_count -= 1;

        if inner.meta[id].ref_count == 0 {
            inner.move_to_front(id);
        }
    }

    /// Pins a buffer in the cache (keeps it from being recycled) without holding it locked.
    pub fn pin(&self, buf: &Buf<'_>) {
        self.inner.lock().meta[buf.id].ref_count += 1;
    }

    /// Undoes a previous `pin()`.
    pub fn unpin(&self, buf: &Buf<'_>) {
        self.inner.lock().meta[buf.id].ref_count -= 1;
    }
}

/// A locked, cached disk block. Dropping it only releases the per-slot sleep-lock; call
/// `BCache::release` to also give up the cache reference.
pub struct Buf<'a> {
    pub id: usize,
    guard: SleepLockGuard<'a, BufData>,
}

impl Buf<'_> {
    pub fn data(&self) -> &[u8] {
        &self.guard.data
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.guard.data
    }
}

impl Deref for Buf<'_> {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        self.data()
    }
}

impl DerefMut for Buf<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.data_mut()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_ring_has_no_cached_block() {
        let inner = BCacheInner::new();
        assert_eq!(inner.find_cached(1, 0), None);
    }

    #[test]
    fn find_lru_picks_unreferenced_slot() {
        let mut inner = BCacheInner::new();
        inner.meta[0].ref_count = 1;
        let lru = inner.find_lru().expect("at least one free slot");
        assert_ne!(lru, 0);
    }

    #[test]
    fn find_lru_none_when_all_referenced() {
        let mut inner = BCacheInner::new();
        for m in inner.meta.iter_mut() {
            m.ref_count = 1;
        }
        assert_eq!(inner.find_lru(), None);
    }

    #[test]
    fn move_to_front_makes_slot_most_recently_used() {
        let mut inner = BCacheInner::new();
        let old_head = inner.head;
        let target = inner.meta[old_head].prev; // current LRU slot

        inner.move_to_front(target);
        assert_eq!(inner.head, target);
        assert_eq!(inner.meta[target].next, old_head);

        // ring stays doubly-linked after the move
        for i in 0..NBUF {
            let next = inner.meta[i].next;
            assert_eq!(inner.meta[next].prev, i);
        }
    }

    #[test]
    fn find_cached_matches_dev_and_block() {
        let mut inner = BCacheInner::new();
        inner.meta[2].dev = 1;
        inner.meta[2].block_no = 42;
        inner.meta[2].ref_count = 1;

        assert_eq!(inner.find_cached(1, 42), Some(2));
        assert_eq!(inner.find_cached(1, 43), None);
        assert_eq!(inner.find_cached(2, 42), None);
    }
}
