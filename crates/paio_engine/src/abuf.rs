//! The attached write buffer: one caller-sized allocation that pooled
//! writes stage into, with a bump allocator and an occupancy table.
//!
//! Space is only ever reclaimed from the tail. Freeing a middle slot marks
//! it unused; the bytes come back once everything behind it drains too.

use crate::error::Error;

#[derive(Debug, Clone, Copy)]
struct PoolEntry {
    start: i64,
    len: i64,
    used: bool,
}

#[derive(Debug)]
pub(crate) struct AttachedBuf {
    mem: Vec<u8>,
    /// Occupancy table. Entries at `tail..` are stale leftovers from
    /// earlier rounds and get overwritten by new allocations.
    entries: Vec<PoolEntry>,
    tail: usize,
    size_used: i64,
}

impl AttachedBuf {
    pub(crate) fn new(size: usize) -> Self {
        AttachedBuf { mem: vec![0; size], entries: Vec::new(), tail: 0, size_used: 0 }
    }

    pub(crate) fn size(&self) -> i64 {
        self.mem.len() as i64
    }

    /// Reserve `len` bytes; returns the slot index.
    pub(crate) fn alloc(&mut self, len: i64) -> Result<usize, Error> {
        if self.size_used + len > self.size() {
            return Err(Error::InsufficientBuffer {
                needed: len,
                avail: self.size() - self.size_used,
            });
        }
        let start = if self.tail == 0 {
            0
        } else {
            let prev = self.entries[self.tail - 1];
            prev.start + prev.len
        };
        let entry = PoolEntry { start, len, used: true };
        if self.tail < self.entries.len() {
            self.entries[self.tail] = entry;
        } else {
            self.entries.push(entry);
        }
        self.tail += 1;
        self.size_used += len;
        Ok(self.tail - 1)
    }

    /// Mark a slot free. Its bytes are reclaimed by [`coalesce`].
    ///
    /// [`coalesce`]: AttachedBuf::coalesce
    pub(crate) fn free(&mut self, index: usize) {
        self.entries[index].used = false;
    }

    /// Pull the tail back over trailing unused slots.
    pub(crate) fn coalesce(&mut self) {
        while self.tail > 0 && !self.entries[self.tail - 1].used {
            self.size_used -= self.entries[self.tail - 1].len;
            self.tail -= 1;
        }
    }

    /// Drop every slot at once, used or not.
    pub(crate) fn reset(&mut self) {
        self.tail = 0;
        self.size_used = 0;
    }

    pub(crate) fn occupied(&self) -> bool {
        self.entries[..self.tail].iter().any(|e| e.used)
    }

    pub(crate) fn slice(&self, index: usize) -> &[u8] {
        let e = self.entries[index];
        &self.mem[e.start as usize..(e.start + e.len) as usize]
    }

    pub(crate) fn slice_mut(&mut self, index: usize) -> &mut [u8] {
        let e = self.entries[index];
        &mut self.mem[e.start as usize..(e.start + e.len) as usize]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_packs_from_the_front() {
        let mut pool = AttachedBuf::new(64);
        let a = pool.alloc(16).unwrap();
        let b = pool.alloc(16).unwrap();
        assert_eq!((a, b), (0, 1));
        pool.slice_mut(b)[0] = 7;
        assert_eq!(pool.slice(b).len(), 16);
        assert_eq!(pool.slice(a)[0], 0);
    }

    #[test]
    fn exhaustion_reports_what_is_left() {
        let mut pool = AttachedBuf::new(32);
        pool.alloc(24).unwrap();
        let err = pool.alloc(16).unwrap_err();
        assert_eq!(err, Error::InsufficientBuffer { needed: 16, avail: 8 });
    }

    #[test]
    fn coalesce_stops_at_a_used_slot() {
        let mut pool = AttachedBuf::new(48);
        let a = pool.alloc(16).unwrap();
        let _b = pool.alloc(16).unwrap();
        let c = pool.alloc(16).unwrap();
        // Free the first and last; the middle one pins its prefix.
        pool.free(a);
        pool.free(c);
        pool.coalesce();
        assert!(pool.occupied());
        // Only the tail slot came back.
        assert_eq!(pool.alloc(24).unwrap_err(), Error::InsufficientBuffer {
            needed: 24,
            avail: 16,
        });
    }

    #[test]
    fn freed_tail_space_is_reused() {
        let mut pool = AttachedBuf::new(32);
        let a = pool.alloc(32).unwrap();
        pool.free(a);
        pool.coalesce();
        assert!(!pool.occupied());
        assert_eq!(pool.alloc(32).unwrap(), 0);
    }

    #[test]
    fn reset_clears_everything() {
        let mut pool = AttachedBuf::new(32);
        pool.alloc(16).unwrap();
        pool.alloc(16).unwrap();
        pool.reset();
        assert!(!pool.occupied());
        assert_eq!(pool.alloc(32).unwrap(), 0);
    }
}
