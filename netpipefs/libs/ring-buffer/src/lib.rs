// SPDX-License-Identifier: MPL-2.0

//! A fixed-capacity byte FIFO for the pipe engine.
//!
//! The buffer keeps free-running head/tail counters over a power-of-two
//! backing storage, so wrap-around is handled by at most two slice copies.
//! Unlike a lock-free SPSC ring, this buffer is meant to live under an
//! external lock (the pipe mutex): every operation takes `&mut self` and
//! returns immediately with the number of bytes actually moved.
//!
//! The one transport-facing helper, [`RingBuffer::read_from`], fills free
//! space straight from an [`io::Read`] so the receive hot path never goes
//! through a staging copy.

use std::{io, num::Wrapping};

pub struct RingBuffer {
    storage: Box<[u8]>,
    /// Number of bytes popped over the buffer's lifetime. Wraps at `usize`.
    head: Wrapping<usize>,
    /// Number of bytes pushed over the buffer's lifetime. Wraps at `usize`.
    tail: Wrapping<usize>,
}

impl RingBuffer {
    /// Creates a ring buffer holding at least `capacity` bytes.
    ///
    /// The capacity is rounded up to the next power of two so that offsets
    /// reduce to a mask.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "capacity cannot be zero");

        let capacity = capacity.next_power_of_two();
        Self {
            storage: vec![0u8; capacity].into_boxed_slice(),
            head: Wrapping(0),
            tail: Wrapping(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.storage.len()
    }

    /// Gets the number of buffered bytes.
    pub fn len(&self) -> usize {
        // The subtraction only makes sense because the head and the tail
        // move under the same external lock.
        (self.tail - self.head).0
    }

    /// Gets the number of bytes that can still be pushed.
    pub fn free_len(&self) -> usize {
        self.capacity() - self.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.free_len() == 0
    }

    fn mask(&self) -> usize {
        self.capacity() - 1
    }

    /// Pushes bytes from `src`, up to the free space.
    ///
    /// Returns the number of bytes accepted, which may be any value from
    /// zero to `src.len()`.
    pub fn push_slice(&mut self, src: &[u8]) -> usize {
        let count = src.len().min(self.free_len());
        if count == 0 {
            return 0;
        }

        let offset = self.tail.0 & self.mask();
        let first = count.min(self.capacity() - offset);
        self.storage[offset..offset + first].copy_from_slice(&src[..first]);
        self.storage[..count - first].copy_from_slice(&src[first..count]);

        self.tail += Wrapping(count);
        count
    }

    /// Pops bytes into `dst`, up to the buffered length.
    ///
    /// Returns the number of bytes moved.
    pub fn pop_slice(&mut self, dst: &mut [u8]) -> usize {
        let count = dst.len().min(self.len());
        if count == 0 {
            return 0;
        }

        let offset = self.head.0 & self.mask();
        let first = count.min(self.capacity() - offset);
        dst[..first].copy_from_slice(&self.storage[offset..offset + first]);
        dst[first..count].copy_from_slice(&self.storage[..count - first]);

        self.head += Wrapping(count);
        count
    }

    /// Returns the buffered bytes as up to two contiguous slices, in FIFO
    /// order.
    ///
    /// The second slice is empty unless the occupied region wraps.
    pub fn as_slices(&self) -> (&[u8], &[u8]) {
        let len = self.len();
        let offset = self.head.0 & self.mask();
        let first = len.min(self.capacity() - offset);
        (&self.storage[offset..offset + first], &self.storage[..len - first])
    }

    /// Discards `count` buffered bytes, as if they had been popped.
    ///
    /// # Panics
    ///
    /// Panics if fewer than `count` bytes are buffered.
    pub fn skip(&mut self, count: usize) {
        assert!(count <= self.len());
        self.head += Wrapping(count);
    }

    /// Fills up to `max` bytes of free space directly from `reader`.
    ///
    /// The wrap in the free region costs at most one extra read call. Reads
    /// are retried until `max` bytes arrive, the free space runs out, or the
    /// reader reports end of stream; interrupted reads are retried. Returns
    /// the number of bytes stored, which is less than `max` only on end of
    /// stream or exhausted free space.
    pub fn read_from<R: io::Read + ?Sized>(
        &mut self,
        reader: &mut R,
        max: usize,
    ) -> io::Result<usize> {
        let want = max.min(self.free_len());
        let mut filled = 0;

        while filled < want {
            let offset = self.tail.0 & self.mask();
            let chunk = (want - filled).min(self.capacity() - offset);
            match reader.read(&mut self.storage[offset..offset + chunk]) {
                Ok(0) => break,
                Ok(n) => {
                    self.tail += Wrapping(n);
                    filled += n;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }

        Ok(filled)
    }
}
