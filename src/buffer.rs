//! Growable byte buffer with a moving read/write window.
//!
//! Every socket owns two of these, one per direction. The buffer keeps a
//! zero-filled backing store of `capacity` bytes and two offsets into it:
//! `start` (first readable byte) and `end` (one past the last readable
//! byte). Reads from the fd append at `end`; writes to the fd consume from
//! `start`. Growth doubles the capacity until an append fits, and never
//! shrinks. Compaction shifts the readable window back to offset zero when
//! the wasted prefix gets large.
//!
//! Buffers are values: `Clone` is a deep copy, and `std::mem::take` leaves
//! behind an empty buffer with no allocation.
//!
//! # Examples
//!
//! ```
//! use eventide::Buffer;
//!
//! let mut buf = Buffer::new();
//! buf.put_slice(b"hello world");
//! assert_eq!(buf.peek(5), b"hello");
//! buf.consume(6);
//! assert_eq!(buf.as_slice(), b"world");
//! ```

use std::ops::Index;

/// Byte buffer with start/end offsets, doubling growth, and compaction.
#[derive(Debug, Clone)]
pub struct Buffer {
    data: Vec<u8>,
    start: usize,
    end: usize,
}

impl Buffer {
    /// Creates a buffer with a one-byte backing store.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(1)
    }

    /// Creates a buffer with at least `cap` bytes of zero-filled backing
    /// store (minimum one byte).
    #[must_use]
    pub fn with_capacity(cap: usize) -> Self {
        Self {
            data: vec![0; cap.max(1)],
            start: 0,
            end: 0,
        }
    }

    /// Number of readable bytes, `end - start`.
    #[must_use]
    pub fn size(&self) -> usize {
        self.end - self.start
    }

    /// Returns true if there are no readable bytes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// Current backing-store capacity.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Bytes wasted in front of the readable window.
    #[must_use]
    pub fn waste(&self) -> usize {
        self.start
    }

    /// The readable window `[start, end)`.
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.data[self.start..self.end]
    }

    /// Grows the backing store so that the capacity is at least `cap`,
    /// doubling from the current capacity. Existing readable bytes keep
    /// their offsets. Never shrinks.
    pub fn reserve_to(&mut self, cap: usize) {
        if self.data.len() >= cap {
            return;
        }
        let mut ncap = self.data.len().max(1);
        while ncap < cap {
            ncap *= 2;
        }
        self.data.resize(ncap, 0);
    }

    /// Appends `bytes`, growing as needed.
    pub fn put_slice(&mut self, bytes: &[u8]) {
        self.reserve_to(self.end + bytes.len());
        self.data[self.end..self.end + bytes.len()].copy_from_slice(bytes);
        self.end += bytes.len();
    }

    /// Returns the next bytes as an owned vector.
    ///
    /// `len` of `None` means all available bytes; a `Some` longer than the
    /// readable window is clamped. When `consume` is true the window start
    /// advances past the returned bytes.
    #[must_use]
    pub fn get_bytes(&mut self, len: Option<usize>, consume: bool) -> Vec<u8> {
        let n = len.map_or_else(|| self.size(), |l| l.min(self.size()));
        let out = self.data[self.start..self.start + n].to_vec();
        if consume {
            self.start += n;
        }
        out
    }

    /// Returns a copy of the next `min(n, size)` bytes without consuming.
    #[must_use]
    pub fn peek(&mut self, n: usize) -> Vec<u8> {
        self.get_bytes(Some(n), false)
    }

    /// Advances the window start by `min(n, size)`.
    pub fn consume(&mut self, n: usize) {
        self.start += n.min(self.size());
    }

    /// Shifts the readable window to offset zero and zeroes the tail.
    pub fn compact(&mut self) {
        if self.start == 0 {
            return;
        }
        let len = self.size();
        self.data.copy_within(self.start..self.end, 0);
        self.data[len..].fill(0);
        self.start = 0;
        self.end = len;
    }

    /// Zeroes the whole backing store and resets both offsets.
    pub fn clear(&mut self) {
        self.data.fill(0);
        self.start = 0;
        self.end = 0;
    }

    /// Returns a mutable view of `len` bytes of spare room after the
    /// readable window, growing the backing store if necessary. Used as
    /// the target of read/recv syscalls; pair with [`advance_end`].
    ///
    /// [`advance_end`]: Buffer::advance_end
    pub fn spare_window(&mut self, len: usize) -> &mut [u8] {
        self.reserve_to(self.end + len);
        let end = self.end;
        &mut self.data[end..end + len]
    }

    /// Marks `n` bytes of the spare window as filled.
    pub fn advance_end(&mut self, n: usize) {
        debug_assert!(self.end + n <= self.data.len());
        self.end += n;
    }
}

impl Default for Buffer {
    /// An empty buffer with no backing allocation. `std::mem::take` on a
    /// buffer leaves this behind.
    fn default() -> Self {
        Self {
            data: Vec::new(),
            start: 0,
            end: 0,
        }
    }
}

impl Index<usize> for Buffer {
    type Output = u8;

    /// Indexes relative to the window start.
    fn index(&self, i: usize) -> &u8 {
        &self.data[self.start + i]
    }
}
