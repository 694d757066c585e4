//! The fixed-capacity contiguous buffer used for both the per-connection
//! receive and send buffers (§3 invariants).
//!
//! A `FixedBuf` never grows past the capacity it was created with. It holds
//! a single "used" watermark; the consumed prefix is dropped by a block-move
//! (`copy_within`) rather than by reallocating, matching the byte-buffer
//! style the teacher sketches in `buf/byte.rs` and `buf/ring.rs`.

use std::io;

pub struct FixedBuf {
    data: Box<[u8]>,
    used: usize,
}

impl FixedBuf {
    pub fn with_capacity(capacity: usize) -> Self {
        FixedBuf {
            data: vec![0u8; capacity].into_boxed_slice(),
            used: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn len(&self) -> usize {
        self.used
    }

    pub fn is_empty(&self) -> bool {
        self.used == 0
    }

    pub fn free(&self) -> usize {
        self.data.len() - self.used
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.used]
    }

    /// The unused tail, for a socket `read` to fill directly.
    pub fn spare_mut(&mut self) -> &mut [u8] {
        &mut self.data[self.used..]
    }

    /// Marks `n` bytes of the spare tail (just filled by the caller) as used.
    ///
    /// # Panics
    /// Panics if `n` exceeds `self.free()`; callers only ever pass the byte
    /// count a prior `spare_mut` read actually produced.
    pub fn commit(&mut self, n: usize) {
        assert!(n <= self.free());
        self.used += n;
    }

    /// Appends `data` if it fits, else leaves the buffer untouched and
    /// returns `false`. Callers treat a `false` return as fatal for the
    /// connection (§3: "Outbound frames are appended to the send buffer only
    /// if the remaining capacity is sufficient; otherwise the connection is
    /// torn down").
    #[must_use]
    pub fn try_append(&mut self, bytes: &[u8]) -> bool {
        if bytes.len() > self.free() {
            return false;
        }
        let start = self.used;
        self.data[start..start + bytes.len()].copy_from_slice(bytes);
        self.used += bytes.len();
        true
    }

    /// Drops the first `n` used bytes, block-moving the remainder to the
    /// front. `n` must be `<= self.len()`.
    pub fn consume(&mut self, n: usize) {
        assert!(n <= self.used);
        let remaining = self.used - n;
        if remaining > 0 {
            self.data.copy_within(n..self.used, 0);
        }
        self.used = remaining;
    }

    /// Reads as much as fits from `source` into the spare tail, non-blocking
    /// semantics left entirely to the caller (this just bounds the read to
    /// available space). Returns the number of bytes read.
    pub fn fill_from<R: io::Read>(&mut self, source: &mut R) -> io::Result<usize> {
        let n = source.read(self.spare_mut())?;
        self.commit(n);
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn used_never_exceeds_capacity() {
        let mut buf = FixedBuf::with_capacity(8);
        assert!(buf.try_append(&[0; 8]));
        assert_eq!(buf.len(), 8);
        assert_eq!(buf.free(), 0);
        assert!(!buf.try_append(&[0; 1]), "one byte more must fail, not wrap");
    }

    #[test]
    fn exact_fit_succeeds_one_more_byte_fails() {
        let mut buf = FixedBuf::with_capacity(4);
        assert!(buf.try_append(&[1, 2, 3, 4]));
        let mut buf2 = FixedBuf::with_capacity(4);
        assert!(!buf2.try_append(&[1, 2, 3, 4, 5]));
        assert_eq!(buf2.len(), 0, "a rejected append must not partially write");
    }

    #[test]
    fn consume_block_moves_remaining_prefix() {
        let mut buf = FixedBuf::with_capacity(8);
        buf.try_append(b"abcdef");
        buf.consume(2);
        assert_eq!(buf.as_slice(), b"cdef");
        assert_eq!(buf.free(), 4);
    }

    #[test]
    fn consume_everything_resets_to_empty() {
        let mut buf = FixedBuf::with_capacity(4);
        buf.try_append(b"abcd");
        buf.consume(4);
        assert!(buf.is_empty());
        assert_eq!(buf.free(), 4);
    }

    #[test]
    fn spare_mut_and_commit_round_trip() {
        let mut buf = FixedBuf::with_capacity(4);
        buf.spare_mut()[..2].copy_from_slice(b"hi");
        buf.commit(2);
        assert_eq!(buf.as_slice(), b"hi");
    }
}
