//! Query buffer: bytes read from a client that were not parsed yet.

use std::io::{self, Read};

/// Growable byte buffer with O(1) consumption from the front. Valid data
/// is `data[start..]`; consumed bytes are reclaimed lazily.
#[derive(Debug, Default)]
pub struct Buffer {
    data: Vec<u8>,
    start: usize,
}

impl Buffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: Vec::with_capacity(capacity),
            start: 0,
        }
    }

    pub fn data(&self) -> &[u8] {
        &self.data[self.start..]
    }

    pub fn len(&self) -> usize {
        self.data.len() - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.data.capacity()
    }

    pub fn append(&mut self, bytes: &[u8]) {
        self.compact_if_wasteful(bytes.len());
        self.data.extend_from_slice(bytes);
    }

    /// Drops `n` bytes from the front.
    pub fn consume(&mut self, n: usize) {
        assert!(n <= self.len(), "cannot consume more bytes than buffered");
        self.start += n;
        if self.start == self.data.len() {
            self.data.clear();
            self.start = 0;
        }
    }

    /// Moves live bytes to the front of the allocation.
    pub fn compact(&mut self) {
        if self.start > 0 {
            self.data.drain(..self.start);
            self.start = 0;
        }
    }

    /// Ensures room for `additional` more bytes without reallocating.
    pub fn reserve(&mut self, additional: usize) {
        self.data.reserve(additional);
    }

    // Reclaim the consumed prefix when it is at least as large as the
    // live data and the append would otherwise grow the allocation.
    fn compact_if_wasteful(&mut self, incoming: usize) {
        if self.start > 0 && self.data.len() + incoming > self.data.capacity() && self.start >= self.len() {
            self.compact();
        }
    }

    /// Reads at most `max` bytes from `src` into the buffer. Returns the
    /// number read; 0 means end of stream.
    pub fn read_from<R: Read>(&mut self, src: &mut R, max: usize) -> io::Result<usize> {
        self.compact_if_wasteful(max);
        let end = self.data.len();
        self.data.resize(end + max, 0);
        match src.read(&mut self.data[end..]) {
            Ok(n) => {
                self.data.truncate(end + n);
                Ok(n)
            }
            Err(e) => {
                self.data.truncate(end);
                Err(e)
            }
        }
    }

    /// Takes the whole buffer when it holds exactly `n` bytes starting at
    /// the front of its allocation, leaving an empty buffer behind. Used to
    /// hand a large bulk argument over without copying it.
    pub fn steal_exact(&mut self, n: usize) -> Option<Vec<u8>> {
        if self.start != 0 || self.data.len() != n {
            return None;
        }
        Some(std::mem::take(&mut self.data))
    }

    /// Releases unused capacity.
    pub fn shrink(&mut self) {
        self.compact();
        self.data.shrink_to_fit();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_consume() {
        let mut b = Buffer::new();
        b.append(b"hello world");
        b.consume(6);
        assert_eq!(b.data(), b"world");
        b.append(b"!");
        assert_eq!(b.data(), b"world!");
        b.consume(6);
        assert!(b.is_empty());
        assert!(b.capacity() >= 12);
    }

    #[test]
    fn test_read_from_limits_length() {
        let mut b = Buffer::new();
        let mut src: &[u8] = b"abcdefgh";
        assert_eq!(b.read_from(&mut src, 3).unwrap(), 3);
        assert_eq!(b.read_from(&mut src, 100).unwrap(), 5);
        assert_eq!(b.read_from(&mut src, 100).unwrap(), 0);
        assert_eq!(b.data(), b"abcdefgh");
        assert_eq!(b.len(), 8);
    }

    #[test]
    fn test_steal_exact() {
        let mut b = Buffer::with_capacity(16);
        b.append(b"xxabc\r\n");
        b.consume(2);
        assert!(b.steal_exact(5).is_none());
        b.compact();
        assert_eq!(b.steal_exact(5).unwrap(), b"abc\r\n");
        assert!(b.is_empty());
    }

    #[test]
    fn test_shrink_keeps_contents() {
        let mut b = Buffer::with_capacity(64 * 1024);
        b.append(b"0123456789");
        b.consume(4);
        b.shrink();
        assert_eq!(b.data(), b"456789");
        assert!(b.capacity() < 64 * 1024);
    }
}
