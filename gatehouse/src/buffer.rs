//! Application buffer pairs.
//!
//! Each connection owns one read/write pair drawn from the buffer pool.
//! Growth goes through `try_reserve` so allocation failure is an error the
//! caller can react to (release the parachute, drop caches) instead of an
//! abort.

use crate::error::{Error, Result};

/// A read/write buffer pair attached to one connection.
#[derive(Debug)]
pub struct BufferPair {
    read: Vec<u8>,
    write: Vec<u8>,
}

impl BufferPair {
    /// Allocate a pair with the given capacities.
    pub fn new(read_size: usize, write_size: usize) -> Result<Self> {
        let mut read = Vec::new();
        read.try_reserve_exact(read_size)
            .map_err(|_| Error::BufferExhausted)?;
        let mut write = Vec::new();
        write
            .try_reserve_exact(write_size)
            .map_err(|_| Error::BufferExhausted)?;
        Ok(Self { read, write })
    }

    /// The read buffer.
    pub fn read(&mut self) -> &mut Vec<u8> {
        &mut self.read
    }

    /// The write buffer.
    pub fn write(&mut self) -> &mut Vec<u8> {
        &mut self.write
    }

    /// Bytes of capacity held by both buffers.
    pub fn capacity(&self) -> usize {
        self.read.capacity() + self.write.capacity()
    }

    /// Clear both buffers, keeping their capacity.
    pub fn reset(&mut self) {
        self.read.clear();
        self.write.clear();
    }
}

/// Ensure `buf` has room for `needed` more bytes beyond its current length.
///
/// The buffer is left in place when it already has the room; otherwise it
/// grows, preserving contents. Growth failure is reported, not aborted.
pub fn expand(buf: &mut Vec<u8>, needed: usize) -> Result<()> {
    let room = buf.capacity() - buf.len();
    if room >= needed {
        return Ok(());
    }
    buf.try_reserve(needed).map_err(|_| Error::BufferExhausted)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pair_reports_capacity() {
        let pair = BufferPair::new(4096, 1024).unwrap();
        assert!(pair.capacity() >= 5120);
    }

    #[test]
    fn reset_keeps_capacity() {
        let mut pair = BufferPair::new(64, 64).unwrap();
        pair.read().extend_from_slice(b"hello");
        let cap = pair.capacity();
        pair.reset();
        assert!(pair.read().is_empty());
        assert_eq!(pair.capacity(), cap);
    }

    #[test]
    fn expand_keeps_buffer_when_room_exists() {
        let mut buf = Vec::with_capacity(128);
        buf.extend_from_slice(b"abc");
        let ptr = buf.as_ptr();
        expand(&mut buf, 64).unwrap();
        assert_eq!(buf.as_ptr(), ptr);
        assert_eq!(&buf[..3], b"abc");
    }

    #[test]
    fn expand_preserves_contents_on_growth() {
        let mut buf = Vec::with_capacity(4);
        buf.extend_from_slice(b"abcd");
        expand(&mut buf, 1024).unwrap();
        assert!(buf.capacity() - buf.len() >= 1024);
        assert_eq!(&buf[..4], b"abcd");
    }
}
