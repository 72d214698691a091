//! Fixed-capacity circular byte buffer.
//!
//! Read and write positions only ever grow; the slot of a position is
//! `pos % capacity`, and `write - read` is the number of buffered bytes.
//! Writes never overwrite unread data: a write larger than the free space is
//! truncated and the short count is the caller's backpressure signal.

use bytes::Bytes;

use crate::error::RingError;

/// Default ring capacity (128 KiB)
pub const DEFAULT_RING_CAPACITY: usize = 128 * 1024;

/// Circular byte buffer
#[derive(Debug, Clone)]
pub struct RingBuffer {
    storage: Box<[u8]>,
    read_pos: u64,
    write_pos: u64,
}

impl RingBuffer {
    /// Create a buffer holding at most `capacity` bytes
    pub fn new(capacity: usize) -> Self {
        Self {
            storage: vec![0u8; capacity.max(1)].into_boxed_slice(),
            read_pos: 0,
            write_pos: 0,
        }
    }

    /// Fixed capacity
    pub fn capacity(&self) -> usize {
        self.storage.len()
    }

    /// Bytes currently buffered
    pub fn len(&self) -> usize {
        (self.write_pos - self.read_pos) as usize
    }

    /// Whether nothing is buffered
    pub fn is_empty(&self) -> bool {
        self.write_pos == self.read_pos
    }

    /// Free space
    pub fn available_space(&self) -> usize {
        self.capacity() - self.len()
    }

    /// Whether at least `len` bytes are buffered
    pub fn has_available(&self, len: usize) -> bool {
        self.len() >= len
    }

    /// Fill level in `[0, 1]`
    pub fn usage_ratio(&self) -> f64 {
        self.len() as f64 / self.capacity() as f64
    }

    /// Append as much of `data` as fits; returns the number of bytes taken
    pub fn write(&mut self, data: &[u8]) -> usize {
        let n = data.len().min(self.available_space());
        if n == 0 {
            return 0;
        }

        let cap = self.capacity();
        let start = (self.write_pos % cap as u64) as usize;
        let first = n.min(cap - start);
        self.storage[start..start + first].copy_from_slice(&data[..first]);
        if first < n {
            self.storage[..n - first].copy_from_slice(&data[first..n]);
        }

        self.write_pos += n as u64;
        n
    }

    /// Copy `len` bytes without consuming them
    pub fn peek(&self, len: usize) -> Result<Bytes, RingError> {
        self.ensure(len)?;
        let mut out = Vec::with_capacity(len);
        let (a, b) = self.readable_slices(len);
        out.extend_from_slice(a);
        out.extend_from_slice(b);
        Ok(Bytes::from(out))
    }

    /// Consume and return `len` bytes
    pub fn read(&mut self, len: usize) -> Result<Bytes, RingError> {
        let out = self.peek(len)?;
        self.read_pos += len as u64;
        Ok(out)
    }

    /// Discard `len` bytes
    pub fn skip(&mut self, len: usize) -> Result<(), RingError> {
        self.ensure(len)?;
        self.read_pos += len as u64;
        Ok(())
    }

    /// Drop all buffered bytes
    pub fn reset(&mut self) {
        self.read_pos = 0;
        self.write_pos = 0;
    }

    fn ensure(&self, len: usize) -> Result<(), RingError> {
        let available = self.len();
        if len > available {
            return Err(RingError::InsufficientData {
                requested: len,
                available,
            });
        }
        Ok(())
    }

    fn readable_slices(&self, len: usize) -> (&[u8], &[u8]) {
        let cap = self.capacity();
        let start = (self.read_pos % cap as u64) as usize;
        let first = len.min(cap - start);
        (
            &self.storage[start..start + first],
            &self.storage[..len - first],
        )
    }
}

impl Default for RingBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_RING_CAPACITY)
    }
}
