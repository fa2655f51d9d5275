//! Parsing buffer implementation.
//!
//! A `ParsingBuffer` accumulates bytes that arrive in pieces (typically from
//! several disk reads) until they can be interpreted or handed to a reader.
//! It never wraps around: consumed bytes leave a gap at the front, and the
//! gap is reclaimed on demand by moving the content back to the start.

use alloc::vec;
use alloc::vec::Vec;
use managed::ManagedSlice;

use super::Full;

/// An append-only accumulator with consume-from-front.
///
/// The capacity is fixed by the storage the reader supplies. Only
/// [grow_space](#method.grow_space) may enlarge it, and it does so by moving
/// the content into owned memory; this is how a reply head larger than the
/// reader's buffer is assembled.
///
/// # Layout
///
/// ```text
/// [consumed][content][space]
/// ^0        ^read_at        ^capacity
/// ```
#[derive(Debug)]
pub struct ParsingBuffer<'a> {
    storage: ManagedSlice<'a, u8>,
    /// Position of the first unconsumed byte.
    read_at: usize,
    /// Number of content bytes.
    length: usize,
    /// Capacity of the storage originally supplied by the reader.
    reader_capacity: usize,
}

impl<'a> ParsingBuffer<'a> {
    /// Create a parsing buffer over the given storage.
    pub fn new<S>(storage: S) -> ParsingBuffer<'a>
    where
        S: Into<ManagedSlice<'a, u8>>,
    {
        let storage = storage.into();
        let reader_capacity = storage.len();
        ParsingBuffer {
            storage,
            read_at: 0,
            length: 0,
            reader_capacity,
        }
    }

    /// Create a parsing buffer owning `capacity` zeroed bytes.
    pub fn with_capacity(capacity: usize) -> ParsingBuffer<'static> {
        ParsingBuffer::new(vec![0u8; capacity])
    }

    /// Return the current capacity, including any grown space.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.storage.len()
    }

    /// Return the capacity the reader asked for.
    #[inline]
    pub fn reader_capacity(&self) -> usize {
        self.reader_capacity
    }

    /// Return the number of content bytes.
    #[inline]
    pub fn content_size(&self) -> usize {
        self.length
    }

    /// Return the number of bytes that can still be appended.
    #[inline]
    pub fn space_size(&self) -> usize {
        self.capacity() - self.length
    }

    /// Query whether the buffer holds no content.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Return the content bytes.
    pub fn content(&self) -> &[u8] {
        &self.storage[self.read_at..self.read_at + self.length]
    }

    /// Move the content to the front if the tail alone cannot hold `size` bytes.
    /// Returns true if compaction occurred.
    fn compact_if_needed(&mut self, size: usize) -> bool {
        if self.read_at + self.length + size > self.capacity() && self.read_at > 0 {
            if self.length > 0 {
                self.storage
                    .copy_within(self.read_at..self.read_at + self.length, 0);
            }
            self.read_at = 0;
            true
        } else {
            false
        }
    }

    /// Return all unused bytes as one contiguous slice, compacting first
    /// if any were consumed.
    ///
    /// Bytes written into the slice become content only after
    /// [appended](#method.appended).
    pub fn space_mut(&mut self) -> &mut [u8] {
        let space = self.space_size();
        self.compact_if_needed(space);
        let write_at = self.read_at + self.length;
        &mut self.storage[write_at..]
    }

    /// Mark `count` bytes written into [space_mut](#method.space_mut) as content.
    ///
    /// # Panics
    /// This function panics if `count` exceeds the tail of the buffer.
    pub fn appended(&mut self, count: usize) {
        assert!(self.read_at + self.length + count <= self.capacity());
        self.length += count;
    }

    /// Append all of `data`, or nothing if it does not fit.
    pub fn append(&mut self, data: &[u8]) -> Result<(), Full> {
        if data.len() > self.space_size() {
            return Err(Full);
        }
        self.compact_if_needed(data.len());
        let write_at = self.read_at + self.length;
        self.storage[write_at..write_at + data.len()].copy_from_slice(data);
        self.length += data.len();
        Ok(())
    }

    /// Drop `count` bytes from the front of the content.
    ///
    /// # Panics
    /// This function panics if `count` exceeds the content size.
    pub fn consume(&mut self, count: usize) {
        assert!(count <= self.length);
        self.length -= count;
        self.read_at += count;
        if self.length == 0 {
            self.read_at = 0;
        }
    }

    /// Make room for at least `min_space` more bytes.
    ///
    /// Reader-supplied storage is never reallocated in place; when it is too
    /// small the content moves into owned memory that is large enough.
    pub fn grow_space(&mut self, min_space: usize) {
        if self.space_size() >= min_space {
            return;
        }
        let mut grown = vec![0u8; self.length + min_space];
        grown[..self.length].copy_from_slice(self.content());
        store_trace!(
            "parsing buffer grows from {} to {} bytes",
            self.capacity(),
            grown.len()
        );
        self.storage = ManagedSlice::Owned(grown);
        self.read_at = 0;
    }

    /// Discard all content.
    pub fn clear(&mut self) {
        self.read_at = 0;
        self.length = 0;
    }

    /// Take out at most `limit` content bytes, leaving the buffer empty.
    pub fn pack_back(&mut self, limit: usize) -> Vec<u8> {
        let size = core::cmp::min(limit, self.length);
        let packed = self.content()[..size].to_vec();
        self.clear();
        packed
    }
}

impl<'a> From<ManagedSlice<'a, u8>> for ParsingBuffer<'a> {
    fn from(slice: ManagedSlice<'a, u8>) -> Self {
        ParsingBuffer::new(slice)
    }
}

impl<'a> From<Vec<u8>> for ParsingBuffer<'a> {
    fn from(vec: Vec<u8>) -> Self {
        ParsingBuffer::new(vec)
    }
}
