use alloc::vec::Vec;
use core::task::Waker;

use crate::store::ClientHandle;
use crate::wire::{self, ReplyHead};

/// Parsing progress of the shared reply head.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum ParseState {
    Start,
    Parsed,
}

/// The reply head every reader of an entry shares.
///
/// Whoever first sees the complete head (the producer appending bytes, or
/// the first disk reader of a stored object) parses it here; everyone else
/// only reads it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reply {
    pstate: ParseState,
    status: u16,
    hdr_sz: u64,
    content_length: Option<u64>,
}

impl Default for Reply {
    fn default() -> Self {
        Reply {
            pstate: ParseState::Start,
            status: 0,
            hdr_sz: 0,
            content_length: None,
        }
    }
}

impl Reply {
    pub fn parse_state(&self) -> ParseState {
        self.pstate
    }

    /// Query whether the head has been parsed.
    pub fn is_parsed(&self) -> bool {
        self.pstate == ParseState::Parsed
    }

    /// Return the status code, or 0 before the head is parsed.
    pub fn status(&self) -> u16 {
        self.status
    }

    /// Return the head length, or 0 before the head is parsed.
    pub fn hdr_sz(&self) -> u64 {
        self.hdr_sz
    }

    /// Return the declared body length, if known.
    pub fn content_length(&self) -> Option<u64> {
        self.content_length
    }

    /// Parse the head from a prefix of the stored reply.
    ///
    /// Returns `Ok(true)` once parsed (and on every later call), `Ok(false)`
    /// if more bytes are needed. A head exceeding `max_len` is an error.
    pub fn parse_terminated_prefix(&mut self, buffer: &[u8], max_len: usize) -> wire::Result<bool> {
        if self.is_parsed() {
            return Ok(true);
        }
        match ReplyHead::parse(buffer, max_len)? {
            Some(head) => {
                self.set_head(head);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub(crate) fn set_head(&mut self, head: ReplyHead) {
        self.pstate = ParseState::Parsed;
        self.status = head.status;
        self.hdr_sz = head.header_len as u64;
        self.content_length = head.content_length;
    }
}

/// The in-memory part of a cache entry.
///
/// Memory holds the stored reply (head followed by body) for the byte range
/// `[lowest_cached_offset, end_offset)`. Only the producer appends to it, with
/// one exception: the first disk reader may mirror what it read, as long as
/// nothing was cached before and the bytes continue exactly at the end.
#[derive(Debug, Default)]
pub struct MemObject {
    inmem_lo: u64,
    data: Vec<u8>,
    reply: Reply,
    /// Length of the metadata prefix of the stored object, 0 until known.
    pub(crate) swap_hdr_sz: u64,
    /// Registered readers, in registration order.
    pub(crate) clients: Vec<ClientHandle>,
    read_waker: Option<Waker>,
}

impl MemObject {
    /// Return the offset just past the last byte in memory.
    pub fn end_offset(&self) -> u64 {
        self.inmem_lo + self.data.len() as u64
    }

    /// Return the offset of the first byte still in memory.
    pub fn lowest_cached_offset(&self) -> u64 {
        self.inmem_lo
    }

    /// Query whether `offset` falls inside the cached range.
    pub fn contains(&self, offset: u64) -> bool {
        self.inmem_lo <= offset && offset < self.end_offset()
    }

    /// Copy bytes starting at `offset` into `dst`, returning how many were copied.
    pub fn copy(&self, offset: u64, dst: &mut [u8]) -> usize {
        if !self.contains(offset) {
            return 0;
        }
        let start = (offset - self.inmem_lo) as usize;
        let size = core::cmp::min(dst.len(), self.data.len() - start);
        dst[..size].copy_from_slice(&self.data[start..start + size]);
        size
    }

    /// Return the cached bytes from `offset` to the end.
    pub fn bytes_from(&self, offset: u64) -> &[u8] {
        if !self.contains(offset) {
            return &[];
        }
        &self.data[(offset - self.inmem_lo) as usize..]
    }

    /// Append `data` at `offset`.
    ///
    /// Writes that would leave a gap or overlap cached bytes are refused, so
    /// writing the same bytes twice stores them once.
    pub fn write(&mut self, offset: u64, data: &[u8]) -> bool {
        if offset != self.end_offset() {
            store_trace!(
                "refusing memory write at {}, end is {}",
                offset,
                self.end_offset()
            );
            return false;
        }
        self.data.extend_from_slice(data);
        true
    }

    /// Drop cached bytes below `offset`.
    pub fn trim_to(&mut self, offset: u64) {
        if offset <= self.inmem_lo {
            return;
        }
        let drop = core::cmp::min(offset - self.inmem_lo, self.data.len() as u64) as usize;
        self.data.drain(..drop);
        self.inmem_lo = offset;
    }

    pub fn base_reply(&self) -> &Reply {
        &self.reply
    }

    pub fn adjustable_base_reply(&mut self) -> &mut Reply {
        &mut self.reply
    }

    /// Parse the shared reply head from the cached bytes, if they start at 0.
    pub fn parse_reply(&mut self, max_len: usize) -> wire::Result<bool> {
        if self.inmem_lo != 0 {
            return Ok(self.reply.is_parsed());
        }
        self.reply.parse_terminated_prefix(&self.data, max_len)
    }

    /// Return the number of registered readers.
    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Register the producer's waker, woken when readers make room for more bytes.
    pub fn register_read_waker(&mut self, waker: &Waker) {
        match &self.read_waker {
            Some(old) if old.will_wake(waker) => {}
            _ => self.read_waker = Some(waker.clone()),
        }
    }

    /// Number of bytes the producer may append before running too far ahead
    /// of the slowest reader.
    pub fn read_ahead_allowance(&self, lowest_reader: u64, gap: u64) -> u64 {
        lowest_reader.saturating_add(gap).saturating_sub(self.end_offset())
    }

    /// Wake a producer that stopped appending because of read-ahead limits.
    pub fn kick_reads(&mut self, lowest_reader: u64, gap: u64) {
        if self.read_ahead_allowance(lowest_reader, gap) == 0 {
            return;
        }
        if let Some(waker) = self.read_waker.take() {
            store_trace!("kicking deferred reads below offset {}", lowest_reader);
            waker.wake();
        }
    }
}
