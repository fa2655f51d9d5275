/*! Cache entries.

A cache entry is one cached (or being-cached) response object. It is owned
by the [Store](../store/struct.Store.html) and shared by every reader
attached to it; readers hold a lock on the entry for as long as they are
registered, so an entry with readers is never released.
*/

use core::fmt;

use bitflags::bitflags;

use crate::disk::SwapFile;
use crate::wire::{self, SwapMetaPacket, SwapMetaRepr};

mod mem_object;

pub use self::mem_object::{MemObject, ParseState, Reply};

/// The key an entry is cached under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct CacheKey(pub [u8; 16]);

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{:02X}", byte)?;
        }
        Ok(())
    }
}

/// Whether more bytes may still arrive for an entry.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum EntryStatus {
    /// The producer is still appending.
    Pending,
    /// No more bytes will arrive, either because the fetch finished or
    /// because it was aborted.
    Complete,
}

/// Progress of writing an entry to disk.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum SwapStatus {
    None,
    Writing,
    Done,
    Failed,
}

bitflags! {
    /// Entry flags.
    pub struct EntryFlags: u8 {
        /// The fetch was abandoned before completion.
        const ABORTED = 0b001;
        /// An internal object that is always fetched to completion.
        const SPECIAL = 0b010;
        /// A per-request object that no other request may share.
        const PRIVATE = 0b100;
    }
}

bitflags! {
    /// Flags of the request that is filling an entry.
    pub struct RequestFlags: u8 {
        /// The reply may be stored for future requests.
        const CACHABLE = 0b01;
        /// The request asked for a byte range.
        const RANGE = 0b10;
    }
}

/// One cached (or being-cached) response object.
#[derive(Debug)]
pub struct CacheEntry {
    key: CacheKey,
    pub(crate) status: EntryStatus,
    pub(crate) flags: EntryFlags,
    pub(crate) request: Option<RequestFlags>,
    pub(crate) swap_file: Option<SwapFile>,
    pub(crate) swap_status: SwapStatus,
    pub(crate) swap_file_sz: Option<u64>,
    pub(crate) object_len: Option<u64>,
    pub(crate) transient_readers: u32,
    lock_count: u32,
    pub(crate) mem: MemObject,
}

impl CacheEntry {
    /// Create a pending entry that a producer is about to fill.
    pub fn new(key: CacheKey, request: Option<RequestFlags>, flags: EntryFlags) -> CacheEntry {
        CacheEntry {
            key,
            status: EntryStatus::Pending,
            flags,
            request,
            swap_file: None,
            swap_status: SwapStatus::None,
            swap_file_sz: None,
            object_len: None,
            transient_readers: 0,
            lock_count: 0,
            mem: MemObject::default(),
        }
    }

    /// Create a complete entry whose bytes live on disk only.
    pub fn on_disk(key: CacheKey, file: SwapFile, swap_file_sz: u64) -> CacheEntry {
        let mut entry = CacheEntry::new(key, None, EntryFlags::empty());
        entry.status = EntryStatus::Complete;
        entry.swap_file = Some(file);
        entry.swap_status = SwapStatus::Done;
        entry.swap_file_sz = Some(swap_file_sz);
        entry
    }

    pub fn key(&self) -> CacheKey {
        self.key
    }

    pub fn status(&self) -> EntryStatus {
        self.status
    }

    pub fn flags(&self) -> EntryFlags {
        self.flags
    }

    pub fn request_flags(&self) -> Option<RequestFlags> {
        self.request
    }

    pub fn is_aborted(&self) -> bool {
        self.flags.contains(EntryFlags::ABORTED)
    }

    pub fn swap_status(&self) -> SwapStatus {
        self.swap_status
    }

    pub fn swap_file(&self) -> Option<SwapFile> {
        self.swap_file
    }

    /// Query whether the entry has (or is getting) a copy on disk.
    pub fn has_disk(&self) -> bool {
        self.swap_file.is_some()
    }

    pub fn swapout_failed(&self) -> bool {
        self.swap_status == SwapStatus::Failed
    }

    pub fn swapped_out(&self) -> bool {
        self.swap_status == SwapStatus::Done
    }

    /// Query whether the entry could still be read back from disk.
    pub fn swap_in_able(&self) -> bool {
        self.has_disk() && !self.swapout_failed()
    }

    /// Return the length of the stored reply (head and body), if known.
    pub fn object_len(&self) -> Option<u64> {
        self.object_len
    }

    /// Return the length of the body, if known.
    pub fn content_len(&self) -> Option<u64> {
        let hdr_sz = self.mem.base_reply().hdr_sz();
        self.object_len.map(|len| len.saturating_sub(hdr_sz))
    }

    /// Return the number of readers in other processes.
    pub fn transient_readers(&self) -> u32 {
        self.transient_readers
    }

    pub fn mem(&self) -> &MemObject {
        &self.mem
    }

    pub fn mem_mut(&mut self) -> &mut MemObject {
        &mut self.mem
    }

    pub fn lock(&mut self, tag: &str) {
        self.lock_count += 1;
        store_trace!("{}: locked by {} ({})", self.key, tag, self.lock_count);
    }

    /// Release one lock and return how many remain.
    ///
    /// # Panics
    /// This function panics if the entry is not locked.
    pub fn unlock(&mut self, tag: &str) -> u32 {
        assert!(self.lock_count > 0, "unlocking an unlocked entry");
        self.lock_count -= 1;
        store_trace!("{}: unlocked by {} ({})", self.key, tag, self.lock_count);
        self.lock_count
    }

    pub fn lock_count(&self) -> u32 {
        self.lock_count
    }

    /// Unpack the metadata prefix at the start of a stored object.
    ///
    /// On success the prefix length is recorded, the object length becomes
    /// known, and the prefix length is returned.
    pub fn unpack_swap_meta(&mut self, buffer: &[u8]) -> wire::Result<usize> {
        let packet = SwapMetaPacket::new_checked(buffer)?;
        let (repr, header_len) = SwapMetaRepr::parse(&packet)?;

        match repr.key {
            Some(key) if key == self.key => {}
            Some(key) => {
                store_warn!("{}: stored object has key {}", self.key, key);
                return Err(wire::Error::Inconsistent);
            }
            None => return Err(wire::Error::Inconsistent),
        }
        if self.swap_file_sz.is_none() {
            self.swap_file_sz = repr.object_size;
        }

        if let Some(size) = self.swap_file_sz {
            let object_len = size
                .checked_sub(header_len as u64)
                .ok_or(wire::Error::Inconsistent)?;
            self.object_len = Some(object_len);
        }
        self.mem.swap_hdr_sz = header_len as u64;
        Ok(header_len)
    }
}
