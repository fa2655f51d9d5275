/*! Readers of cache entries.

A reader is the cursor of one consumer into one entry. The consumer asks for
a range with [Store::copy](../store/struct.Store.html#method.copy) and gets
exactly one [StoreIoBuffer] back through its callback, after which it may ask
for the next range. The first answer hands over the reply head (available
from the entry itself) together with any body bytes that were ready; the
data of every answer is body bytes only, and `offset` counts from the start
of the body.

A reader comes in two kinds. A memory reader only ever copies bytes the
entry holds in memory. A disk reader may also read the stored object back
from the [Disk](../disk/trait.Disk.html), opening it on first need.
*/

use alloc::boxed::Box;
use alloc::vec::Vec;

use bitflags::bitflags;

use crate::disk::Disk;
use crate::store::{ClientHandle, Store};

mod store_client;

#[cfg(test)]
mod tests;

pub use self::store_client::StoreClient;

/// Where a reader may get its bytes from.
#[derive(Debug)]
pub enum ClientKind<H> {
    /// Memory only.
    Memory,
    /// Memory first, the stored object otherwise. The swap-in handle is
    /// opened on first need.
    Disk { swapin: Option<H> },
}

impl<H> ClientKind<H> {
    pub fn is_disk(&self) -> bool {
        matches!(self, ClientKind::Disk { .. })
    }
}

/// The range a consumer asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CopyRequest {
    /// Body offset of the first wanted byte.
    pub offset: u64,
    /// Largest number of bytes wanted.
    pub length: usize,
}

impl CopyRequest {
    pub const fn new(offset: u64, length: usize) -> CopyRequest {
        CopyRequest { offset, length }
    }
}

bitflags! {
    /// Flags of a delivered [StoreIoBuffer].
    pub struct IoFlags: u8 {
        /// The request failed; `data` is empty.
        const ERROR = 0b01;
        /// Nothing follows `data`.
        const EOF = 0b10;
    }
}

/// The answer to one copy request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreIoBuffer {
    pub data: Vec<u8>,
    /// Body offset of `data`, as requested.
    pub offset: u64,
    pub flags: IoFlags,
}

impl StoreIoBuffer {
    pub fn is_error(&self) -> bool {
        self.flags.contains(IoFlags::ERROR)
    }

    pub fn is_eof(&self) -> bool {
        self.flags.contains(IoFlags::EOF)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// A consumer callback.
///
/// It runs from [Store::poll](../store/struct.Store.html#method.poll) and
/// may call back into the store, including to unregister the reader or to
/// ask for the next range.
pub type Callback<D> = Box<dyn FnOnce(&mut Store<D>, ClientHandle, StoreIoBuffer)>;

bitflags! {
    /// Progress flags of a reader.
    pub struct ClientFlags: u8 {
        /// A disk read was started and did not complete yet.
        const DISK_IO_PENDING = 0b01;
        /// The reader is deciding where its next bytes come from.
        const STORE_COPYING = 0b10;
    }
}

/// The kind of disk read in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReadKind {
    /// Reading the start of the stored object, metadata prefix included.
    Header,
    /// Reading reply bytes past the metadata prefix.
    Body,
}
