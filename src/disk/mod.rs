/*! Access to stored objects on disk.

The `disk` module describes the collaborator that actually performs disk
I/O. The store never blocks on it: [Disk::read] only starts a read, and the
outcome is collected later through [Disk::poll_read], from inside
[Store::poll](../store/struct.Store.html#method.poll).

A [Loopback] implementation keeps "files" in memory and completes reads
on the next poll, which is what the tests (and simple embedders) use.
*/

use alloc::vec::Vec;
use core::fmt;

use crate::store::ClientHandle;

mod loopback;

pub use self::loopback::Loopback;

/// Identifies an object file on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SwapFile(pub u32);

impl fmt::Display for SwapFile {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:08X}", self.0)
    }
}

/// Why a swap-in handle is being closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The reader is done with the object.
    ReaderDone,
    /// The reader gave up after an error.
    ReaderFailed,
}

/// A failed disk operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiskError {
    /// The file does not exist.
    NotFound,
    /// The device reported an I/O error.
    Io,
}

impl fmt::Display for DiskError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            DiskError::NotFound => write!(f, "no such file"),
            DiskError::Io => write!(f, "I/O error"),
        }
    }
}

impl core::error::Error for DiskError {}

/// The outcome of one read started with [Disk::read].
///
/// An empty `Ok` buffer means the read hit the end of the file.
#[derive(Debug, PartialEq, Eq)]
pub struct ReadCompletion {
    pub token: ClientHandle,
    pub result: Result<Vec<u8>, DiskError>,
}

/// The disk collaborator.
pub trait Disk {
    /// An open file.
    type Handle: fmt::Debug;

    /// Open a stored object for reading.
    fn open(&mut self, file: SwapFile) -> Option<Self::Handle>;

    /// Start reading up to `len` bytes at `offset`.
    ///
    /// The read completes later, through [poll_read](#tymethod.poll_read),
    /// carrying `token` back.
    fn read(&mut self, handle: &Self::Handle, offset: u64, len: usize, token: ClientHandle);

    /// Return the next finished read, if any.
    fn poll_read(&mut self) -> Option<ReadCompletion>;

    /// Close a handle returned by [open](#tymethod.open).
    fn close(&mut self, handle: Self::Handle, reason: CloseReason);

    /// Store a whole object, metadata prefix included.
    fn write(&mut self, file: SwapFile, data: &[u8]) -> Result<(), DiskError>;
}
