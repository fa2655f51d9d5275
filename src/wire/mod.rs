/*! Low-level data formats.

The `wire` module deals with the byte layouts this crate has to read and
write: the metadata prefix that precedes every object stored on disk, and
the head of an HTTP reply as it appears at the start of a stored object.

Both layouts follow the same pattern. A `Packet` wrapper (where the layout
has fixed fields) gives checked access to a byte buffer, and a high-level
representation is obtained with `parse` and written back with `emit`.
Parsing never panics on malformed input; it returns an [Error].
*/

use core::fmt;

pub mod http;
pub mod swap_meta;

pub use self::http::ReplyHead;
pub use self::swap_meta::{Packet as SwapMetaPacket, Repr as SwapMetaRepr};

mod field {
    pub type Field = core::ops::Range<usize>;
    pub type Rest = core::ops::RangeFrom<usize>;
}

/// The error type for parsing of stored objects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// The buffer ends before the structure it describes.
    Truncated,
    /// The metadata prefix does not start with the expected marker.
    BadMagic,
    /// The metadata describes a different object than the one being read.
    Inconsistent,
    /// The bytes do not follow the expected grammar.
    Malformed,
    /// The structure exceeds the configured size limit.
    TooLarge,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Truncated => write!(f, "truncated"),
            Error::BadMagic => write!(f, "bad metadata marker"),
            Error::Inconsistent => write!(f, "metadata inconsistent with entry"),
            Error::Malformed => write!(f, "malformed"),
            Error::TooLarge => write!(f, "too large"),
        }
    }
}

impl core::error::Error for Error {}

pub type Result<T> = core::result::Result<T, Error>;
