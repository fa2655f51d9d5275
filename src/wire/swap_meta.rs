//! The metadata prefix of a stored object.
//!
//! Every object written to disk starts with a small self-describing prefix:
//! a marker byte, the total prefix length, and a list of type-length-value
//! records. The HTTP reply follows immediately after the prefix, so the
//! prefix length is what turns an offset in the stored reply into an offset
//! in the file.
//!
//! ```text
//! +-------+-----------------+--------+-------------+-------+-----+
//! | magic | header_len (BE) | type   | length (BE) | value | ... |
//! | 1     | 4               | 1      | 4           | len   |     |
//! +-------+-----------------+--------+-------------+-------+-----+
//! ```

use alloc::vec;
use alloc::vec::Vec;
use byteorder::{ByteOrder, NetworkEndian};

use super::{Error, Result};
use crate::entry::CacheKey;

/// The marker byte every valid prefix starts with.
pub const MAGIC: u8 = 0x03;

mod field {
    #![allow(non_snake_case)]

    use crate::wire::field::*;

    pub const MAGIC: usize = 0;
    pub const HEADER_LEN: Field = 1..5;
    pub const RECORDS: Rest = 5..;

    pub const TLV_TYPE: usize = 0;
    pub const TLV_LEN: Field = 1..5;
    pub const TLV_VALUE: Rest = 5..;
}

/// Length of the fixed part of the prefix.
pub const HEADER_LEN: usize = field::RECORDS.start;
/// Length of the fixed part of one record.
const TLV_HEADER_LEN: usize = field::TLV_VALUE.start;

/// The type of one metadata record.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum RecordType {
    /// The cache key the object was stored under.
    Key,
    /// Size of the whole stored object, prefix included.
    ObjectSize,
    Unknown(u8),
}

impl From<u8> for RecordType {
    fn from(value: u8) -> Self {
        match value {
            0x03 => RecordType::Key,
            0x0a => RecordType::ObjectSize,
            other => RecordType::Unknown(other),
        }
    }
}

impl From<RecordType> for u8 {
    fn from(value: RecordType) -> Self {
        match value {
            RecordType::Key => 0x03,
            RecordType::ObjectSize => 0x0a,
            RecordType::Unknown(other) => other,
        }
    }
}

/// A read/write wrapper around a metadata prefix buffer.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct Packet<T: AsRef<[u8]>> {
    buffer: T,
}

impl<T: AsRef<[u8]>> Packet<T> {
    /// Imbue a raw octet buffer with metadata prefix structure.
    pub const fn new_unchecked(buffer: T) -> Packet<T> {
        Packet { buffer }
    }

    /// Shorthand for a combination of [new_unchecked] and [check_len].
    ///
    /// [new_unchecked]: #method.new_unchecked
    /// [check_len]: #method.check_len
    pub fn new_checked(buffer: T) -> Result<Packet<T>> {
        let packet = Self::new_unchecked(buffer);
        packet.check_len()?;
        Ok(packet)
    }

    /// Ensure that no accessor method will panic if called.
    ///
    /// Returns `Err(Error::Truncated)` if the buffer is shorter than the fixed
    /// part or than the length the prefix declares, and `Err(Error::Malformed)`
    /// if the declared length cannot even hold the fixed part.
    pub fn check_len(&self) -> Result<()> {
        let len = self.buffer.as_ref().len();
        if len < HEADER_LEN {
            return Err(Error::Truncated);
        }
        let header_len = self.header_len();
        if header_len < HEADER_LEN {
            Err(Error::Malformed)
        } else if len < header_len {
            Err(Error::Truncated)
        } else {
            Ok(())
        }
    }

    /// Return the marker byte.
    #[inline]
    pub fn magic(&self) -> u8 {
        self.buffer.as_ref()[field::MAGIC]
    }

    /// Return the total prefix length, fixed part included.
    #[inline]
    pub fn header_len(&self) -> usize {
        let data = self.buffer.as_ref();
        NetworkEndian::read_u32(&data[field::HEADER_LEN]) as usize
    }

    /// Return the record area.
    ///
    /// # Panics
    /// This function may panic if the buffer was not checked with [check_len](#method.check_len).
    #[inline]
    pub fn records(&self) -> &[u8] {
        let data = self.buffer.as_ref();
        &data[field::RECORDS.start..self.header_len()]
    }
}

impl<T: AsRef<[u8]> + AsMut<[u8]>> Packet<T> {
    #[inline]
    pub fn set_magic(&mut self, value: u8) {
        self.buffer.as_mut()[field::MAGIC] = value
    }

    #[inline]
    pub fn set_header_len(&mut self, value: usize) {
        let data = self.buffer.as_mut();
        NetworkEndian::write_u32(&mut data[field::HEADER_LEN], value as u32)
    }
}

/// An iterator over the records of a checked prefix.
#[derive(Debug)]
pub struct Records<'a> {
    data: &'a [u8],
}

impl<'a> Iterator for Records<'a> {
    type Item = Result<(RecordType, &'a [u8])>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.data.is_empty() {
            return None;
        }
        if self.data.len() < TLV_HEADER_LEN {
            self.data = &[];
            return Some(Err(Error::Malformed));
        }
        let kind = RecordType::from(self.data[field::TLV_TYPE]);
        let len = NetworkEndian::read_u32(&self.data[field::TLV_LEN]) as usize;
        let rest = &self.data[field::TLV_VALUE];
        if rest.len() < len {
            self.data = &[];
            return Some(Err(Error::Malformed));
        }
        let (value, rest) = rest.split_at(len);
        self.data = rest;
        Some(Ok((kind, value)))
    }
}

/// A high-level representation of a metadata prefix.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct Repr {
    pub key: Option<CacheKey>,
    pub object_size: Option<u64>,
}

impl Repr {
    /// Parse a metadata prefix and return a high-level representation.
    ///
    /// Unknown record types are skipped. The returned length is the total
    /// prefix length, which is where the stored reply starts.
    pub fn parse<T>(packet: &Packet<&T>) -> Result<(Repr, usize)>
    where
        T: AsRef<[u8]> + ?Sized,
    {
        packet.check_len()?;
        if packet.magic() != MAGIC {
            return Err(Error::BadMagic);
        }

        let mut repr = Repr {
            key: None,
            object_size: None,
        };
        let records = Records {
            data: packet.records(),
        };
        for record in records {
            match record? {
                (RecordType::Key, value) => {
                    let key: [u8; 16] = value.try_into().map_err(|_| Error::Malformed)?;
                    repr.key = Some(CacheKey(key));
                }
                (RecordType::ObjectSize, value) => {
                    let size: [u8; 8] = value.try_into().map_err(|_| Error::Malformed)?;
                    repr.object_size = Some(NetworkEndian::read_u64(&size));
                }
                (RecordType::Unknown(kind), _) => {
                    store_trace!("skipping unknown swap metadata record type {}", kind);
                }
            }
        }
        Ok((repr, packet.header_len()))
    }

    /// Return the length of a prefix that will be emitted from this high-level representation.
    pub fn buffer_len(&self) -> usize {
        let mut len = HEADER_LEN;
        if self.key.is_some() {
            len += TLV_HEADER_LEN + 16;
        }
        if self.object_size.is_some() {
            len += TLV_HEADER_LEN + 8;
        }
        len
    }

    /// Emit a high-level representation into a metadata prefix.
    ///
    /// # Panics
    /// This function panics if `packet` is shorter than [buffer_len](#method.buffer_len).
    pub fn emit<T>(&self, packet: &mut Packet<&mut T>)
    where
        T: AsRef<[u8]> + AsMut<[u8]> + ?Sized,
    {
        packet.set_magic(MAGIC);
        packet.set_header_len(self.buffer_len());

        let data = packet.buffer.as_mut();
        let mut at = HEADER_LEN;
        let mut put = |kind: RecordType, value: &[u8]| {
            data[at] = kind.into();
            NetworkEndian::write_u32(&mut data[at + 1..at + TLV_HEADER_LEN], value.len() as u32);
            data[at + TLV_HEADER_LEN..at + TLV_HEADER_LEN + value.len()].copy_from_slice(value);
            at += TLV_HEADER_LEN + value.len();
        };
        if let Some(key) = self.key {
            put(RecordType::Key, &key.0);
        }
        if let Some(size) = self.object_size {
            let mut bytes = [0u8; 8];
            NetworkEndian::write_u64(&mut bytes, size);
            put(RecordType::ObjectSize, &bytes);
        }
    }

    /// Emit the prefix into a freshly allocated buffer.
    pub fn to_vec(&self) -> Vec<u8> {
        let mut bytes = vec![0u8; self.buffer_len()];
        self.emit(&mut Packet::new_unchecked(&mut bytes[..]));
        bytes
    }
}
