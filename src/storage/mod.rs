/*! Specialized containers.

The `storage` module provides the containers readers use to collect bytes
before handing them over. They work both over reader-supplied memory and
over heap-allocated memory.
*/

use core::fmt;

mod parsing_buffer;


pub use self::parsing_buffer::ParsingBuffer;

/// Error returned when appending to a full buffer.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct Full;

impl fmt::Display for Full {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "buffer full")
    }
}

impl core::error::Error for Full {}
