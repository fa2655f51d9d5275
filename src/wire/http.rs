//! The head of a stored HTTP reply.
//!
//! Only what the store needs is extracted: the status code, the length of
//! the head (status line, header fields and the terminating empty line) and
//! the declared body length. The parser is incremental in the sense that it
//! can be fed a growing prefix of the reply; it reports `Ok(None)` until the
//! terminating empty line has arrived.

use core::str;

use super::{Error, Result};

const VERSION_PREFIX: &[u8] = b"HTTP/";

/// A parsed reply head.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct ReplyHead {
    /// The status code from the status line.
    pub status: u16,
    /// Length of the head in bytes, terminating empty line included.
    pub header_len: usize,
    /// The value of the Content-Length field, if present.
    pub content_length: Option<u64>,
}

impl ReplyHead {
    /// Parse the reply head at the start of `buffer`.
    ///
    /// Returns `Ok(None)` if the head is not complete yet, and
    /// `Err(Error::TooLarge)` once the head is known to exceed `max_len`
    /// bytes, whether or not it is complete.
    pub fn parse(buffer: &[u8], max_len: usize) -> Result<Option<ReplyHead>> {
        let prefix = core::cmp::min(buffer.len(), VERSION_PREFIX.len());
        if buffer[..prefix] != VERSION_PREFIX[..prefix] {
            return Err(Error::Malformed);
        }

        let Some(header_len) = find_head_end(buffer) else {
            if buffer.len() >= max_len {
                return Err(Error::TooLarge);
            }
            return Ok(None);
        };
        if header_len > max_len {
            return Err(Error::TooLarge);
        }

        let mut lines = buffer[..header_len].split(|&b| b == b'\n').map(trim_cr);
        let status = parse_status_line(lines.next().ok_or(Error::Malformed)?)?;

        let mut content_length = None;
        for line in lines {
            if line.is_empty() {
                break;
            }
            if line[0] == b' ' || line[0] == b'\t' {
                // obsolete line folding, continues the previous field
                continue;
            }
            let colon = line
                .iter()
                .position(|&b| b == b':')
                .ok_or(Error::Malformed)?;
            let (name, value) = (&line[..colon], &line[colon + 1..]);
            if name.is_empty() || name.iter().any(|b| b.is_ascii_whitespace()) {
                return Err(Error::Malformed);
            }
            if name.eq_ignore_ascii_case(b"content-length") {
                let length = parse_decimal(value)?;
                match content_length {
                    Some(previous) if previous != length => return Err(Error::Malformed),
                    _ => content_length = Some(length),
                }
            }
        }

        Ok(Some(ReplyHead {
            status,
            header_len,
            content_length,
        }))
    }
}

/// Return the offset just past the empty line that ends the head.
fn find_head_end(buffer: &[u8]) -> Option<usize> {
    let mut line_start = 0;
    for (at, &byte) in buffer.iter().enumerate() {
        if byte != b'\n' {
            continue;
        }
        let line = trim_cr(&buffer[line_start..at]);
        if line.is_empty() && line_start > 0 {
            return Some(at + 1);
        }
        line_start = at + 1;
    }
    None
}

fn trim_cr(line: &[u8]) -> &[u8] {
    line.strip_suffix(b"\r").unwrap_or(line)
}

fn parse_status_line(line: &[u8]) -> Result<u16> {
    let mut parts = line.splitn(3, |&b| b == b' ');
    let version = parts.next().ok_or(Error::Malformed)?;
    let version = version
        .strip_prefix(VERSION_PREFIX)
        .ok_or(Error::Malformed)?;
    if !matches!(version, [major, b'.', minor] if major.is_ascii_digit() && minor.is_ascii_digit())
    {
        return Err(Error::Malformed);
    }

    let code = parts.next().ok_or(Error::Malformed)?;
    if code.len() != 3 || !code.iter().all(u8::is_ascii_digit) {
        return Err(Error::Malformed);
    }
    let code = parse_decimal(code)?;
    if !(100..=999).contains(&code) {
        return Err(Error::Malformed);
    }
    Ok(code as u16)
}

fn parse_decimal(value: &[u8]) -> Result<u64> {
    let value = str::from_utf8(value).map_err(|_| Error::Malformed)?.trim();
    if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
        return Err(Error::Malformed);
    }
    value.parse().map_err(|_| Error::Malformed)
}
