/*! Whether to finish fetching an entry nobody is reading anymore.

When the last reader of a still-growing entry leaves, the fetch can either
continue, so that future requests find the object cached, or be abandoned to
save bandwidth and disk work. The checks below run in a fixed order and the
first one that applies decides; several later checks only make sense because
of the earlier ones (the percentage check divides by a length the previous
check bounded from below).
*/

use core::fmt;

use super::config::Config;
use crate::entry::{CacheEntry, EntryFlags, EntryStatus, RequestFlags};

/// The outcome of [check], with the reason that decided it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Abort(&'static str),
    Continue(&'static str),
}

impl Decision {
    pub fn is_abort(&self) -> bool {
        matches!(self, Decision::Abort(_))
    }

    pub fn reason(&self) -> &'static str {
        match self {
            Decision::Abort(reason) | Decision::Continue(reason) => reason,
        }
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Decision::Abort(reason) => write!(f, "YES {}", reason),
            Decision::Continue(reason) => write!(f, "NO {}", reason),
        }
    }
}

/// Decide whether to abandon the fetch of `entry`.
///
/// `readers` is the number of readers still registered with the entry.
pub fn check(entry: &CacheEntry, readers: usize, config: &Config, shutting_down: bool) -> Decision {
    if readers > 0 {
        return Decision::Continue("still has readers");
    }
    if entry.transient_readers() > 0 {
        return Decision::Continue("other processes are reading");
    }
    if entry.status() != EntryStatus::Pending {
        return Decision::Continue("not pending");
    }
    if entry.flags().contains(EntryFlags::SPECIAL) {
        return Decision::Continue("special entry");
    }
    if shutting_down {
        return Decision::Abort("shutting down");
    }
    if let Some(request) = entry.request_flags() {
        if !request.contains(RequestFlags::CACHABLE) {
            return Decision::Abort("not cachable");
        }
    }
    if entry.flags().contains(EntryFlags::PRIVATE) {
        return Decision::Abort("private entry");
    }

    let reply = entry.mem().base_reply();
    let hdr_sz = reply.hdr_sz() as i64;
    if hdr_sz <= 0 {
        return Decision::Abort("no reply head yet");
    }

    let quick_abort = config.quick_abort;
    if quick_abort.min_kb < 0 {
        return Decision::Continue("disabled");
    }
    if entry
        .request_flags()
        .is_some_and(|request| request.contains(RequestFlags::RANGE))
        && config.range_offset_limit < 0
    {
        return Decision::Continue("whole object wanted for ranges");
    }

    let Some(content_length) = reply.content_length() else {
        return Decision::Abort("unknown content length");
    };
    let expectlen = hdr_sz.saturating_add(i64::try_from(content_length).unwrap_or(i64::MAX));
    let curlen = i64::try_from(entry.mem().end_offset()).unwrap_or(i64::MAX);

    if curlen > expectlen {
        return Decision::Abort("bad content length");
    }
    let left = expectlen - curlen;
    if left < quick_abort.min_kb.saturating_mul(1024) {
        return Decision::Continue("only a little more left");
    }
    if left > quick_abort.max_kb.saturating_mul(1024) {
        return Decision::Abort("too much left to go");
    }
    if expectlen < 100 {
        return Decision::Continue("too short to take a percentage");
    }
    if curlen / (expectlen / 100) > quick_abort.pct {
        return Decision::Continue("past the point of no return");
    }
    Decision::Abort("default")
}
