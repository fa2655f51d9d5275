use alloc::vec::Vec;
use core::{cmp, fmt};

use super::{Callback, ClientFlags, ClientKind, CopyRequest, IoFlags, ReadKind, StoreIoBuffer};
use crate::disk::{Disk, DiskError};
use crate::entry::{CacheEntry, EntryStatus};
use crate::storage::ParsingBuffer;
use crate::store::{Config, Context, EntryHandle};
use crate::wire;

/// One consumer's cursor into one cache entry.
///
/// A reader is created by [Store::register](../store/struct.Store.html#method.register)
/// and lives until it is unregistered. It answers one [CopyRequest] at a
/// time: the answer is collected into a parsing buffer sized after the
/// request, from memory or from disk, and delivered once, from
/// [Store::poll](../store/struct.Store.html#method.poll).
///
/// Offsets inside a reader come in two flavors. A copy request speaks in
/// body offsets; memory and the parsing buffer speak in reply offsets, that
/// is body offsets shifted by the length of the reply head. On disk, the
/// reply itself is shifted by the length of the metadata prefix.
pub struct StoreClient<D: Disk> {
    entry: EntryHandle,
    kind: ClientKind<D::Handle>,
    copy_into: CopyRequest,
    callback: Option<Callback<D>>,
    /// A delivery is scheduled.
    notifier: bool,
    buffer: ParsingBuffer<'static>,
    /// Reply offset of the first byte in `buffer`.
    buffer_offset: u64,
    /// Number of successful deliveries so far.
    answers: u64,
    /// Reply offset below which this reader needs nothing anymore.
    discardable_http_end: u64,
    flags: ClientFlags,
    object_ok: bool,
    /// The last disk read of the current request found nothing.
    disk_eof: bool,
    pending_read: Option<ReadKind>,
}

impl<D: Disk> fmt::Debug for StoreClient<D> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("StoreClient")
            .field("entry", &self.entry)
            .field("kind", &self.kind)
            .field("copy_into", &self.copy_into)
            .field("callback", &self.callback.is_some())
            .field("notifier", &self.notifier)
            .field("buffer", &self.buffer)
            .field("buffer_offset", &self.buffer_offset)
            .field("answers", &self.answers)
            .field("flags", &self.flags)
            .field("object_ok", &self.object_ok)
            .finish()
    }
}

impl<D: Disk> StoreClient<D> {
    pub(crate) fn new(entry: EntryHandle, kind: ClientKind<D::Handle>) -> StoreClient<D> {
        StoreClient {
            entry,
            kind,
            copy_into: CopyRequest::default(),
            callback: None,
            notifier: false,
            buffer: ParsingBuffer::with_capacity(0),
            buffer_offset: 0,
            answers: 0,
            discardable_http_end: 0,
            flags: ClientFlags::empty(),
            object_ok: true,
            disk_eof: false,
            pending_read: None,
        }
    }

    /// Return the entry this reader is bound to.
    pub fn entry(&self) -> EntryHandle {
        self.entry
    }

    pub fn kind(&self) -> &ClientKind<D::Handle> {
        &self.kind
    }

    /// Return the current (or last) copy request.
    pub fn copy_request(&self) -> CopyRequest {
        self.copy_into
    }

    pub fn flags(&self) -> ClientFlags {
        self.flags
    }

    /// Query whether no read has failed for this reader.
    pub fn object_ok(&self) -> bool {
        self.object_ok
    }

    /// Query whether the reply head was handed over.
    pub fn answered_once(&self) -> bool {
        self.answers > 0
    }

    /// Query whether a copy request still waits for news.
    pub fn pending(&self) -> bool {
        self.callback.is_some() && !self.notifier
    }

    /// Query whether a delivery is scheduled.
    pub fn notifier_pending(&self) -> bool {
        self.notifier
    }

    /// Query whether a copy request waits for its answer, delivery scheduled or not.
    pub fn has_callback(&self) -> bool {
        self.callback.is_some()
    }

    pub(crate) fn discardable_http_end(&self) -> u64 {
        self.discardable_http_end
    }

    pub(crate) fn take_swapin(&mut self) -> Option<D::Handle> {
        match &mut self.kind {
            ClientKind::Disk { swapin } => swapin.take(),
            ClientKind::Memory => None,
        }
    }

    /// Start answering `request`.
    ///
    /// # Panics
    /// This function panics if a request is already pending, if the entry
    /// was aborted, or if a body offset is requested before the reply head
    /// was handed over.
    pub(crate) fn copy(&mut self, cx: &mut Context<D>, request: CopyRequest, callback: Callback<D>) {
        assert!(
            self.callback.is_none(),
            "copy requested while another copy is pending"
        );
        assert!(!cx.entry.is_aborted(), "copy requested from an aborted entry");
        assert!(
            request.offset == 0 || self.answered_once(),
            "body offset requested before the reply head was delivered"
        );
        store_debug!(
            "{}: {}: copy {} bytes from offset {}",
            cx.handle,
            cx.entry.key(),
            request.length,
            request.offset
        );

        self.copy_into = request;
        self.callback = Some(callback);
        self.buffer = ParsingBuffer::with_capacity(request.length);
        self.buffer_offset = cx
            .entry
            .mem()
            .base_reply()
            .hdr_sz()
            .saturating_add(request.offset);
        self.discardable_http_end = self.buffer_offset;
        self.disk_eof = false;
        self.copy2(cx);
    }

    /// Make progress on the pending request, unless already doing so.
    pub(crate) fn copy2(&mut self, cx: &mut Context<D>) {
        if self.flags.contains(ClientFlags::STORE_COPYING) {
            store_debug!("{}: bouncing, already copying", cx.handle);
            return;
        }
        if !self.pending() {
            return;
        }
        self.flags.insert(ClientFlags::STORE_COPYING);
        self.do_copy(cx);
        self.flags.remove(ClientFlags::STORE_COPYING);
    }

    fn do_copy(&mut self, cx: &mut Context<D>) {
        if !self.object_ok {
            self.note_news(cx);
            return;
        }
        if !self.more_to_read(cx.entry) {
            store_debug!("{}: nothing more to read", cx.handle);
            self.note_news(cx);
            return;
        }

        let reply = cx.entry.mem().base_reply();
        let send_headers = !self.answered_once() && reply.hdr_sz() > 0;
        if !send_headers
            && cx.entry.status() == EntryStatus::Pending
            && (!reply.is_parsed() || self.wanted_offset(cx.entry) >= cx.entry.mem().end_offset())
        {
            store_trace!(
                "{}: waiting for more, want {}, have {}",
                cx.handle,
                self.wanted_offset(cx.entry),
                cx.entry.mem().end_offset()
            );
            return;
        }

        // Open the stored object before handing anything over, so a reader
        // that cannot read it fails before its first answer.
        if matches!(self.kind, ClientKind::Disk { swapin: None }) && !self.start_swapin(cx) {
            return;
        }

        if send_headers {
            store_trace!("{}: handing over the reply head", cx.handle);
            if self.can_read_from_memory(cx.entry) {
                self.read_from_memory(cx);
            }
            self.note_news(cx);
            return;
        }

        if self.can_read_from_memory(cx.entry) {
            self.read_from_memory(cx);
            self.note_news(cx);
            return;
        }

        self.schedule_disk_read(cx);
    }

    /// Return the reply offset just past the buffered bytes.
    fn next_http_read_offset(&self) -> u64 {
        self.buffer_offset
            .saturating_add(self.buffer.content_size() as u64)
    }

    /// Return the reply offset of the next byte this reader wants.
    fn wanted_offset(&self, entry: &CacheEntry) -> u64 {
        let first = entry
            .mem()
            .base_reply()
            .hdr_sz()
            .saturating_add(self.copy_into.offset);
        cmp::max(self.next_http_read_offset(), first)
    }

    fn can_read_from_memory(&self, entry: &CacheEntry) -> bool {
        if !self.answered_once() && !entry.mem().base_reply().is_parsed() {
            return false;
        }
        entry.mem().contains(self.wanted_offset(entry))
    }

    fn more_to_read(&self, entry: &CacheEntry) -> bool {
        if entry.status() == EntryStatus::Pending {
            return true;
        }
        if !self.answered_once() {
            return true;
        }
        if self.can_read_from_memory(entry) {
            return true;
        }
        if let Some(content_len) = entry.content_len() {
            let body_offset = self
                .copy_into
                .offset
                .saturating_add(self.buffer.content_size() as u64);
            if body_offset >= content_len {
                return false;
            }
        }
        self.kind.is_disk() && entry.swap_in_able()
    }

    /// Drop buffered bytes that precede what the reader wants.
    fn skip_to_wanted(&mut self, entry: &CacheEntry) {
        let reply = entry.mem().base_reply();
        if !reply.is_parsed() {
            return;
        }
        let first = reply.hdr_sz().saturating_add(self.copy_into.offset);
        if self.buffer_offset >= first {
            return;
        }
        let skip = cmp::min(first - self.buffer_offset, self.buffer.content_size() as u64);
        self.buffer.consume(skip as usize);
        self.buffer_offset = first;
    }

    fn read_from_memory(&mut self, cx: &mut Context<D>) {
        self.skip_to_wanted(cx.entry);
        let at = self.next_http_read_offset();
        let copied = cx.entry.mem().copy(at, self.buffer.space_mut());
        self.buffer.appended(copied);
        store_trace!("{}: copied {} bytes at {} from memory", cx.handle, copied, at);
    }

    fn start_swapin(&mut self, cx: &mut Context<D>) -> bool {
        let limit = cx.inner.config.max_open_disk_files;
        if limit > 0 && cx.inner.open_disk_files >= limit {
            store_warn!("{}: too many open disk files ({})", cx.handle, limit);
            self.fail(cx);
            return false;
        }
        if self.flags.contains(ClientFlags::DISK_IO_PENDING) {
            store_warn!("{}: averted a second open of the stored object", cx.handle);
            return false;
        }
        let Some(file) = cx.entry.swap_file() else {
            store_error!("{}: {}: disk reader without a stored object", cx.handle, cx.entry.key());
            self.fail(cx);
            return false;
        };
        match cx.inner.disk.open(file) {
            Some(handle) => {
                store_debug!("{}: opened stored object {}", cx.handle, file);
                self.kind = ClientKind::Disk {
                    swapin: Some(handle),
                };
                cx.inner.open_disk_files += 1;
                true
            }
            None => {
                store_warn!("{}: cannot open stored object {}", cx.handle, file);
                self.fail(cx);
                false
            }
        }
    }

    fn schedule_disk_read(&mut self, cx: &mut Context<D>) {
        if !self.kind.is_disk() {
            store_error!(
                "{}: {}: memory reader wants offset {} which is not in memory",
                cx.handle,
                cx.entry.key(),
                self.wanted_offset(cx.entry)
            );
            self.fail(cx);
            return;
        }
        self.file_read(cx);
    }

    fn file_read(&mut self, cx: &mut Context<D>) {
        if self.flags.contains(ClientFlags::DISK_IO_PENDING) {
            store_warn!("{}: averted a second disk read", cx.handle);
            return;
        }

        let swap_hdr_sz = cx.entry.mem().swap_hdr_sz;
        let (kind, offset) = if swap_hdr_sz == 0 {
            (ReadKind::Header, self.buffer.content_size() as u64)
        } else {
            (ReadKind::Body, swap_hdr_sz.saturating_add(self.next_http_read_offset()))
        };
        if !self.answered_once() && self.buffer.space_size() == 0 {
            // The head is needed even when no body bytes are.
            self.buffer
                .grow_space(cmp::max(self.buffer.reader_capacity(), 1));
        }
        let mut len = self.buffer.space_size();
        if self.answered_once() {
            len = cmp::min(len, self.copy_into.length);
        }
        if len == 0 {
            store_warn!("{}: no room for a disk read", cx.handle);
            self.note_news(cx);
            return;
        }

        let ClientKind::Disk {
            swapin: Some(handle),
        } = &self.kind
        else {
            store_error!("{}: disk read without an open stored object", cx.handle);
            self.fail(cx);
            return;
        };
        store_trace!(
            "{}: reading {} bytes at file offset {} ({:?})",
            cx.handle,
            len,
            offset,
            kind
        );
        self.flags.insert(ClientFlags::DISK_IO_PENDING);
        self.pending_read = Some(kind);
        cx.inner.disk.read(handle, offset, len, cx.handle);
    }

    /// Handle the completion of the disk read started by [file_read].
    pub(crate) fn read_completed(&mut self, cx: &mut Context<D>, result: Result<Vec<u8>, DiskError>) {
        if !self.flags.contains(ClientFlags::DISK_IO_PENDING) {
            store_warn!("{}: unexpected disk read completion", cx.handle);
            return;
        }
        self.flags.remove(ClientFlags::DISK_IO_PENDING);
        match self.pending_read.take() {
            Some(ReadKind::Header) => self.read_header(cx, result),
            Some(ReadKind::Body) => self.read_body(cx, result),
            None => {}
        }
    }

    /// Turn a read result into bytes, or deal with the end of the object
    /// and with errors.
    fn checked_read(
        &mut self,
        cx: &mut Context<D>,
        result: Result<Vec<u8>, DiskError>,
    ) -> Option<Vec<u8>> {
        match result {
            Err(err) => {
                store_warn!("{}: disk read failed: {}", cx.handle, err);
                self.fail(cx);
                None
            }
            Ok(bytes) if bytes.is_empty() => {
                if self.answered_once() {
                    store_debug!("{}: end of stored object", cx.handle);
                    self.disk_eof = true;
                    self.note_news(cx);
                } else {
                    store_warn!(
                        "{}: {}: stored object ends before its reply head",
                        cx.handle,
                        cx.entry.key()
                    );
                    self.fail(cx);
                }
                None
            }
            Ok(bytes) => Some(bytes),
        }
    }

    fn read_header(&mut self, cx: &mut Context<D>, result: Result<Vec<u8>, DiskError>) {
        let Some(bytes) = self.checked_read(cx, result) else {
            return;
        };
        if self.buffer.append(&bytes).is_err() {
            store_error!("{}: disk read overran the parsing buffer", cx.handle);
            self.fail(cx);
            return;
        }

        let prefix = match cx.entry.unpack_swap_meta(self.buffer.content()) {
            Ok(prefix) => prefix,
            Err(wire::Error::Truncated)
                if self.buffer.content_size() < cx.inner.config.max_reply_header_size =>
            {
                store_trace!(
                    "{}: metadata prefix incomplete after {} bytes",
                    cx.handle,
                    self.buffer.content_size()
                );
                self.buffer
                    .grow_space(cmp::max(self.buffer.reader_capacity(), 1));
                self.file_read(cx);
                return;
            }
            Err(err) => {
                store_warn!(
                    "{}: {}: bad metadata prefix: {}",
                    cx.handle,
                    cx.entry.key(),
                    err
                );
                self.fail(cx);
                return;
            }
        };
        store_debug!("{}: metadata prefix is {} bytes", cx.handle, prefix);
        self.buffer.consume(prefix);
        self.buffer_offset = 0;

        maybe_write_from_disk_to_memory(cx.entry, &cx.inner.config, 0, self.buffer.content());
        self.handle_body_from_disk(cx);
    }

    fn read_body(&mut self, cx: &mut Context<D>, result: Result<Vec<u8>, DiskError>) {
        let Some(bytes) = self.checked_read(cx, result) else {
            return;
        };
        let at = self.next_http_read_offset();
        if self.buffer.append(&bytes).is_err() {
            store_error!("{}: disk read overran the parsing buffer", cx.handle);
            self.fail(cx);
            return;
        }
        maybe_write_from_disk_to_memory(cx.entry, &cx.inner.config, at, &bytes);
        self.handle_body_from_disk(cx);
    }

    fn handle_body_from_disk(&mut self, cx: &mut Context<D>) {
        if !self.answered_once() && !cx.entry.mem().base_reply().is_parsed() {
            match self.try_parsing_http_headers(cx) {
                Ok(true) => {}
                Ok(false) => {
                    self.buffer
                        .grow_space(cmp::max(self.buffer.reader_capacity(), 1));
                    self.file_read(cx);
                    return;
                }
                Err(err) => {
                    store_warn!(
                        "{}: {}: cannot parse stored reply head: {}",
                        cx.handle,
                        cx.entry.key(),
                        err
                    );
                    self.fail(cx);
                    return;
                }
            }
        }

        self.skip_to_wanted(cx.entry);
        if self.answered_once() && self.buffer.is_empty() {
            // Everything read so far precedes the wanted range.
            self.file_read(cx);
            return;
        }
        self.note_news(cx);
    }

    /// Parse the shared reply head from the buffered bytes.
    ///
    /// Returns `Ok(false)` while more bytes are needed. The parser enforces
    /// the size limit on the head.
    fn try_parsing_http_headers(&mut self, cx: &mut Context<D>) -> wire::Result<bool> {
        debug_assert_eq!(self.buffer_offset, 0);
        let max_len = cx.inner.config.max_reply_header_size;
        let parsed = cx
            .entry
            .mem_mut()
            .adjustable_base_reply()
            .parse_terminated_prefix(self.buffer.content(), max_len)?;
        if parsed {
            store_debug!(
                "{}: {}: parsed a {} byte reply head from disk",
                cx.handle,
                cx.entry.key(),
                cx.entry.mem().base_reply().hdr_sz()
            );
        }
        Ok(parsed)
    }

    /// Give up on the current request; the consumer gets an error.
    pub(crate) fn fail(&mut self, cx: &mut Context<D>) {
        if !self.object_ok {
            return;
        }
        store_debug!("{}: failing", cx.handle);
        self.object_ok = false;
        self.note_news(cx);
    }

    /// Schedule the delivery of the current request, once.
    fn note_news(&mut self, cx: &mut Context<D>) {
        if self.callback.is_none() {
            store_debug!("{}: news without a pending request", cx.handle);
            return;
        }
        if self.notifier {
            store_trace!("{}: delivery already scheduled", cx.handle);
            return;
        }
        self.notifier = true;
        cx.inner.deferred.schedule(cx.handle);
    }

    /// Collect the answer to the current request and the callback to hand it to.
    ///
    /// Memory is consulted once more, so the answer carries the bytes that
    /// are available now rather than when the news was noted.
    pub(crate) fn finish_callback(
        &mut self,
        cx: &mut Context<D>,
    ) -> Option<(Callback<D>, StoreIoBuffer)> {
        if !self.notifier {
            return None;
        }
        self.notifier = false;
        let callback = self.callback.take()?;

        if self.object_ok && self.can_read_from_memory(cx.entry) {
            self.read_from_memory(cx);
        }
        self.skip_to_wanted(cx.entry);
        let start = self.buffer_offset;

        let ok = self.object_ok;
        let data = if ok {
            self.buffer.pack_back(self.copy_into.length)
        } else {
            Vec::new()
        };
        let mut flags = IoFlags::empty();
        if !ok {
            flags.insert(IoFlags::ERROR);
        } else if data.is_empty() && (self.disk_eof || !self.more_to_read(cx.entry)) {
            flags.insert(IoFlags::EOF);
        }
        if ok {
            if cx.entry.mem().base_reply().is_parsed() {
                self.answers += 1;
            }
            self.discardable_http_end = start.saturating_add(data.len() as u64);
        }
        store_debug!(
            "{}: delivering {} bytes at {} ({:?})",
            cx.handle,
            data.len(),
            self.copy_into.offset,
            flags
        );

        self.buffer = ParsingBuffer::with_capacity(0);
        self.buffer_offset = 0;
        Some((
            callback,
            StoreIoBuffer {
                data,
                offset: self.copy_into.offset,
                flags,
            },
        ))
    }

    /// Drop the pending request without delivering it.
    pub(crate) fn cancel(&mut self) -> bool {
        self.notifier = false;
        self.callback.take().is_some()
    }
}

/// Copy bytes just read from disk into memory, if memory may take them.
///
/// Only the first disk reader of an object warms memory: nothing may have
/// been cached before, and the bytes must continue exactly at the end of
/// what is cached, so repeating a write changes nothing.
fn maybe_write_from_disk_to_memory(entry: &mut CacheEntry, config: &Config, offset: u64, bytes: &[u8]) {
    if bytes.is_empty() || !config.memory_cache_disk {
        return;
    }
    if entry.mem().lowest_cached_offset() != 0 {
        return;
    }
    if entry
        .object_len()
        .is_some_and(|len| len > config.max_in_mem_obj_size)
    {
        return;
    }
    if entry.mem_mut().write(offset, bytes) {
        store_trace!(
            "{}: mirrored {} bytes at {} into memory",
            entry.key(),
            bytes.len(),
            offset
        );
    }
}
