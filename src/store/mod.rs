/*! The store: cache entries, their readers, and the loop that drives them.

A [Store] owns everything: the entries, the readers registered with them,
the [Disk] collaborator, and the queue of deliveries waiting to run. Nothing
happens behind the caller's back. A producer feeds an entry with
[append](struct.Store.html#method.append) and finishes it with
[complete](struct.Store.html#method.complete) or
[abort](struct.Store.html#method.abort); consumers ask for bytes with
[copy](struct.Store.html#method.copy); and the owner of the loop calls
[poll](struct.Store.html#method.poll) to collect disk completions and run
consumer callbacks.

```rust
use storeclient::client::CopyRequest;
use storeclient::disk::Loopback;
use storeclient::entry::{CacheKey, EntryFlags, RequestFlags};
use storeclient::store::{Config, Store};

let mut store = Store::new(Config::default(), Loopback::new());
let entry = store.create_entry(CacheKey([1; 16]), Some(RequestFlags::CACHABLE), EntryFlags::empty());
let reader = store.register(entry);
store.copy(reader, entry, CopyRequest::new(0, 4096), |_store, _reader, answer| {
    assert_eq!(answer.data, b"hello");
});
store.append(entry, b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello").unwrap();
store.complete(entry);
store.poll();
```
*/

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::fmt;
use core::task::Waker;

use crate::client::{ClientKind, CopyRequest, StoreClient, StoreIoBuffer};
use crate::disk::{CloseReason, Disk, ReadCompletion, SwapFile};
use crate::entry::{CacheEntry, CacheKey, EntryFlags, EntryStatus, RequestFlags, SwapStatus};
use crate::wire::{self, SwapMetaRepr};

mod client_set;
mod config;
mod deferred;
mod fanout;
pub mod quick_abort;

pub use self::client_set::ClientHandle;
pub use self::config::{Config, QuickAbortConfig};

pub(crate) use self::client_set::ClientSet;
pub(crate) use self::deferred::DeferredCalls;

/// A handle, identifying an entry in a [Store].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EntryHandle(usize);

impl EntryHandle {
    #[cfg(test)]
    pub(crate) const fn new(index: usize) -> EntryHandle {
        EntryHandle(index)
    }
}

impl fmt::Display for EntryHandle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "@{}", self.0)
    }
}

/// Store counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Stats {
    /// Stored objects read back by a reader that is now gone.
    pub swap_ins: u64,
    /// Objects written to disk.
    pub swap_outs: u64,
    /// Fetches abandoned after their last reader left.
    pub quick_aborts: u64,
}

/// The part of the store every reader works with.
pub(crate) struct StoreInner<D: Disk> {
    pub(crate) config: Config,
    pub(crate) disk: D,
    pub(crate) deferred: DeferredCalls,
    pub(crate) stats: Stats,
    pub(crate) shutting_down: bool,
    /// Swap-in files currently open.
    pub(crate) open_disk_files: usize,
}

/// What one reader may touch while it makes progress.
pub(crate) struct Context<'a, D: Disk> {
    pub(crate) handle: ClientHandle,
    pub(crate) entry: &'a mut CacheEntry,
    pub(crate) inner: &'a mut StoreInner<D>,
}

/// Cache entries and their readers.
pub struct Store<D: Disk> {
    entries: Vec<Option<CacheEntry>>,
    clients: ClientSet<D>,
    inner: StoreInner<D>,
    next_swap_file: u32,
}

fn get_entry(entries: &[Option<CacheEntry>], handle: EntryHandle) -> &CacheEntry {
    match entries.get(handle.0) {
        Some(Some(entry)) => entry,
        _ => panic!("handle {} does not refer to a valid entry", handle),
    }
}

fn get_entry_mut(entries: &mut [Option<CacheEntry>], handle: EntryHandle) -> &mut CacheEntry {
    match entries.get_mut(handle.0) {
        Some(Some(entry)) => entry,
        _ => panic!("handle {} does not refer to a valid entry", handle),
    }
}

/// Choose where a new reader of `entry` gets its bytes from.
fn client_kind<H>(entry: &CacheEntry) -> ClientKind<H> {
    let mem = entry.mem();
    let disk = if mem.lowest_cached_offset() > 0 {
        true
    } else if entry.is_aborted() || entry.status() == EntryStatus::Pending {
        false
    } else if entry.object_len() == Some(mem.end_offset()) {
        false
    } else {
        entry.has_disk()
    };
    if disk {
        ClientKind::Disk { swapin: None }
    } else {
        ClientKind::Memory
    }
}

impl<D: Disk> Store<D> {
    /// Create an empty store.
    pub fn new(config: Config, disk: D) -> Store<D> {
        Store {
            entries: Vec::new(),
            clients: ClientSet::default(),
            inner: StoreInner {
                config,
                disk,
                deferred: DeferredCalls::default(),
                stats: Stats::default(),
                shutting_down: false,
                open_disk_files: 0,
            },
            next_swap_file: 0,
        }
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn disk(&self) -> &D {
        &self.inner.disk
    }

    pub fn disk_mut(&mut self) -> &mut D {
        &mut self.inner.disk
    }

    pub fn stats(&self) -> Stats {
        self.inner.stats
    }

    /// Return the number of swap-in files readers hold open.
    pub fn open_disk_files(&self) -> usize {
        self.inner.open_disk_files
    }

    /// Tell the store whether the process is going away.
    pub fn set_shutting_down(&mut self, shutting_down: bool) {
        self.inner.shutting_down = shutting_down;
    }

    fn add_entry(&mut self, entry: CacheEntry) -> EntryHandle {
        for (index, slot) in self.entries.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(entry);
                return EntryHandle(index);
            }
        }
        self.entries.push(Some(entry));
        EntryHandle(self.entries.len() - 1)
    }

    /// Add an entry a producer is about to fill.
    pub fn create_entry(
        &mut self,
        key: CacheKey,
        request: Option<RequestFlags>,
        flags: EntryFlags,
    ) -> EntryHandle {
        let handle = self.add_entry(CacheEntry::new(key, request, flags));
        store_debug!("{}: {}: created", handle, key);
        handle
    }

    /// Add a complete entry that only exists on disk.
    pub fn open_hit(&mut self, key: CacheKey, file: SwapFile, swap_file_sz: u64) -> EntryHandle {
        let handle = self.add_entry(CacheEntry::on_disk(key, file, swap_file_sz));
        store_debug!("{}: {}: stored in {}", handle, key, file);
        handle
    }

    /// Get an entry by its handle.
    ///
    /// # Panics
    /// This function panics if the handle does not refer to an entry.
    pub fn entry(&self, handle: EntryHandle) -> &CacheEntry {
        get_entry(&self.entries, handle)
    }

    /// Append reply bytes to a pending entry and wake its readers.
    ///
    /// The reply head is parsed as soon as it is complete. A reply head that
    /// cannot be parsed is reported, but the bytes are kept and readers are
    /// woken all the same.
    ///
    /// # Panics
    /// This function panics if the entry is complete.
    pub fn append(&mut self, entry: EntryHandle, data: &[u8]) -> Result<(), wire::Error> {
        let max_len = self.inner.config.max_reply_header_size;
        let e = get_entry_mut(&mut self.entries, entry);
        assert!(
            e.status() == EntryStatus::Pending,
            "appending to a complete entry"
        );
        let end = e.mem().end_offset();
        e.mem_mut().write(end, data);
        store_trace!("{}: appended {} bytes at {}", entry, data.len(), end);

        let parsed = if e.mem().base_reply().is_parsed() {
            Ok(())
        } else {
            match e.mem_mut().parse_reply(max_len) {
                Ok(true) => {
                    store_debug!(
                        "{}: reply head is {} bytes",
                        entry,
                        e.mem().base_reply().hdr_sz()
                    );
                    Ok(())
                }
                Ok(false) => Ok(()),
                Err(err) => {
                    store_warn!("{}: cannot parse reply head: {}", entry, err);
                    Err(err)
                }
            }
        };
        self.notify_all(entry);
        parsed
    }

    /// Mark a pending entry complete and wake its readers.
    pub fn complete(&mut self, entry: EntryHandle) {
        let e = get_entry_mut(&mut self.entries, entry);
        if e.status() == EntryStatus::Complete {
            return;
        }
        e.status = EntryStatus::Complete;
        e.object_len = Some(e.mem().end_offset());
        store_debug!("{}: complete, {} bytes", entry, e.mem().end_offset());
        self.notify_all(entry);
    }

    /// Abandon the fetch of an entry and wake its readers.
    ///
    /// Readers get what arrived before the abort; no new request may be
    /// started on the entry.
    pub fn abort(&mut self, entry: EntryHandle) {
        let e = get_entry_mut(&mut self.entries, entry);
        if e.is_aborted() {
            return;
        }
        store_debug!("{}: {}: aborting", entry, e.key());
        e.flags.insert(EntryFlags::ABORTED);
        e.status = EntryStatus::Complete;
        self.notify_all(entry);
    }

    /// Drop cached bytes below `offset`; later readers must get them from disk.
    pub fn trim_memory(&mut self, entry: EntryHandle, offset: u64) {
        get_entry_mut(&mut self.entries, entry)
            .mem_mut()
            .trim_to(offset);
    }

    /// Set the number of readers in other processes.
    pub fn set_transient_readers(&mut self, entry: EntryHandle, readers: u32) {
        get_entry_mut(&mut self.entries, entry).transient_readers = readers;
    }

    /// Remove an entry nobody holds anymore.
    ///
    /// Returns false, and keeps the entry, if it is still locked.
    pub fn release(&mut self, entry: EntryHandle) -> bool {
        let e = get_entry(&self.entries, entry);
        if e.lock_count() > 0 || e.mem().client_count() > 0 {
            store_debug!("{}: still locked, not releasing", entry);
            return false;
        }
        store_debug!("{}: {}: released", entry, e.key());
        self.entries[entry.0] = None;
        true
    }

    /// Write a complete entry to disk, metadata prefix first.
    ///
    /// Returns whether the entry is now stored. Only a whole, shareable
    /// reply is written, and only once.
    pub fn swap_out(&mut self, entry: EntryHandle) -> bool {
        let e = get_entry_mut(&mut self.entries, entry);
        match e.swap_status() {
            SwapStatus::Done => return true,
            SwapStatus::Writing | SwapStatus::Failed => return false,
            SwapStatus::None => {}
        }
        let cachable = e
            .request_flags()
            .is_none_or(|request| request.contains(RequestFlags::CACHABLE));
        if e.status() != EntryStatus::Complete
            || e.is_aborted()
            || e.flags().contains(EntryFlags::PRIVATE)
            || !cachable
            || e.mem().lowest_cached_offset() != 0
            || !e.mem().base_reply().is_parsed()
        {
            store_trace!("{}: not swapping out", entry);
            return false;
        }

        let file = match e.swap_file() {
            Some(file) => file,
            None => {
                let file = SwapFile(self.next_swap_file);
                self.next_swap_file = self.next_swap_file.wrapping_add(1);
                file
            }
        };
        let object_len = e.mem().end_offset();
        let mut meta = SwapMetaRepr {
            key: Some(e.key()),
            object_size: Some(0),
        };
        let prefix_len = meta.buffer_len() as u64;
        meta.object_size = Some(prefix_len + object_len);
        let mut image = meta.to_vec();
        image.extend_from_slice(e.mem().bytes_from(0));

        e.swap_file = Some(file);
        e.swap_status = SwapStatus::Writing;
        match self.inner.disk.write(file, &image) {
            Ok(()) => {
                store_debug!("{}: {}: swapped out to {}", entry, e.key(), file);
                e.swap_status = SwapStatus::Done;
                e.swap_file_sz = Some(prefix_len + object_len);
                e.object_len = Some(object_len);
                e.mem.swap_hdr_sz = prefix_len;
                self.inner.stats.swap_outs += 1;
                true
            }
            Err(err) => {
                store_warn!("{}: {}: swap out to {} failed: {}", entry, e.key(), file, err);
                e.swap_status = SwapStatus::Failed;
                false
            }
        }
    }

    /// Attach a new reader to an entry.
    ///
    /// The entry stays locked until the reader is unregistered.
    ///
    /// # Panics
    /// This function panics if the reader would need a stored object the
    /// entry does not have.
    pub fn register(&mut self, entry: EntryHandle) -> ClientHandle {
        let e = get_entry_mut(&mut self.entries, entry);
        let kind = client_kind(e);
        if kind.is_disk() {
            assert!(
                e.swap_in_able(),
                "disk reader for an entry that cannot be read from disk"
            );
        }
        e.lock("store_client");
        let disk = kind.is_disk();
        let handle = self.clients.add(StoreClient::new(entry, kind));
        e.mem.clients.push(handle);
        store_debug!(
            "{}: {}: registered {} ({})",
            entry,
            e.key(),
            handle,
            if disk { "disk" } else { "memory" }
        );
        handle
    }

    /// Get a reader by its handle.
    ///
    /// # Panics
    /// This function panics if the handle does not refer to a registered reader.
    pub fn client(&self, handle: ClientHandle) -> &StoreClient<D> {
        self.clients.get(handle)
    }

    fn client_context(
        &mut self,
        handle: ClientHandle,
    ) -> Option<(&mut StoreClient<D>, Context<'_, D>)> {
        let client = self.clients.try_get_mut(handle)?;
        let entry = self.entries.get_mut(client.entry().0)?.as_mut()?;
        let cx = Context {
            handle,
            entry,
            inner: &mut self.inner,
        };
        Some((client, cx))
    }

    /// Ask a reader for the next range of an entry.
    ///
    /// `callback` runs exactly once, from [poll](#method.poll), unless the
    /// reader is unregistered first.
    ///
    /// # Panics
    /// This function panics if the reader is bound to another entry, if a
    /// request is already pending, if the entry was aborted, or if a body
    /// offset is requested before the reply head was delivered.
    pub fn copy<F>(&mut self, client: ClientHandle, entry: EntryHandle, request: CopyRequest, callback: F)
    where
        F: FnOnce(&mut Store<D>, ClientHandle, StoreIoBuffer) + 'static,
    {
        assert_eq!(
            self.clients.get(client).entry(),
            entry,
            "copy requested from an entry the reader is not registered with"
        );
        if let Some((sc, mut cx)) = self.client_context(client) {
            sc.copy(&mut cx, request, Box::new(callback));
        }
        self.kick_reads(entry);
    }

    /// Query whether a reader waits for the answer to a copy request.
    pub fn copy_pending(&self, client: ClientHandle, entry: EntryHandle) -> bool {
        match self.clients.try_get(client) {
            Some(sc) => {
                debug_assert_eq!(sc.entry(), entry);
                sc.has_callback()
            }
            None => false,
        }
    }

    /// Detach a reader from an entry.
    ///
    /// A pending request is dropped without calling back. If the entry is
    /// complete it is written to disk, and if this was the last reader of a
    /// pending entry, quick abort decides whether to keep fetching.
    ///
    /// Returns false if the reader is not registered with the entry.
    pub fn unregister(&mut self, client: ClientHandle, entry: EntryHandle) -> bool {
        let Some(Some(e)) = self.entries.get_mut(entry.0) else {
            store_debug!("{}: no such entry", entry);
            return false;
        };
        if e.mem().client_count() == 0 {
            store_debug!(
                "{}: {}: no readers to unregister {} from",
                entry,
                e.key(),
                client
            );
            return false;
        }
        let Some(position) = e.mem().clients.iter().position(|&h| h == client) else {
            store_debug!("{}: {} is not a reader of this entry", entry, client);
            return false;
        };
        e.mem.clients.remove(position);
        let wants_swap_out = e.status() == EntryStatus::Complete
            && !matches!(e.swap_status(), SwapStatus::Done | SwapStatus::Failed);
        store_debug!("{}: {}: unregistering {}", entry, e.key(), client);

        if wants_swap_out {
            self.swap_out(entry);
        }

        let Some(mut sc) = self.clients.remove(client) else {
            store_error!("{}: {} is listed but not registered", entry, client);
            return false;
        };
        if let Some(handle) = sc.take_swapin() {
            let reason = if sc.object_ok() {
                CloseReason::ReaderDone
            } else {
                CloseReason::ReaderFailed
            };
            self.inner.disk.close(handle, reason);
            self.inner.open_disk_files = self.inner.open_disk_files.saturating_sub(1);
            self.inner.stats.swap_ins += 1;
        }
        if sc.cancel() {
            store_debug!("{}: dropping the pending request of {}", entry, client);
        }
        self.inner.deferred.cancel(client);
        drop(sc);

        let e = get_entry_mut(&mut self.entries, entry);
        e.unlock("store_client");
        let readers = e.mem().client_count();
        if readers > 0 {
            self.kick_reads(entry);
            return true;
        }

        let decision = quick_abort::check(e, readers, &self.inner.config, self.inner.shutting_down);
        store_debug!("{}: quick abort: {}", entry, decision);
        if decision.is_abort() {
            self.inner.stats.quick_aborts += 1;
            self.abort(entry);
        }
        true
    }

    /// Return the number of readers registered with an entry.
    pub fn pending_clients(&self, entry: EntryHandle) -> usize {
        self.entries
            .get(entry.0)
            .and_then(Option::as_ref)
            .map_or(0, |e| e.mem().client_count())
    }

    /// Return the reply offset below which no memory reader needs bytes.
    pub fn lowest_mem_reader_offset(&self, entry: EntryHandle) -> u64 {
        let e = get_entry(&self.entries, entry);
        e.mem()
            .clients
            .iter()
            .filter_map(|&handle| self.clients.try_get(handle))
            .filter(|sc| !sc.kind().is_disk())
            .map(|sc| sc.discardable_http_end())
            .min()
            .unwrap_or_else(|| e.mem().end_offset())
    }

    /// Register the producer's waker, woken when readers make room for more bytes.
    pub fn register_read_waker(&mut self, entry: EntryHandle, waker: &Waker) {
        get_entry_mut(&mut self.entries, entry)
            .mem_mut()
            .register_read_waker(waker);
    }

    /// Return how many bytes the producer may append before running too far
    /// ahead of the slowest memory reader.
    pub fn read_ahead_allowance(&self, entry: EntryHandle) -> u64 {
        let lowest = self.lowest_mem_reader_offset(entry);
        self.entry(entry)
            .mem()
            .read_ahead_allowance(lowest, self.inner.config.read_ahead_gap)
    }

    fn kick_reads(&mut self, entry: EntryHandle) {
        let lowest = self.lowest_mem_reader_offset(entry);
        let gap = self.inner.config.read_ahead_gap;
        get_entry_mut(&mut self.entries, entry)
            .mem_mut()
            .kick_reads(lowest, gap);
    }

    /// Write the state of every reader of an entry.
    pub fn dump_clients<W: fmt::Write>(&self, entry: EntryHandle, out: &mut W) -> fmt::Result {
        let e = self.entry(entry);
        for (number, &handle) in e.mem().clients.iter().enumerate() {
            let Some(sc) = self.clients.try_get(handle) else {
                continue;
            };
            let request = sc.copy_request();
            writeln!(out, "Client #{}, {}", number, handle)?;
            writeln!(out, "  copy_offset: {}", request.offset)?;
            writeln!(out, "  copy_size: {}", request.length)?;
            write!(out, "  flags:")?;
            if sc.flags().contains(crate::client::ClientFlags::DISK_IO_PENDING) {
                write!(out, " disk_io_pending")?;
            }
            if sc.flags().contains(crate::client::ClientFlags::STORE_COPYING) {
                write!(out, " store_copying")?;
            }
            if sc.notifier_pending() {
                write!(out, " notifier_pending")?;
            }
            writeln!(out)?;
        }
        Ok(())
    }

    /// Collect disk completions and run deliveries until none are left.
    ///
    /// Returns whether anything happened.
    pub fn poll(&mut self) -> bool {
        let mut progress = false;
        loop {
            let mut did_something = false;
            while let Some(completion) = self.inner.disk.poll_read() {
                did_something = true;
                self.read_completed(completion);
            }
            while let Some(handle) = self.inner.deferred.pop() {
                did_something = true;
                self.finish_callback(handle);
            }
            if !did_something {
                break;
            }
            progress = true;
        }
        progress
    }

    fn read_completed(&mut self, completion: ReadCompletion) {
        let ReadCompletion { token, result } = completion;
        match self.client_context(token) {
            Some((sc, mut cx)) => sc.read_completed(&mut cx, result),
            None => store_trace!("{}: dropping a read for a gone reader", token),
        }
    }

    fn finish_callback(&mut self, handle: ClientHandle) {
        let Some((sc, mut cx)) = self.client_context(handle) else {
            store_trace!("{}: dropping a delivery for a gone reader", handle);
            return;
        };
        if let Some((callback, answer)) = sc.finish_callback(&mut cx) {
            callback(self, handle, answer);
        }
    }
}

impl<D: Disk + fmt::Debug> fmt::Debug for Store<D> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Store")
            .field("entries", &self.entries)
            .field("clients", &self.clients.len())
            .field("disk", &self.inner.disk)
            .field("stats", &self.inner.stats)
            .finish()
    }
}
