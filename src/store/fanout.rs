use alloc::vec::Vec;

use super::{EntryHandle, Store};
use crate::client::ClientFlags;
use crate::disk::Disk;

impl<D: Disk> Store<D> {
    /// Let every waiting reader of `entry` look at the entry again.
    ///
    /// Readers busy with a disk read, or already copying, are left alone:
    /// they look at the entry anyway when they are done.
    pub(crate) fn notify_all(&mut self, entry: EntryHandle) {
        let handles: Vec<_> = match self.entries.get(entry.0) {
            Some(Some(e)) => e.mem().clients.clone(),
            _ => return,
        };
        store_trace!("{}: notifying {} readers", entry, handles.len());

        for handle in handles {
            // A reader may be gone by the time its turn comes.
            let Some((client, mut cx)) = self.client_context(handle) else {
                continue;
            };
            if !client.pending() {
                continue;
            }
            if client
                .flags()
                .intersects(ClientFlags::DISK_IO_PENDING | ClientFlags::STORE_COPYING)
            {
                store_verbose!("{}: {} is busy", entry, handle);
                continue;
            }
            client.copy2(&mut cx);
        }

        self.kick_reads(entry);
    }
}
