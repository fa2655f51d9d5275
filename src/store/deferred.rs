use alloc::collections::VecDeque;

use super::ClientHandle;

/// Deliveries scheduled to run from [Store::poll](struct.Store.html#method.poll).
///
/// A reader that has news for its consumer is put here instead of calling
/// back right away, so a callback never runs inside the call that found the
/// news. A reader is queued at most once.
#[derive(Debug, Default)]
pub(crate) struct DeferredCalls {
    queue: VecDeque<ClientHandle>,
}

impl DeferredCalls {
    pub fn schedule(&mut self, handle: ClientHandle) {
        if self.queue.contains(&handle) {
            store_warn!("{}: delivery already scheduled", handle);
            return;
        }
        store_trace!("{}: delivery scheduled", handle);
        self.queue.push_back(handle);
    }

    /// Drop the delivery scheduled for `handle`, returning whether there was one.
    pub fn cancel(&mut self, handle: ClientHandle) -> bool {
        let before = self.queue.len();
        self.queue.retain(|&queued| queued != handle);
        let cancelled = self.queue.len() != before;
        if cancelled {
            store_trace!("{}: delivery cancelled", handle);
        }
        cancelled
    }

    pub fn pop(&mut self) -> Option<ClientHandle> {
        self.queue.pop_front()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}
