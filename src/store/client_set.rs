use alloc::vec::Vec;
use core::fmt;

use crate::client::StoreClient;
use crate::disk::Disk;

/// A handle, identifying a reader in a [Store](struct.Store.html).
///
/// Slots are reused once a reader unregisters; the generation tells a
/// stale handle apart from the reader now occupying its slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Hash)]
pub struct ClientHandle {
    index: usize,
    generation: u32,
}

impl ClientHandle {
    pub(crate) const fn new(index: usize, generation: u32) -> ClientHandle {
        ClientHandle { index, generation }
    }
}

impl fmt::Display for ClientHandle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "#{}", self.index)
    }
}

/// Space for storing one reader.
struct Slot<D: Disk> {
    generation: u32,
    client: Option<StoreClient<D>>,
}

/// An extensible set of readers.
pub(crate) struct ClientSet<D: Disk> {
    slots: Vec<Slot<D>>,
}

impl<D: Disk> Default for ClientSet<D> {
    fn default() -> Self {
        ClientSet { slots: Vec::new() }
    }
}

impl<D: Disk> ClientSet<D> {
    /// Add a reader to the set, and return its handle.
    pub fn add(&mut self, client: StoreClient<D>) -> ClientHandle {
        fn put<D: Disk>(index: usize, slot: &mut Slot<D>, client: StoreClient<D>) -> ClientHandle {
            store_trace!("[{}]: adding", index);
            slot.client = Some(client);
            ClientHandle::new(index, slot.generation)
        }

        for (index, slot) in self.slots.iter_mut().enumerate() {
            if slot.client.is_none() {
                return put(index, slot, client);
            }
        }

        self.slots.push(Slot {
            generation: 0,
            client: None,
        });
        let index = self.slots.len() - 1;
        put(index, &mut self.slots[index], client)
    }

    /// Query whether the handle refers to a registered reader.
    #[cfg(test)]
    pub fn contains(&self, handle: ClientHandle) -> bool {
        self.try_get(handle).is_some()
    }

    pub fn try_get(&self, handle: ClientHandle) -> Option<&StoreClient<D>> {
        match self.slots.get(handle.index) {
            Some(slot) if slot.generation == handle.generation => slot.client.as_ref(),
            _ => None,
        }
    }

    pub fn try_get_mut(&mut self, handle: ClientHandle) -> Option<&mut StoreClient<D>> {
        match self.slots.get_mut(handle.index) {
            Some(slot) if slot.generation == handle.generation => slot.client.as_mut(),
            _ => None,
        }
    }

    /// Get a reader from the set by its handle.
    ///
    /// # Panics
    /// This function panics if the handle does not refer to a registered reader.
    pub fn get(&self, handle: ClientHandle) -> &StoreClient<D> {
        self.try_get(handle)
            .unwrap_or_else(|| panic!("handle {} does not refer to a valid client", handle))
    }

    /// Remove a reader from the set, without changing its state.
    pub fn remove(&mut self, handle: ClientHandle) -> Option<StoreClient<D>> {
        let slot = self.slots.get_mut(handle.index)?;
        if slot.generation != handle.generation {
            return None;
        }
        let client = slot.client.take()?;
        store_trace!("[{}]: removing", handle.index);
        slot.generation = slot.generation.wrapping_add(1);
        Some(client)
    }

    /// Return the number of registered readers.
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|slot| slot.client.is_some()).count()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::client::ClientKind;
    use crate::disk::Loopback;
    use crate::store::EntryHandle;

    fn client() -> StoreClient<Loopback> {
        StoreClient::new(EntryHandle::new(0), ClientKind::Memory)
    }

    #[test]
    fn test_add_remove_reuse() {
        let mut set = ClientSet::<Loopback>::default();
        let a = set.add(client());
        let b = set.add(client());
        assert_eq!(set.len(), 2);
        assert!(set.remove(a).is_some());
        assert!(!set.contains(a));

        let c = set.add(client());
        assert_eq!(c.to_string(), a.to_string());
        assert_ne!(c, a);
        assert!(set.contains(b));
        assert!(set.contains(c));
    }

    #[test]
    fn test_stale_handle() {
        let mut set = ClientSet::<Loopback>::default();
        let a = set.add(client());
        set.remove(a);
        set.add(client());
        assert!(set.try_get(a).is_none());
        assert!(set.remove(a).is_none());
        assert_eq!(set.len(), 1);
    }

    #[test]
    #[should_panic(expected = "does not refer to a valid client")]
    fn test_get_removed() {
        let mut set = ClientSet::<Loopback>::default();
        let a = set.add(client());
        set.remove(a);
        set.get(a);
    }
}
