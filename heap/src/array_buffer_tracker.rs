//! Off-heap backing stores owned by array buffer objects.
//!
//! Backing stores live outside the managed heap, so the collectors tell the
//! tracker which buffer objects survived and it frees the rest.

use std::alloc::{self, Layout};

use object::{Address, HeapObject};

use crate::fatal_out_of_memory;
use crate::space::{AddressMap, AddressSet};

const BACKING_STORE_ALIGNMENT: usize = 16;

/// A malloc'd region owned by one array buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackingStore {
    pub data: Address,
    pub byte_length: usize,
}

impl BackingStore {
    /// Allocate `byte_length` zeroed bytes. Failure is fatal.
    pub fn allocate(byte_length: usize) -> Self {
        let layout = Self::layout(byte_length);
        // SAFETY: the layout has a non-zero size
        let data = unsafe { alloc::alloc_zeroed(layout) };
        if data.is_null() {
            fatal_out_of_memory("ArrayBufferTracker::allocate");
        }
        Self {
            data: data as Address,
            byte_length,
        }
    }

    fn layout(byte_length: usize) -> Layout {
        match Layout::from_size_align(byte_length.max(1), BACKING_STORE_ALIGNMENT) {
            Ok(layout) => layout,
            Err(_) => fatal_out_of_memory("BackingStore::layout"),
        }
    }

    /// # Safety
    /// The store must come from [`BackingStore::allocate`] and not be
    /// freed yet.
    unsafe fn free(self) {
        // SAFETY: forwarded by contract
        unsafe { alloc::dealloc(self.data as *mut u8, Self::layout(self.byte_length)) };
    }
}

/// Bookkeeping for every live array buffer, split by generation so a
/// scavenge only looks at young buffers.
#[derive(Debug, Default)]
pub struct ArrayBufferTracker {
    young: AddressMap<BackingStore>,
    old: AddressMap<BackingStore>,
    /// Buffers the current marking cycle has not reached yet.
    not_yet_discovered: AddressSet,
    discovering: bool,
    freed_count: usize,
    freed_bytes: usize,
}

impl ArrayBufferTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking the backing store of a freshly allocated buffer.
    pub fn register(&mut self, buffer: HeapObject, store: BackingStore, young: bool) {
        let map = if young { &mut self.young } else { &mut self.old };
        map.insert(buffer.address(), store);
        if self.discovering {
            self.not_yet_discovered.insert(buffer.address());
        }
    }

    pub fn backing_store(&self, buffer: HeapObject) -> Option<BackingStore> {
        let address = buffer.address();
        self.young
            .get(&address)
            .or_else(|| self.old.get(&address))
            .copied()
    }

    pub fn is_tracked_young(&self, buffer: HeapObject) -> bool {
        self.young.contains_key(&buffer.address())
    }

    pub fn is_tracked_old(&self, buffer: HeapObject) -> bool {
        self.old.contains_key(&buffer.address())
    }

    pub fn len(&self) -> usize {
        self.young.len() + self.old.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Backing stores freed since the heap was set up.
    pub fn freed_count(&self) -> usize {
        self.freed_count
    }

    pub fn freed_bytes(&self) -> usize {
        self.freed_bytes
    }

    /// Bytes of backing store currently retained.
    pub fn retained_bytes(&self) -> usize {
        self.young
            .values()
            .chain(self.old.values())
            .map(|store| store.byte_length)
            .sum()
    }

    fn release(&mut self, store: BackingStore) -> usize {
        // SAFETY: every tracked store came from `BackingStore::allocate` and
        // leaves the tracker exactly once
        unsafe { store.free() };
        self.freed_count += 1;
        self.freed_bytes += store.byte_length;
        store.byte_length
    }

    // ── Scavenge ──────────────────────────────────────────────────────

    /// Resolve young buffers after a scavenge. `forward` returns the new
    /// location of a buffer that survived, `is_young` says whether that
    /// location is still in new space. Returns the bytes freed.
    pub(crate) fn process_young(
        &mut self,
        mut forward: impl FnMut(HeapObject) -> Option<HeapObject>,
        is_young: impl Fn(Address) -> bool,
    ) -> usize {
        let mut freed = 0;
        let young = std::mem::take(&mut self.young);
        for (address, store) in young {
            match forward(HeapObject::from_address(address)) {
                Some(to) => {
                    if self.discovering && self.not_yet_discovered.remove(&address) {
                        self.not_yet_discovered.insert(to.address());
                    }
                    if is_young(to.address()) {
                        self.young.insert(to.address(), store);
                    } else {
                        self.old.insert(to.address(), store);
                    }
                }
                None => {
                    self.not_yet_discovered.remove(&address);
                    freed += self.release(store);
                }
            }
        }
        freed
    }

    // ── Mark-compact ──────────────────────────────────────────────────

    /// Every tracked buffer starts out undiscovered.
    pub(crate) fn start_discovery(&mut self) {
        self.not_yet_discovered.clear();
        self.not_yet_discovered
            .extend(self.young.keys().chain(self.old.keys()).copied());
        self.discovering = true;
    }

    /// Marking reached `buffer`.
    #[inline]
    pub(crate) fn discover(&mut self, buffer: HeapObject) {
        if self.discovering {
            self.not_yet_discovered.remove(&buffer.address());
        }
    }

    pub(crate) fn is_discovering(&self) -> bool {
        self.discovering
    }

    /// Free every buffer marking never reached. Returns the bytes freed.
    pub(crate) fn free_undiscovered(&mut self) -> usize {
        let mut freed = 0;
        let dead: Vec<Address> = self.not_yet_discovered.drain().collect();
        for address in dead {
            let store = self.young.remove(&address).or_else(|| self.old.remove(&address));
            if let Some(store) = store {
                freed += self.release(store);
            }
        }
        self.discovering = false;
        freed
    }

    /// Abandon a discovery cycle without freeing anything.
    pub(crate) fn abort_discovery(&mut self) {
        self.not_yet_discovered.clear();
        self.discovering = false;
    }

    /// Rekey buffers that moved during evacuation.
    pub(crate) fn update_references(
        &mut self,
        mut forward: impl FnMut(HeapObject) -> HeapObject,
        is_young: impl Fn(Address) -> bool,
    ) {
        let entries: Vec<(Address, BackingStore)> =
            self.young.drain().chain(self.old.drain()).collect();
        for (address, store) in entries {
            let to = forward(HeapObject::from_address(address)).address();
            if is_young(to) {
                self.young.insert(to, store);
            } else {
                self.old.insert(to, store);
            }
        }
    }

    /// Free every backing store.
    pub(crate) fn tear_down(&mut self) {
        let stores: Vec<BackingStore> =
            self.young.drain().chain(self.old.drain()).map(|(_, s)| s).collect();
        for store in stores {
            self.release(store);
        }
        self.abort_discovery();
    }
}

impl Drop for ArrayBufferTracker {
    fn drop(&mut self) {
        self.tear_down();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buffer(address: Address) -> HeapObject {
        HeapObject::from_address(address)
    }

    #[test]
    fn scavenge_frees_unreached_young_buffers() {
        let mut tracker = ArrayBufferTracker::new();
        tracker.register(buffer(0x1000), BackingStore::allocate(64), true);
        tracker.register(buffer(0x2000), BackingStore::allocate(32), true);
        tracker.register(buffer(0x9000), BackingStore::allocate(16), false);

        let freed = tracker.process_young(
            |object| (object.address() == 0x1000).then(|| buffer(0x5000)),
            |address| address < 0x8000,
        );
        assert_eq!(freed, 32);
        assert_eq!(tracker.freed_count(), 1);
        assert!(tracker.is_tracked_young(buffer(0x5000)));
        assert!(tracker.is_tracked_old(buffer(0x9000)));
        assert_eq!(tracker.len(), 2);
    }

    #[test]
    fn promotion_moves_buffer_to_old_map() {
        let mut tracker = ArrayBufferTracker::new();
        tracker.register(buffer(0x1000), BackingStore::allocate(8), true);
        tracker.process_young(|_| Some(buffer(0x9000)), |address| address < 0x8000);
        assert!(tracker.is_tracked_old(buffer(0x9000)));
        assert!(!tracker.is_tracked_young(buffer(0x9000)));
    }

    #[test]
    fn discovery_frees_what_marking_missed() {
        let mut tracker = ArrayBufferTracker::new();
        tracker.register(buffer(0x1000), BackingStore::allocate(8), false);
        tracker.register(buffer(0x2000), BackingStore::allocate(8), false);
        tracker.start_discovery();
        tracker.register(buffer(0x3000), BackingStore::allocate(8), true);
        tracker.discover(buffer(0x2000));
        assert_eq!(tracker.free_undiscovered(), 16);
        assert_eq!(tracker.len(), 1);
        assert!(tracker.backing_store(buffer(0x2000)).is_some());
        assert!(!tracker.is_discovering());
    }
}
