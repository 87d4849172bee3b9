//! Strings whose characters live in embedder-owned buffers.
//!
//! An external string object stores the index of its resource in this
//! table. Young and old strings are kept in separate lists so a scavenge
//! only walks the young one.

use object::{Address, HeapObject, layout::external_string};

/// Embedder-owned character data.
pub trait ExternalStringResource {
    fn bytes(&self) -> &[u8];

    /// Called once when the owning string dies or the heap is torn down.
    fn dispose(&mut self) {}
}

#[derive(Default)]
pub struct ExternalStringTable {
    resources: Vec<Option<Box<dyn ExternalStringResource>>>,
    free_ids: Vec<usize>,
    young: Vec<HeapObject>,
    old: Vec<HeapObject>,
    disposed: usize,
}

impl ExternalStringTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve a resource id before the string object exists.
    pub(crate) fn add_resource(&mut self, resource: Box<dyn ExternalStringResource>) -> usize {
        match self.free_ids.pop() {
            Some(id) => {
                self.resources[id] = Some(resource);
                id
            }
            None => {
                self.resources.push(Some(resource));
                self.resources.len() - 1
            }
        }
    }

    pub(crate) fn register(&mut self, string: HeapObject, young: bool) {
        if young {
            self.young.push(string);
        } else {
            self.old.push(string);
        }
    }

    fn resource_id(string: HeapObject) -> usize {
        // SAFETY: registered strings are live external strings
        unsafe { string.field(external_string::RESOURCE_OFFSET) }.smi_usize()
    }

    /// The resource behind a live external string.
    pub fn resource(&self, string: HeapObject) -> Option<&dyn ExternalStringResource> {
        self.resources
            .get(Self::resource_id(string))
            .and_then(|resource| resource.as_deref())
    }

    pub fn young_len(&self) -> usize {
        self.young.len()
    }

    pub fn old_len(&self) -> usize {
        self.old.len()
    }

    pub fn contains_young(&self, string: HeapObject) -> bool {
        self.young.contains(&string)
    }

    pub fn contains_old(&self, string: HeapObject) -> bool {
        self.old.contains(&string)
    }

    /// Resources disposed since setup.
    pub fn disposed(&self) -> usize {
        self.disposed
    }

    fn dispose_id(&mut self, id: usize) {
        if let Some(mut resource) = self.resources.get_mut(id).and_then(Option::take) {
            resource.dispose();
            self.free_ids.push(id);
            self.disposed += 1;
        }
    }

    fn dispose(&mut self, string: HeapObject) {
        self.dispose_id(Self::resource_id(string));
    }

    /// After a scavenge: follow survivors, move promoted ones to the old
    /// list, dispose the rest. The string objects of dead entries are still
    /// readable in from-space.
    pub(crate) fn process_young(
        &mut self,
        mut forward: impl FnMut(HeapObject) -> Option<HeapObject>,
        is_young: impl Fn(Address) -> bool,
    ) {
        let young = std::mem::take(&mut self.young);
        for string in young {
            match forward(string) {
                Some(to) if is_young(to.address()) => self.young.push(to),
                Some(to) => self.old.push(to),
                None => self.dispose(string),
            }
        }
    }

    /// After marking: dispose every string marking did not reach.
    pub(crate) fn process_dead(&mut self, mut is_live: impl FnMut(HeapObject) -> bool) -> usize {
        let before = self.disposed;
        let mut dead = Vec::new();
        for list in [&mut self.young, &mut self.old] {
            list.retain(|&string| {
                let live = is_live(string);
                if !live {
                    dead.push(string);
                }
                live
            });
        }
        for string in dead {
            self.dispose(string);
        }
        self.disposed - before
    }

    /// After evacuation: follow moved strings and rebalance the lists.
    pub(crate) fn update_references(
        &mut self,
        mut forward: impl FnMut(HeapObject) -> HeapObject,
        is_young: impl Fn(Address) -> bool,
    ) {
        let all: Vec<HeapObject> = self.young.drain(..).chain(self.old.drain(..)).collect();
        for string in all {
            let to = forward(string);
            if is_young(to.address()) {
                self.young.push(to);
            } else {
                self.old.push(to);
            }
        }
    }

    /// Dispose every remaining resource.
    pub(crate) fn tear_down(&mut self) {
        self.young.clear();
        self.old.clear();
        for id in 0..self.resources.len() {
            self.dispose_id(id);
        }
        self.resources.clear();
        self.free_ids.clear();
    }
}

impl Drop for ExternalStringTable {
    fn drop(&mut self) {
        self.tear_down();
    }
}

impl core::fmt::Debug for ExternalStringTable {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ExternalStringTable")
            .field("young", &self.young.len())
            .field("old", &self.old.len())
            .field("disposed", &self.disposed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::rc::Rc;

    use object::{ShapeId, WORD_SIZE, layout};

    use super::*;

    struct Chars {
        data: &'static [u8],
        disposed: Rc<Cell<usize>>,
    }

    impl ExternalStringResource for Chars {
        fn bytes(&self) -> &[u8] {
            self.data
        }

        fn dispose(&mut self) {
            self.disposed.set(self.disposed.get() + 1);
        }
    }

    /// Word-aligned scratch memory holding a few string objects.
    fn create_strings(table: &mut ExternalStringTable, count: usize) -> (Vec<u64>, Rc<Cell<usize>>) {
        let disposed = Rc::new(Cell::new(0));
        let mut memory = vec![0u64; count * layout::external_string::SIZE / WORD_SIZE];
        for i in 0..count {
            let id = table.add_resource(Box::new(Chars {
                data: b"hello",
                disposed: disposed.clone(),
            }));
            let address = memory.as_mut_ptr() as usize + i * layout::external_string::SIZE;
            unsafe { layout::init_external_string(HeapObject::from_address(address), 5, id) };
        }
        (memory, disposed)
    }

    fn string_at(memory: &[u64], index: usize) -> HeapObject {
        HeapObject::from_address(memory.as_ptr() as usize + index * layout::external_string::SIZE)
    }

    #[test]
    fn scavenge_disposes_dead_and_promotes_survivors() {
        let mut table = ExternalStringTable::new();
        let (memory, disposed) = create_strings(&mut table, 3);
        for i in 0..3 {
            table.register(string_at(&memory, i), true);
        }
        let (a, b) = (string_at(&memory, 0), string_at(&memory, 1));
        table.process_young(
            |s| if s == a || s == b { Some(s) } else { None },
            |address| address == a.address(),
        );
        assert_eq!(disposed.get(), 1);
        assert!(table.contains_young(a));
        assert!(table.contains_old(b));
        assert_eq!(table.resource(a).map(|r| r.bytes()), Some(&b"hello"[..]));
        unsafe { assert_eq!(a.shape(), ShapeId::EXTERNAL_STRING) };
    }

    #[test]
    fn tear_down_disposes_everything_once() {
        let mut table = ExternalStringTable::new();
        let (memory, disposed) = create_strings(&mut table, 2);
        table.register(string_at(&memory, 0), false);
        assert_eq!(table.process_dead(|_| false), 1);
        table.tear_down();
        assert_eq!(disposed.get(), 2);
        assert_eq!(table.disposed(), 2);
    }
}
