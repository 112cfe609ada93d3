//! Identifier allocation and the arenas holding processes and threads
use alloc::vec::Vec;
use log::warn;

/// Allocator to manage new ID assignment/reassignment/deletion, etc.
#[derive(Debug, Default)]
pub struct RecycleAllocator {
    /// Start position of unassigned id
    current: usize,
    recycled: Vec<usize>,
}

impl RecycleAllocator {
    ///Create an empty `RecycleAllocator`
    pub fn new() -> Self {
        RecycleAllocator {
            current: 0,
            recycled: Vec::new(),
        }
    }

    ///Allocate a id(identifier), lowest recycled one first
    pub fn alloc(&mut self) -> usize {
        if let Some((pos, _)) = self
            .recycled
            .iter()
            .enumerate()
            .min_by_key(|(_, id)| **id)
        {
            self.recycled.swap_remove(pos)
        } else {
            self.current += 1;
            self.current - 1
        }
    }

    ///Recycle a id(identifier)
    pub fn dealloc(&mut self, id: usize) {
        if id >= self.current || self.recycled.contains(&id) {
            warn!("id {} has been deallocated!", id);
            return;
        }
        self.recycled.push(id);
    }

    /// Number of ids handed out and not recycled.
    pub fn in_use(&self) -> usize {
        self.current - self.recycled.len()
    }
}

/// Records addressed by stable integer keys.
///
/// Keys of removed records are recycled.
pub struct Slab<T> {
    entries: Vec<Option<T>>,
    keys: RecycleAllocator,
}

impl<T> Default for Slab<T> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
            keys: RecycleAllocator::new(),
        }
    }
}

impl<T> Slab<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, value: T) -> usize {
        let key = self.keys.alloc();
        if key == self.entries.len() {
            self.entries.push(Some(value));
        } else {
            self.entries[key] = Some(value);
        }
        key
    }

    pub fn remove(&mut self, key: usize) -> Option<T> {
        let value = self.entries.get_mut(key)?.take()?;
        self.keys.dealloc(key);
        Some(value)
    }

    pub fn get(&self, key: usize) -> Option<&T> {
        self.entries.get(key)?.as_ref()
    }

    pub fn get_mut(&mut self, key: usize) -> Option<&mut T> {
        self.entries.get_mut(key)?.as_mut()
    }

    pub fn len(&self) -> usize {
        self.keys.in_use()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &T)> {
        self.entries
            .iter()
            .enumerate()
            .filter_map(|(key, entry)| entry.as_ref().map(|value| (key, value)))
    }
}

/// Process id: the tid of the process's main thread, never reused.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProcessId(pub usize);

/// Handle of a thread record: the owning process and the key in its thread arena.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ThreadId {
    pub process: ProcessId,
    pub key: usize,
}

impl ThreadId {
    pub fn new(process: ProcessId, key: usize) -> Self {
        Self { process, key }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recycled_ids_come_back_lowest_first() {
        let mut ids = RecycleAllocator::new();
        assert_eq!((ids.alloc(), ids.alloc(), ids.alloc()), (0, 1, 2));
        ids.dealloc(2);
        ids.dealloc(0);
        assert_eq!(ids.in_use(), 1);
        assert_eq!(ids.alloc(), 0);
        assert_eq!(ids.alloc(), 2);
        assert_eq!(ids.alloc(), 3);
    }

    #[test]
    fn double_recycle_is_ignored() {
        let mut ids = RecycleAllocator::new();
        let id = ids.alloc();
        ids.dealloc(id);
        ids.dealloc(id);
        ids.dealloc(7);
        assert_eq!(ids.in_use(), 0);
        assert_eq!(ids.alloc(), 0);
        assert_eq!(ids.alloc(), 1);
    }

    #[test]
    fn slab_keys_are_stable() {
        let mut slab = Slab::new();
        let a = slab.insert("a");
        let b = slab.insert("b");
        assert_eq!(slab.remove(a), Some("a"));
        assert_eq!(slab.remove(a), None);
        assert_eq!(slab.get(b), Some(&"b"));
        assert_eq!(slab.len(), 1);
        let c = slab.insert("c");
        assert_eq!(c, a);
        assert_eq!(slab.iter().collect::<Vec<_>>(), [(0, &"c"), (1, &"b")]);
    }
}
