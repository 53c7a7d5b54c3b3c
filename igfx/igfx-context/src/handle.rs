//! # Sparse Handle Table
//!
//! Maps user-visible integer ids to values. A dense slot vector with a
//! free list; freed ids are reused in LIFO order. This is deliberately a
//! separate layer from the context records themselves so the id policy
//! can change without touching context semantics.

use alloc::vec::Vec;

/// A user-visible id issued by a [`HandleTable`].
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct Handle(u32);

impl Handle {
    /// The raw id value.
    #[inline]
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

/// Sparse id → value table.
pub struct HandleTable<T> {
    slots: Vec<Option<T>>,
    free: Vec<u32>,
}

impl<T> HandleTable<T> {
    /// An empty table.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
        }
    }

    /// Insert a value and issue its handle.
    pub fn insert(&mut self, value: T) -> Handle {
        if let Some(id) = self.free.pop() {
            self.slots[id as usize] = Some(value);
            Handle(id)
        } else {
            #[allow(clippy::cast_possible_truncation)]
            let id = self.slots.len() as u32;
            self.slots.push(Some(value));
            Handle(id)
        }
    }

    /// Look up a live handle.
    #[must_use]
    pub fn get(&self, handle: Handle) -> Option<&T> {
        self.slots.get(handle.0 as usize)?.as_ref()
    }

    /// Remove a handle, returning its value if it was live.
    pub fn remove(&mut self, handle: Handle) -> Option<T> {
        let value = self.slots.get_mut(handle.0 as usize)?.take();
        if value.is_some() {
            self.free.push(handle.0);
        }
        value
    }

    /// Number of live entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    /// Whether no entries are live.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Default for HandleTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_get_remove() {
        let mut table = HandleTable::new();
        let a = table.insert("a");
        let b = table.insert("b");
        assert_ne!(a, b);
        assert_eq!(table.get(a), Some(&"a"));
        assert_eq!(table.remove(a), Some("a"));
        assert_eq!(table.get(a), None);
        assert_eq!(table.get(b), Some(&"b"));
    }

    #[test]
    fn freed_ids_are_reused() {
        let mut table = HandleTable::new();
        let a = table.insert(1);
        table.remove(a);
        let c = table.insert(3);
        assert_eq!(c, a);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn double_remove_is_inert() {
        let mut table = HandleTable::new();
        let a = table.insert(1);
        assert_eq!(table.remove(a), Some(1));
        assert_eq!(table.remove(a), None);
        assert!(table.is_empty());
    }
}
