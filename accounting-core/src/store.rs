//! Ledger Store: id-indexed arenas
//!
//! A record's id *is* its index. Ids are handed out in increasing order and are
//! never reused; slots for ids that were skipped while loading stay empty.
//! Because a parent allocation is always created before its children, a forward
//! scan starting right after a node visits every one of its descendants.

use crate::error::{Error, Result};

/// Growable, index-addressed collection of records
#[derive(Debug, Clone)]
pub struct Arena<T> {
    slots: Vec<Option<T>>,
}

impl<T> Arena<T> {
    /// Create an empty arena
    pub fn new() -> Self {
        Self { slots: Vec::new() }
    }

    /// Id the next appended record receives
    pub fn next_id(&self) -> u32 {
        debug_assert!(self.slots.len() <= u32::MAX as usize);
        self.slots.len() as u32
    }

    /// Number of occupied slots
    pub fn count(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    /// Whether no record has ever been stored
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Record with the given id
    pub fn get(&self, id: u32) -> Option<&T> {
        self.slots.get(id as usize).and_then(Option::as_ref)
    }

    /// Mutable record with the given id
    pub fn get_mut(&mut self, id: u32) -> Option<&mut T> {
        self.slots.get_mut(id as usize).and_then(Option::as_mut)
    }

    /// Append a new record built from its freshly assigned id
    pub fn append(&mut self, build: impl FnOnce(u32) -> T) -> u32 {
        let id = self.next_id();
        self.slots.push(Some(build(id)));
        id
    }

    /// Place a loaded record at its id. Records must arrive in ascending id order.
    pub fn restore(&mut self, id: u32, record: T) -> Result<()> {
        let index = id as usize;
        if index < self.slots.len() {
            return Err(Error::Storage(format!(
                "duplicate or out-of-order record id {} (next id is {})",
                id,
                self.slots.len()
            )));
        }

        self.slots.resize_with(index, || None);
        self.slots.push(Some(record));
        Ok(())
    }

    /// All records in ascending id order
    pub fn iter(&self) -> impl Iterator<Item = &T> + '_ {
        self.slots.iter().filter_map(Option::as_ref)
    }

    /// All records in ascending id order, mutably
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut T> + '_ {
        self.slots.iter_mut().filter_map(Option::as_mut)
    }

    /// Records with an id greater than or equal to `id`, in ascending order
    pub fn iter_from(&self, id: u32) -> impl Iterator<Item = &T> + '_ {
        self.slots
            .iter()
            .skip(id as usize)
            .filter_map(Option::as_ref)
    }
}

impl<T> Default for Arena<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_assigns_dense_ids() {
        let mut arena = Arena::new();
        assert_eq!(arena.append(|id| id * 10), 0);
        assert_eq!(arena.append(|id| id * 10), 1);
        assert_eq!(arena.append(|id| id * 10), 2);

        assert_eq!(arena.get(1), Some(&10));
        assert_eq!(arena.get(3), None);
        assert_eq!(arena.next_id(), 3);
    }

    #[test]
    fn test_restore_leaves_gaps_empty() {
        let mut arena = Arena::new();
        arena.restore(2, "two").unwrap();
        arena.restore(5, "five").unwrap();

        assert_eq!(arena.get(0), None);
        assert_eq!(arena.get(2), Some(&"two"));
        assert_eq!(arena.get(4), None);
        assert_eq!(arena.count(), 2);
        assert_eq!(arena.next_id(), 6);

        // New records continue after the highest loaded id
        assert_eq!(arena.append(|_| "six"), 6);
    }

    #[test]
    fn test_restore_rejects_duplicates() {
        let mut arena = Arena::new();
        arena.restore(3, 'a').unwrap();
        assert!(arena.restore(3, 'b').is_err());
        assert!(arena.restore(1, 'c').is_err());
    }

    #[test]
    fn test_iter_from_skips_earlier_ids() {
        let mut arena = Arena::new();
        for _ in 0..5 {
            arena.append(|id| id);
        }

        let tail: Vec<u32> = arena.iter_from(3).copied().collect();
        assert_eq!(tail, vec![3, 4]);
        assert_eq!(arena.iter_from(10).count(), 0);
    }

    #[test]
    fn test_get_mut_updates_in_place() {
        let mut arena = Arena::new();
        let id = arena.append(|_| 1i64);
        *arena.get_mut(id).unwrap() += 41;
        assert_eq!(arena.get(id), Some(&42));
    }
}
