//! # Association Store
//!
//! Arena that exclusively owns every stored [`SecurityAssociation`].
//!
//! ```text
//!   slots:  [ gen 3 │ SA ][ gen 1 │ -- ][ gen 0 │ SA ] ...
//!                               ▲
//!   free:   [ 1 ] ──────────────┘   reused slot bumps its generation
//!
//!   index:  SaKey ──▶ [ SaHandle, SaHandle ]   (Keyed Index, newest first)
//! ```
//!
//! Other tables only ever hold [`SaHandle`]s; a handle whose generation no
//! longer matches its slot resolves to nothing.

use alloc::vec::Vec;

use crate::error::{SaError, SaResult};
use crate::key::{KeyedIndex, SaKey};
use crate::sa::{SaHandle, SecurityAssociation};

/// One arena slot
#[derive(Debug)]
struct Slot {
    /// Bumped every time the slot is vacated
    generation: u32,
    /// Occupant, if any
    record: Option<SecurityAssociation>,
}

/// Authoritative owner of all association records
#[derive(Debug)]
pub struct SaStore {
    /// Record arena
    slots: Vec<Slot>,
    /// Vacant slot indices
    free: Vec<u32>,
    /// Identity index
    index: KeyedIndex<SaKey, SaHandle>,
    /// Number of occupied slots
    live: usize,
}

impl SaStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::with_capacity(0)
    }

    /// Create a store sized for `capacity` records
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: Vec::with_capacity(capacity),
            free: Vec::new(),
            index: KeyedIndex::with_capacity(capacity),
            live: 0,
        }
    }

    /// Take ownership of a record and index it by identity
    pub fn insert(&mut self, record: SecurityAssociation) -> SaResult<SaHandle> {
        let key = record.key;

        let handle = match self.free.pop() {
            Some(slot) => {
                let entry = &mut self.slots[slot as usize];
                entry.record = Some(record);
                SaHandle::new(slot, entry.generation)
            },
            None => {
                let slot = u32::try_from(self.slots.len()).map_err(|_| SaError::OutOfResources)?;
                self.slots
                    .try_reserve(1)
                    .map_err(|_| SaError::OutOfResources)?;
                self.slots.push(Slot {
                    generation: 0,
                    record: Some(record),
                });
                SaHandle::new(slot, 0)
            },
        };

        if let Err(err) = self.index.insert(key, handle) {
            // Undo the slot claim so the arena stays consistent
            self.vacate(handle);
            return Err(err);
        }

        self.live += 1;
        Ok(handle)
    }

    /// Resolve a handle
    pub fn get(&self, handle: SaHandle) -> Option<&SecurityAssociation> {
        let slot = self.slots.get(handle.slot() as usize)?;
        if slot.generation != handle.generation() {
            return None;
        }
        slot.record.as_ref()
    }

    /// Resolve a handle mutably
    pub fn get_mut(&mut self, handle: SaHandle) -> Option<&mut SecurityAssociation> {
        let slot = self.slots.get_mut(handle.slot() as usize)?;
        if slot.generation != handle.generation() {
            return None;
        }
        slot.record.as_mut()
    }

    /// Newest record under `key` matching `pred`
    pub fn find<F>(&self, key: &SaKey, mut pred: F) -> Option<SaHandle>
    where
        F: FnMut(&SecurityAssociation) -> bool,
    {
        self.index
            .find(key, |h| self.get(*h).is_some_and(&mut pred))
            .copied()
    }

    /// Newest COMPLETE record under `key`
    pub fn find_complete(&self, key: &SaKey) -> Option<SaHandle> {
        self.find(key, SecurityAssociation::is_complete)
    }

    /// Newest non-retired record under `key` (complete or provisional)
    pub fn find_live(&self, key: &SaKey) -> Option<SaHandle> {
        self.find(key, SecurityAssociation::is_live)
    }

    /// Remove a record from the arena and the identity index
    pub fn erase(&mut self, handle: SaHandle) -> Option<SecurityAssociation> {
        let key = self.get(handle)?.key;
        self.index.remove(&key, |h| *h == handle);
        let record = self.vacate(handle);
        self.live -= 1;
        record
    }

    /// Clear a slot, bump its generation and recycle it
    fn vacate(&mut self, handle: SaHandle) -> Option<SecurityAssociation> {
        let slot = &mut self.slots[handle.slot() as usize];
        let record = slot.record.take();
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(handle.slot());
        record
    }

    /// Handles of all occupied slots, in slot order
    pub fn handles(&self) -> impl Iterator<Item = SaHandle> + '_ {
        self.slots.iter().enumerate().filter_map(|(i, slot)| {
            slot.record
                .as_ref()
                .map(|_| SaHandle::new(i as u32, slot.generation))
        })
    }

    /// First occupied slot at or after `cursor` whose record matches `pred`
    pub fn next_from<F>(&self, cursor: u32, mut pred: F) -> Option<(SaHandle, &SecurityAssociation)>
    where
        F: FnMut(&SecurityAssociation) -> bool,
    {
        self.slots
            .iter()
            .enumerate()
            .skip(cursor as usize)
            .find_map(|(i, slot)| {
                let record = slot.record.as_ref().filter(|r| pred(*r))?;
                Some((SaHandle::new(i as u32, slot.generation), record))
            })
    }

    /// Number of stored records (all states)
    pub fn len(&self) -> usize {
        self.live
    }

    /// Is the store empty?
    pub fn is_empty(&self) -> bool {
        self.live == 0
    }
}

impl Default for SaStore {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use core::net::{IpAddr, Ipv4Addr};

    use super::*;
    use crate::sa::{SaFlags, SaType};

    fn record(spi: u32) -> SecurityAssociation {
        SecurityAssociation::new(
            SaType::Esp,
            IpAddr::V4(Ipv4Addr::new(192, 168, 1, 1)),
            IpAddr::V4(Ipv4Addr::new(192, 168, 1, 2)),
            spi,
        )
    }

    #[test]
    fn test_insert_and_resolve() {
        let mut store = SaStore::new();
        let handle = store.insert(record(7)).unwrap();

        assert_eq!(store.len(), 1);
        assert_eq!(store.get(handle).map(|r| r.spi()), Some(7));
        assert_eq!(store.find_complete(&record(7).key), Some(handle));
        assert_eq!(store.find_complete(&record(8).key), None);
    }

    #[test]
    fn test_stale_handle_after_slot_reuse() {
        let mut store = SaStore::new();
        let old = store.insert(record(1)).unwrap();
        assert!(store.erase(old).is_some());

        let new = store.insert(record(2)).unwrap();
        assert_eq!(new.slot(), old.slot());
        assert_ne!(new.generation(), old.generation());
        assert!(store.get(old).is_none());
        assert!(store.erase(old).is_none());
        assert_eq!(store.get(new).map(|r| r.spi()), Some(2));
    }

    #[test]
    fn test_visibility_filters() {
        let mut store = SaStore::new();
        let mut provisional = record(5);
        provisional.flags.insert(SaFlags::PROVISIONAL);
        let handle = store.insert(provisional).unwrap();

        assert_eq!(store.find_complete(&record(5).key), None);
        assert_eq!(store.find_live(&record(5).key), Some(handle));

        store.get_mut(handle).unwrap().flags.insert(SaFlags::RETIRED);
        assert_eq!(store.find_live(&record(5).key), None);
    }

    #[test]
    fn test_cursor_walk() {
        let mut store = SaStore::new();
        let a = store.insert(record(1)).unwrap();
        let b = store.insert(record(2)).unwrap();
        let c = store.insert(record(3)).unwrap();
        store.erase(b);

        let (first, _) = store.next_from(0, |_| true).unwrap();
        assert_eq!(first, a);
        let (second, _) = store.next_from(first.slot() + 1, |_| true).unwrap();
        assert_eq!(second, c);
        assert!(store.next_from(second.slot() + 1, |_| true).is_none());
        assert_eq!(store.handles().count(), 2);
    }
}
