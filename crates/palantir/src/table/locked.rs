use parking_lot::Mutex;

use super::{Entry, ResourceState, ResourceTable, TableStrategy, first_free, states};
use crate::error::PoolError;
use crate::resource::{Resource, ResourceId};

/// Every operation, read or write, takes the same lock.
pub struct LockedTable {
    entries: Mutex<Vec<Entry>>,
}

impl LockedTable {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(vec![Entry::default(); capacity]),
        }
    }
}

impl ResourceTable for LockedTable {
    fn strategy(&self) -> TableStrategy {
        TableStrategy::Locked
    }

    fn capacity(&self) -> usize {
        self.entries.lock().len()
    }

    fn claim_free(&self) -> Option<Resource> {
        let mut entries = self.entries.lock();
        let index = first_free(&entries, None)?;
        let entry = &mut entries[index];
        entry.lease();
        Some(Resource {
            id: ResourceId::from_index(index),
            generation: entry.generation,
        })
    }

    fn mark_free(&self, id: ResourceId) -> Result<bool, PoolError> {
        let mut entries = self.entries.lock();
        let entry = entries
            .get_mut(id.index())
            .ok_or(PoolError::UnknownResource(id))?;
        let was_leased = entry.leased;
        entry.leased = false;
        Ok(was_leased)
    }

    fn is_free(&self, id: ResourceId) -> Option<bool> {
        self.entries.lock().get(id.index()).map(|e| !e.leased)
    }

    fn free_count(&self) -> usize {
        self.entries.lock().iter().filter(|e| !e.leased).count()
    }

    fn generation(&self, id: ResourceId) -> Option<u64> {
        self.entries.lock().get(id.index()).map(|e| e.generation)
    }

    fn snapshot(&self) -> Vec<ResourceState> {
        states(&self.entries.lock())
    }
}
