//! Stamped table: optimistic scans, pessimistic fallback, in-place write upgrade.
//!
//! The authoritative entries live behind a `RwLock`. Writers additionally
//! mirror each free flag into an atomic and bump a stamp around every write
//! (odd while a write is in progress). Readers scan the mirrors without
//! locking and trust the result only if the stamp is even and unchanged
//! afterwards; otherwise they retry under the read lock.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering, fence};

use parking_lot::{RwLock, RwLockUpgradableReadGuard, RwLockWriteGuard};

use super::{Entry, ResourceState, ResourceTable, TableStrategy, first_free, states};
use crate::error::PoolError;
use crate::resource::{Resource, ResourceId};

pub struct OptimisticTable {
    stamp: AtomicU64,
    free: Box<[AtomicBool]>,
    entries: RwLock<Vec<Entry>>,
}

impl OptimisticTable {
    pub fn new(capacity: usize) -> Self {
        Self {
            stamp: AtomicU64::new(0),
            free: (0..capacity).map(|_| AtomicBool::new(true)).collect(),
            entries: RwLock::new(vec![Entry::default(); capacity]),
        }
    }

    /// Current stamp, unless a writer is mid-update.
    fn optimistic_stamp(&self) -> Option<u64> {
        let stamp = self.stamp.load(Ordering::Acquire);
        (stamp & 1 == 0).then_some(stamp)
    }

    /// True if no write started or finished since `stamp` was taken.
    fn validate(&self, stamp: u64) -> bool {
        fence(Ordering::Acquire);
        self.stamp.load(Ordering::Relaxed) == stamp
    }

    fn first_free_flag(&self) -> Option<usize> {
        self.free.iter().position(|f| f.load(Ordering::Relaxed))
    }

    fn begin_write<'a>(&'a self, entries: RwLockWriteGuard<'a, Vec<Entry>>) -> StampedWrite<'a> {
        self.stamp.fetch_add(1, Ordering::Acquire);
        fence(Ordering::Release);
        StampedWrite {
            table: self,
            entries,
        }
    }
}

/// Write section; the stamp returns to even when this drops.
struct StampedWrite<'a> {
    table: &'a OptimisticTable,
    entries: RwLockWriteGuard<'a, Vec<Entry>>,
}

impl StampedWrite<'_> {
    fn lease(&mut self, index: usize) -> Resource {
        let entry = &mut self.entries[index];
        entry.lease();
        self.table.free[index].store(false, Ordering::Relaxed);
        Resource {
            id: ResourceId::from_index(index),
            generation: entry.generation,
        }
    }

    fn free(&mut self, index: usize) {
        self.entries[index].leased = false;
        self.table.free[index].store(true, Ordering::Relaxed);
    }
}

impl Drop for StampedWrite<'_> {
    fn drop(&mut self) {
        self.table.stamp.fetch_add(1, Ordering::Release);
    }
}

impl ResourceTable for OptimisticTable {
    fn strategy(&self) -> TableStrategy {
        TableStrategy::Optimistic
    }

    fn capacity(&self) -> usize {
        self.free.len()
    }

    fn claim_free(&self) -> Option<Resource> {
        // A validated scan that finds nothing answers without taking any lock.
        let mut hint = None;
        if let Some(stamp) = self.optimistic_stamp() {
            let candidate = self.first_free_flag();
            if self.validate(stamp) {
                hint = Some(candidate?);
            }
        }

        let read = self.entries.upgradable_read();
        let index = first_free(&read, hint)?;

        let (entries, index) = match RwLockUpgradableReadGuard::try_upgrade(read) {
            Ok(write) => (write, index),
            Err(read) => {
                // Plain readers are active. Let go and queue for the write lock;
                // the table may change in between, so look again.
                drop(read);
                let write = self.entries.write();
                let index = first_free(&write, Some(index))?;
                (write, index)
            }
        };

        Some(self.begin_write(entries).lease(index))
    }

    fn mark_free(&self, id: ResourceId) -> Result<bool, PoolError> {
        let index = id.index();
        if index >= self.free.len() {
            return Err(PoolError::UnknownResource(id));
        }

        let entries = self.entries.write();
        if !entries[index].leased {
            return Ok(false);
        }
        self.begin_write(entries).free(index);
        Ok(true)
    }

    fn is_free(&self, id: ResourceId) -> Option<bool> {
        let flag = self.free.get(id.index())?;
        if let Some(stamp) = self.optimistic_stamp() {
            let free = flag.load(Ordering::Relaxed);
            if self.validate(stamp) {
                return Some(free);
            }
        }
        self.entries.read().get(id.index()).map(|e| !e.leased)
    }

    fn free_count(&self) -> usize {
        if let Some(stamp) = self.optimistic_stamp() {
            let count = self
                .free
                .iter()
                .filter(|f| f.load(Ordering::Relaxed))
                .count();
            if self.validate(stamp) {
                return count;
            }
        }
        self.entries.read().iter().filter(|e| !e.leased).count()
    }

    fn generation(&self, id: ResourceId) -> Option<u64> {
        self.entries.read().get(id.index()).map(|e| e.generation)
    }

    fn snapshot(&self) -> Vec<ResourceState> {
        states(&self.entries.read())
    }
}
