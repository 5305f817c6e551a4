//! Resource tables: which palantiri are free, and how often each has been leased.
//!
//! Two interchangeable strategies sit behind [`ResourceTable`]:
//! - [`LockedTable`]: one mutex around every entry.
//! - [`OptimisticTable`]: stamped optimistic reads with pessimistic and
//!   upgrade fallbacks, for scan-heavy workloads.
//!
//! Tables do no admission control. Fairness lives in the semaphore in front of them.

mod locked;
mod optimistic;

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::PoolError;
use crate::resource::{Resource, ResourceId};

pub use locked::LockedTable;
pub use optimistic::OptimisticTable;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TableStrategy {
    #[default]
    Locked,
    Optimistic,
}

impl TableStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Locked => "locked",
            Self::Optimistic => "optimistic",
        }
    }
}

impl std::fmt::Display for TableStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TableStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "locked" => Ok(Self::Locked),
            "optimistic" => Ok(Self::Optimistic),
            other => Err(format!(
                "unknown table strategy '{other}', expected 'locked' or 'optimistic'"
            )),
        }
    }
}

/// Per-resource view for snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ResourceState {
    pub id: ResourceId,
    pub leased: bool,
    pub generation: u64,
}

/// Map from resource identity to availability.
pub trait ResourceTable: Send + Sync {
    fn strategy(&self) -> TableStrategy;

    fn capacity(&self) -> usize;

    /// Atomically pick a free resource, mark it leased and bump its generation.
    ///
    /// `None` means every resource is leased.
    fn claim_free(&self) -> Option<Resource>;

    /// Mark a leased resource free.
    ///
    /// `Ok(false)` if it was already free; `UnknownResource` if no such id.
    fn mark_free(&self, id: ResourceId) -> Result<bool, PoolError>;

    /// `None` for an unknown id.
    fn is_free(&self, id: ResourceId) -> Option<bool>;

    fn free_count(&self) -> usize;

    fn generation(&self, id: ResourceId) -> Option<u64>;

    fn snapshot(&self) -> Vec<ResourceState>;
}

pub fn build(strategy: TableStrategy, capacity: usize) -> Box<dyn ResourceTable> {
    match strategy {
        TableStrategy::Locked => Box::new(LockedTable::new(capacity)),
        TableStrategy::Optimistic => Box::new(OptimisticTable::new(capacity)),
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Entry {
    leased: bool,
    generation: u64,
}

impl Entry {
    fn lease(&mut self) {
        self.leased = true;
        self.generation += 1;
    }
}

fn first_free(entries: &[Entry], hint: Option<usize>) -> Option<usize> {
    if let Some(index) = hint
        && entries.get(index).is_some_and(|e| !e.leased)
    {
        return Some(index);
    }
    entries.iter().position(|e| !e.leased)
}

fn states(entries: &[Entry]) -> Vec<ResourceState> {
    entries
        .iter()
        .enumerate()
        .map(|(index, e)| ResourceState {
            id: ResourceId::from_index(index),
            leased: e.leased,
            generation: e.generation,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::{Arc, Mutex};

    const STRATEGIES: [TableStrategy; 2] = [TableStrategy::Locked, TableStrategy::Optimistic];

    #[test]
    fn build_honours_strategy() {
        for strategy in STRATEGIES {
            let table = build(strategy, 3);
            assert_eq!(table.strategy(), strategy);
            assert_eq!(table.capacity(), 3);
            assert_eq!(table.free_count(), 3);
        }
    }

    #[test]
    fn claims_until_exhausted() {
        for strategy in STRATEGIES {
            let table = build(strategy, 2);
            let a = table.claim_free().unwrap();
            let b = table.claim_free().unwrap();
            assert_ne!(a.id, b.id);
            assert_eq!(a.generation, 1);
            assert!(table.claim_free().is_none(), "{strategy}: table should be exhausted");
            assert_eq!(table.free_count(), 0);
        }
    }

    #[test]
    fn mark_free_reports_transitions() {
        for strategy in STRATEGIES {
            let table = build(strategy, 1);
            let r = table.claim_free().unwrap();
            assert_eq!(table.is_free(r.id), Some(false));

            assert_eq!(table.mark_free(r.id), Ok(true));
            assert_eq!(table.mark_free(r.id), Ok(false));
            assert_eq!(table.is_free(r.id), Some(true));

            let bogus = ResourceId::new(9);
            assert_eq!(table.mark_free(bogus), Err(PoolError::UnknownResource(bogus)));
            assert_eq!(table.is_free(bogus), None);
            assert_eq!(table.generation(bogus), None);
        }
    }

    #[test]
    fn generation_counts_every_lease() {
        for strategy in STRATEGIES {
            let table = build(strategy, 1);
            for expected in 1..=4 {
                let r = table.claim_free().unwrap();
                assert_eq!(r.generation, expected);
                table.mark_free(r.id).unwrap();
            }
            assert_eq!(table.generation(ResourceId::new(0)), Some(4));
        }
    }

    #[test]
    fn snapshot_lists_every_resource() {
        for strategy in STRATEGIES {
            let table = build(strategy, 3);
            let r = table.claim_free().unwrap();
            let snapshot = table.snapshot();
            assert_eq!(snapshot.len(), 3);
            let leased: Vec<_> = snapshot.iter().filter(|s| s.leased).collect();
            assert_eq!(leased.len(), 1);
            assert_eq!(leased[0].id, r.id);
            assert_eq!(leased[0].generation, 1);
        }
    }

    #[test]
    fn concurrent_claims_never_share_a_resource() {
        for strategy in STRATEGIES {
            let table: Arc<dyn ResourceTable> = Arc::from(build(strategy, 4));
            let held = Arc::new(Mutex::new(HashSet::new()));

            std::thread::scope(|scope| {
                for _ in 0..8 {
                    let table = Arc::clone(&table);
                    let held = Arc::clone(&held);
                    scope.spawn(move || {
                        for _ in 0..500 {
                            let Some(r) = table.claim_free() else {
                                std::thread::yield_now();
                                continue;
                            };
                            assert!(held.lock().unwrap().insert(r.id), "double claim of {}", r.id);
                            let _ = table.free_count();
                            assert!(held.lock().unwrap().remove(&r.id));
                            assert_eq!(table.mark_free(r.id), Ok(true));
                        }
                    });
                }
            });

            assert_eq!(table.free_count(), 4, "{strategy}");
        }
    }

    #[test]
    fn strategy_parses_case_insensitively() {
        assert_eq!("Optimistic".parse::<TableStrategy>(), Ok(TableStrategy::Optimistic));
        assert_eq!("locked".parse::<TableStrategy>(), Ok(TableStrategy::Locked));
        assert!("stamped".parse::<TableStrategy>().is_err());
    }
}
