//! Lease bookkeeping: who holds which palantir, since when, and until when.
//!
//! Release and expiry race on the same map entry. Both sides only act on a
//! record whose lease id they match, under the entry's shard lock, so for any
//! lease exactly one of them wins and the expiry fires at most once.
//!
//! An expiry that wins under `Notify` keeps the record but holds the lease's
//! notification lock until its callbacks are done. A release of that lease
//! waits on the same lock, so the expiry is always reported before the release.

mod timer;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::{ArcMutexGuard, Mutex, RawMutex};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::ExpiryPolicy;
use crate::error::PoolError;
use crate::resource::{HolderId, LeaseId, ResourceId};

pub use timer::{Expiry, LeaseTimer};

/// Longest lease a deadline can be scheduled for.
///
/// The timer wheel behind [`LeaseTimer`] holds deadlines up to about 2.2 years.
pub const MAX_LEASE: Duration = Duration::from_secs(2 * 365 * 24 * 60 * 60);

/// Reject durations the timer cannot hold.
pub fn check_lease(duration: Duration) -> Result<Duration, PoolError> {
    if duration > MAX_LEASE {
        return Err(PoolError::LeaseTooLong(duration));
    }
    Ok(duration)
}

/// Snapshot of one active lease.
#[derive(Debug, Clone)]
pub struct LeaseInfo {
    pub lease: LeaseId,
    pub resource: ResourceId,
    pub holder: HolderId,
    pub acquired_at: Instant,
    /// Wall-clock time of the grant, for display.
    pub granted_at: DateTime<Utc>,
    pub duration: Option<Duration>,
    pub expires_at: Option<Instant>,
    /// Set once the deadline passed under `ExpiryPolicy::Notify`.
    pub expired: bool,
}

/// An expiry that took effect.
///
/// A release of the same lease blocks until this is dropped.
pub struct ExpiredLease {
    pub info: LeaseInfo,
    /// The holder's interrupt for this lease.
    pub cancel: CancellationToken,
    _notifying: ArcMutexGuard<RawMutex, ()>,
}

struct LeaseRecord {
    info: LeaseInfo,
    cancel: CancellationToken,
    notify: Arc<Mutex<()>>,
}

impl LeaseRecord {
    /// Wait out an expiry that is still being reported.
    fn settle(self) -> LeaseInfo {
        drop(self.notify.lock());
        self.info
    }
}

pub struct LeaseRegistry {
    records: DashMap<ResourceId, LeaseRecord>,
    timer: LeaseTimer,
    next_lease: AtomicU64,
}

impl LeaseRegistry {
    pub fn new(timer: LeaseTimer) -> Self {
        Self {
            records: DashMap::new(),
            timer,
            next_lease: AtomicU64::new(1),
        }
    }

    /// Record a new lease. Its deadline is not scheduled until [`arm`](Self::arm).
    ///
    /// A resource that already has a record means the table and the registry
    /// disagree; that is reported as a bookkeeping violation.
    pub fn register(
        &self,
        resource: ResourceId,
        holder: HolderId,
        duration: Option<Duration>,
        cancel: CancellationToken,
    ) -> Result<LeaseInfo, PoolError> {
        let acquired_at = Instant::now();
        let expires_at = match duration {
            Some(d) => {
                let d = check_lease(d)?;
                Some(
                    acquired_at
                        .checked_add(d)
                        .ok_or(PoolError::LeaseTooLong(d))?,
                )
            }
            None => None,
        };

        let lease = LeaseId::new(self.next_lease.fetch_add(1, Ordering::Relaxed));
        let info = LeaseInfo {
            lease,
            resource,
            holder,
            acquired_at,
            granted_at: Utc::now(),
            duration,
            expires_at,
            expired: false,
        };

        match self.records.entry(resource) {
            Entry::Occupied(existing) => {
                return Err(PoolError::Bookkeeping(format!(
                    "resource {resource} is already leased to holder {}",
                    existing.get().info.holder
                )));
            }
            Entry::Vacant(slot) => {
                slot.insert(LeaseRecord {
                    info: info.clone(),
                    cancel,
                    notify: Arc::new(Mutex::new(())),
                });
            }
        }
        Ok(info)
    }

    /// Schedule the expiry of a registered lease, if it has a deadline.
    pub fn arm(&self, info: &LeaseInfo) {
        if let Some(deadline) = info.expires_at {
            self.timer.schedule(
                Expiry {
                    lease: info.lease,
                    resource: info.resource,
                },
                deadline,
            );
        }
    }

    /// Remove the record for `lease`, cancelling its timer.
    ///
    /// Returns `None` if that lease is no longer registered (already released,
    /// revoked, or superseded by a newer lease on the same resource).
    pub fn unregister(&self, resource: ResourceId, lease: LeaseId) -> Option<LeaseInfo> {
        let (_, record) = self
            .records
            .remove_if(&resource, |_, r| r.info.lease == lease)?;
        self.timer.cancel(lease);
        Some(record.settle())
    }

    /// Remove whatever lease is registered for `resource`.
    pub fn unregister_any(&self, resource: ResourceId) -> Option<LeaseInfo> {
        let (_, record) = self.records.remove(&resource)?;
        self.timer.cancel(record.info.lease);
        Some(record.settle())
    }

    /// Apply a fired deadline.
    ///
    /// `Notify` marks the record expired and keeps it; `Revoke` removes it.
    /// Returns `None` if the lease was released first, or already expired.
    pub fn expire(&self, expiry: Expiry, policy: ExpiryPolicy) -> Option<ExpiredLease> {
        match policy {
            ExpiryPolicy::Notify => {
                let mut record = self.records.get_mut(&expiry.resource)?;
                if record.info.lease != expiry.lease || record.info.expired {
                    return None;
                }
                record.info.expired = true;
                Some(ExpiredLease {
                    info: record.info.clone(),
                    cancel: record.cancel.clone(),
                    _notifying: record.notify.lock_arc(),
                })
            }
            ExpiryPolicy::Revoke => {
                let (_, mut record) = self
                    .records
                    .remove_if(&expiry.resource, |_, r| r.info.lease == expiry.lease)?;
                record.info.expired = true;
                Some(ExpiredLease {
                    _notifying: record.notify.lock_arc(),
                    info: record.info,
                    cancel: record.cancel,
                })
            }
        }
    }

    /// Time left on the lease for `resource`; negative once the deadline passed.
    pub fn remaining(&self, resource: ResourceId) -> Result<TimeDelta, PoolError> {
        let record = self
            .records
            .get(&resource)
            .ok_or(PoolError::NotLeased(resource))?;
        let deadline = record
            .info
            .expires_at
            .ok_or(PoolError::NoDeadline(resource))?;
        Ok(signed_delta(deadline, Instant::now()))
    }

    pub fn get(&self, resource: ResourceId) -> Option<LeaseInfo> {
        self.records.get(&resource).map(|r| r.info.clone())
    }

    pub fn active_count(&self) -> usize {
        self.records.len()
    }

    /// Stop the timer and interrupt every holder. Records stay so late releases still work.
    pub fn shutdown(&self) {
        self.timer.shutdown();
        for record in self.records.iter() {
            record.cancel.cancel();
        }
    }
}

pub(crate) fn signed_delta(deadline: Instant, now: Instant) -> TimeDelta {
    let to_delta = |d: Duration| TimeDelta::from_std(d).unwrap_or(TimeDelta::MAX);
    if deadline >= now {
        to_delta(deadline - now)
    } else {
        -to_delta(now - deadline)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn registry() -> (LeaseRegistry, mpsc::UnboundedReceiver<Expiry>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let timer = LeaseTimer::spawn(&tokio::runtime::Handle::current(), move |expiry| {
            let _ = tx.send(expiry);
        });
        (LeaseRegistry::new(timer), rx)
    }

    fn r(n: u32) -> ResourceId {
        ResourceId::new(n)
    }

    fn h(n: u64) -> HolderId {
        HolderId::new(n)
    }

    #[tokio::test]
    async fn register_and_unregister() {
        let (leases, _fired) = registry();
        let info = leases
            .register(r(0), h(1), None, CancellationToken::new())
            .unwrap();
        assert_eq!(info.holder, h(1));
        assert!(info.expires_at.is_none());
        assert_eq!(leases.active_count(), 1);
        assert_eq!(leases.get(r(0)).unwrap().lease, info.lease);

        let removed = leases.unregister(r(0), info.lease).unwrap();
        assert_eq!(removed.lease, info.lease);
        assert_eq!(leases.active_count(), 0);
        assert!(leases.unregister(r(0), info.lease).is_none());
    }

    #[tokio::test]
    async fn second_record_for_a_resource_is_rejected() {
        let (leases, _fired) = registry();
        leases
            .register(r(0), h(1), None, CancellationToken::new())
            .unwrap();

        let err = leases
            .register(r(0), h(2), None, CancellationToken::new())
            .unwrap_err();
        assert!(matches!(err, PoolError::Bookkeeping(_)));
        assert_eq!(leases.get(r(0)).unwrap().holder, h(1));
    }

    #[tokio::test]
    async fn stale_lease_id_cannot_remove_newer_lease() {
        let (leases, _fired) = registry();
        let old = leases
            .register(r(0), h(1), None, CancellationToken::new())
            .unwrap();
        leases.unregister(r(0), old.lease).unwrap();
        let new = leases
            .register(r(0), h(2), None, CancellationToken::new())
            .unwrap();

        assert!(leases.unregister(r(0), old.lease).is_none());
        assert_eq!(leases.get(r(0)).unwrap().lease, new.lease);
        assert_eq!(leases.unregister_any(r(0)).unwrap().lease, new.lease);
    }

    #[tokio::test(start_paused = true)]
    async fn notify_expiry_fires_once_and_keeps_record() {
        let (leases, mut fired) = registry();
        let info = leases
            .register(r(0), h(1), Some(Duration::from_millis(50)), CancellationToken::new())
            .unwrap();
        leases.arm(&info);

        let expiry = fired.recv().await.unwrap();
        assert_eq!(expiry, Expiry { lease: info.lease, resource: r(0) });

        let expired = leases.expire(expiry, ExpiryPolicy::Notify).unwrap();
        assert!(expired.info.expired);
        assert!(leases.expire(expiry, ExpiryPolicy::Notify).is_none());
        assert!(leases.get(r(0)).unwrap().expired);
        assert!(leases.remaining(r(0)).unwrap() <= TimeDelta::zero());
    }

    #[tokio::test(start_paused = true)]
    async fn revoke_expiry_removes_record() {
        let (leases, mut fired) = registry();
        let info = leases
            .register(r(0), h(1), Some(Duration::from_millis(50)), CancellationToken::new())
            .unwrap();
        leases.arm(&info);

        let expiry = fired.recv().await.unwrap();
        assert!(leases.expire(expiry, ExpiryPolicy::Revoke).is_some());
        assert!(leases.get(r(0)).is_none());
        assert!(leases.unregister(r(0), info.lease).is_none());
        assert!(leases.expire(expiry, ExpiryPolicy::Revoke).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn release_before_deadline_cancels_timer() {
        let (leases, mut fired) = registry();
        let info = leases
            .register(r(0), h(1), Some(Duration::from_millis(50)), CancellationToken::new())
            .unwrap();
        leases.arm(&info);
        leases.unregister(r(0), info.lease).unwrap();

        let result = tokio::time::timeout(Duration::from_millis(200), fired.recv()).await;
        assert!(result.is_err(), "released lease must not fire");

        // A deadline delivered late anyway is ignored.
        let late = Expiry { lease: info.lease, resource: r(0) };
        assert!(leases.expire(late, ExpiryPolicy::Notify).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn unarmed_lease_never_fires() {
        let (leases, mut fired) = registry();
        leases
            .register(r(0), h(1), Some(Duration::from_millis(50)), CancellationToken::new())
            .unwrap();

        let result = tokio::time::timeout(Duration::from_millis(200), fired.recv()).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn oversized_duration_is_rejected_without_a_record() {
        let (leases, _fired) = registry();
        for duration in [Duration::MAX, MAX_LEASE + Duration::from_secs(1)] {
            let err = leases
                .register(r(0), h(1), Some(duration), CancellationToken::new())
                .unwrap_err();
            assert_eq!(err, PoolError::LeaseTooLong(duration));
        }
        assert_eq!(leases.active_count(), 0);

        let info = leases
            .register(r(0), h(1), Some(MAX_LEASE), CancellationToken::new())
            .unwrap();
        assert!(info.expires_at.is_some());
    }

    #[tokio::test]
    async fn release_waits_for_expiry_report() {
        let (leases, _fired) = registry();
        let leases = Arc::new(leases);
        let info = leases
            .register(r(0), h(1), Some(Duration::from_millis(5)), CancellationToken::new())
            .unwrap();
        let expiry = Expiry { lease: info.lease, resource: r(0) };

        let reporting = leases.expire(expiry, ExpiryPolicy::Notify).unwrap();

        let (tx, rx) = std::sync::mpsc::channel();
        let releaser = {
            let leases = Arc::clone(&leases);
            std::thread::spawn(move || {
                let released = leases.unregister(r(0), info.lease);
                tx.send(released.map(|i| i.expired)).unwrap();
            })
        };

        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
        drop(reporting);
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), Some(true));
        releaser.join().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn remaining_counts_down_and_goes_negative() {
        let (leases, _fired) = registry();
        leases
            .register(r(0), h(1), Some(Duration::from_millis(100)), CancellationToken::new())
            .unwrap();
        assert_eq!(leases.remaining(r(0)).unwrap(), TimeDelta::milliseconds(100));

        tokio::time::advance(Duration::from_millis(130)).await;
        assert_eq!(leases.remaining(r(0)).unwrap(), TimeDelta::milliseconds(-30));
    }

    #[tokio::test]
    async fn remaining_requires_a_deadline() {
        let (leases, _fired) = registry();
        assert_eq!(leases.remaining(r(0)), Err(PoolError::NotLeased(r(0))));

        leases
            .register(r(0), h(1), None, CancellationToken::new())
            .unwrap();
        assert_eq!(leases.remaining(r(0)), Err(PoolError::NoDeadline(r(0))));
    }

    #[tokio::test]
    async fn shutdown_interrupts_holders() {
        let (leases, _fired) = registry();
        let token = CancellationToken::new();
        leases.register(r(0), h(1), None, token.clone()).unwrap();

        leases.shutdown();

        assert!(token.is_cancelled());
        assert_eq!(leases.active_count(), 1);
    }

    #[test]
    fn signed_delta_handles_both_directions() {
        let now = Instant::now();
        let later = now + Duration::from_millis(5);
        assert_eq!(signed_delta(later, now), TimeDelta::milliseconds(5));
        assert_eq!(signed_delta(now, later), TimeDelta::milliseconds(-5));
    }
}
