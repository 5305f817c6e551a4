//! ResourcePool: fair admission, resource selection and lease bookkeeping behind one handle.
//!
//! Acquire: wait for a permit on the [`FairSemaphore`], claim a free resource
//! from the table, register the lease. Release runs the same steps backwards
//! and hands the permit to the next waiter in line.
//!
//! Semaphore, table and registry must always agree. If they don't, a resource
//! could be leased twice, so the pool halts (interrupting every holder and
//! refusing acquires) and the call that noticed panics.

use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::{ExpiryPolicy, PoolConfig};
use crate::error::{AcquireError, PoolError};
use crate::lease::{Expiry, LeaseInfo, LeaseRegistry, LeaseTimer, check_lease, signed_delta};
use crate::observer::PoolObserver;
use crate::resource::{Holder, HolderId, LeaseId, Resource, ResourceId};
use crate::semaphore::FairSemaphore;
use crate::table::{self, ResourceState, ResourceTable, TableStrategy};

const RUNNING: u8 = 0;
const SHUT_DOWN: u8 = 1;
const HALTED: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolState {
    Running,
    ShutDown,
    /// Stopped after an internal invariant broke.
    Halted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    Released,
    /// Nothing to do: the lease was already released or revoked.
    AlreadyReleased,
}

/// Point-in-time view of the pool for status displays.
#[derive(Debug, Clone, Serialize)]
pub struct PoolSnapshot {
    pub state: PoolState,
    pub capacity: usize,
    pub free: usize,
    pub leased: usize,
    pub waiting: usize,
    pub available_permits: isize,
    pub acquires: u64,
    pub releases: u64,
    pub expirations: u64,
    pub table: TableStrategy,
    pub resources: Vec<ResourceState>,
}

#[derive(Default)]
struct Stats {
    acquires: AtomicU64,
    releases: AtomicU64,
    expirations: AtomicU64,
}

struct Shared {
    config: PoolConfig,
    semaphore: FairSemaphore,
    table: Box<dyn ResourceTable>,
    leases: LeaseRegistry,
    observer: Arc<dyn PoolObserver>,
    /// Parent of every holder token, and through them every lease token.
    shutdown: CancellationToken,
    state: AtomicU8,
    halt_reason: Mutex<Option<String>>,
    next_holder: AtomicU64,
    stats: Stats,
}

impl Shared {
    fn state(&self) -> PoolState {
        match self.state.load(Ordering::Acquire) {
            RUNNING => PoolState::Running,
            SHUT_DOWN => PoolState::ShutDown,
            _ => PoolState::Halted,
        }
    }

    fn check_running(&self) -> Result<(), PoolError> {
        match self.state() {
            PoolState::Running => Ok(()),
            PoolState::ShutDown => Err(PoolError::Shutdown),
            PoolState::Halted => Err(PoolError::Halted(
                self.halt_reason
                    .lock()
                    .clone()
                    .unwrap_or_else(|| "unknown reason".to_string()),
            )),
        }
    }

    /// Resolve the lease length before anything is taken, so a bad one costs nothing.
    fn lease_duration(&self, requested: Option<Duration>) -> Result<Option<Duration>, PoolError> {
        requested
            .or(self.config.default_lease)
            .map(check_lease)
            .transpose()
            .inspect_err(|e| tracing::warn!(error = %e, "Lease duration rejected"))
    }

    /// A stopped pool explains a failed admission better than the raw semaphore error.
    fn admission_error(&self, err: AcquireError) -> PoolError {
        match self.check_running() {
            Err(stopped) => stopped,
            Ok(()) => err.into(),
        }
    }

    fn release_lease(&self, resource: ResourceId, lease: LeaseId) -> ReleaseOutcome {
        let Some(info) = self.leases.unregister(resource, lease) else {
            tracing::debug!(%resource, %lease, "Release of inactive lease ignored");
            return ReleaseOutcome::AlreadyReleased;
        };
        self.free_resource(&info);
        ReleaseOutcome::Released
    }

    /// Return a resource whose record was just removed from the registry.
    ///
    /// Observers hear about the release before the permit can reach anyone else.
    fn free_resource(&self, info: &LeaseInfo) {
        match self.table.mark_free(info.resource) {
            Ok(true) => {}
            Ok(false) => self.violation(format!(
                "lease {} on resource {} was active but the table had it free",
                info.lease, info.resource
            )),
            Err(e) => self.violation(e.to_string()),
        }
        self.stats.releases.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(resource = %info.resource, lease = %info.lease, holder = %info.holder, "Palantir returned");
        self.observer.on_released(info.resource);
        self.semaphore.release();
    }

    fn expire(&self, expiry: Expiry) {
        let policy = self.config.expiry_policy;
        let Some(expired) = self.leases.expire(expiry, policy) else {
            tracing::trace!(lease = %expiry.lease, "Deadline for inactive lease ignored");
            return;
        };

        self.stats.expirations.fetch_add(1, Ordering::Relaxed);
        tracing::warn!(
            holder = %expired.info.holder,
            resource = %expired.info.resource,
            lease = %expired.info.lease,
            policy = policy.as_str(),
            "Lease expired, interrupting holder"
        );
        expired.cancel.cancel();
        self.observer
            .on_lease_expired(expired.info.holder, expired.info.resource);

        if policy == ExpiryPolicy::Revoke {
            self.free_resource(&expired.info);
        }
    }

    /// Move out of `Running` into `target`. Only the first caller does the work.
    fn stop(&self, target: u8) -> bool {
        if self
            .state
            .compare_exchange(RUNNING, target, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        self.shutdown.cancel();
        self.semaphore.close();
        self.leases.shutdown();
        tracing::info!(
            state = ?self.state(),
            leased = self.leases.active_count(),
            "Pool stopped"
        );
        self.observer.on_pool_shutdown();
        true
    }

    fn halt(&self, reason: String) {
        tracing::error!(%reason, "Pool invariant violated, halting");
        *self.halt_reason.lock() = Some(reason);
        self.stop(HALTED);
    }

    fn violation(&self, reason: String) -> ! {
        self.halt(reason.clone());
        panic!("capacity violation: {reason}");
    }
}

/// Handle to a pool. Clones share the same pool; hand one to every worker.
#[derive(Clone)]
pub struct ResourcePool {
    shared: Arc<Shared>,
}

impl ResourcePool {
    /// Build a pool with `config.capacity` free resources.
    ///
    /// Must be called inside a tokio runtime, which drives the lease timer.
    pub fn new(config: PoolConfig, observer: Arc<dyn PoolObserver>) -> Result<Self, PoolError> {
        config.validate()?;
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| PoolError::NoRuntime)?;

        let shared = Arc::new_cyclic(|weak: &Weak<Shared>| {
            let weak = weak.clone();
            let timer = LeaseTimer::spawn(&runtime, move |expiry| {
                if let Some(shared) = weak.upgrade() {
                    shared.expire(expiry);
                }
            });

            Shared {
                semaphore: FairSemaphore::new(config.capacity as isize, config.fair),
                table: table::build(config.table, config.capacity),
                leases: LeaseRegistry::new(timer),
                observer,
                shutdown: CancellationToken::new(),
                state: AtomicU8::new(RUNNING),
                halt_reason: Mutex::new(None),
                next_holder: AtomicU64::new(1),
                stats: Stats::default(),
                config,
            }
        });

        tracing::info!(
            capacity = shared.config.capacity,
            fair = shared.config.fair,
            table = %shared.config.table,
            expiry = shared.config.expiry_policy.as_str(),
            default_lease = ?shared.config.default_lease,
            "Resource pool created"
        );
        Ok(Self { shared })
    }

    /// Allocate a new worker identity bound to this pool's shutdown.
    pub fn holder(&self) -> Holder {
        let id = HolderId::new(self.shared.next_holder.fetch_add(1, Ordering::Relaxed));
        Holder::new(id, self.shared.shutdown.child_token())
    }

    /// Wait for a resource, in arrival order.
    ///
    /// `lease` bounds how long the holder may keep it; `None` falls back to the
    /// configured default. Fails with `Cancelled` if the holder is cancelled
    /// while waiting, and with `Shutdown` if the pool stops.
    pub async fn acquire(&self, holder: &Holder, lease: Option<Duration>) -> Result<Lease, PoolError> {
        let shared = &self.shared;
        shared.check_running()?;
        if holder.is_cancelled() {
            return Err(PoolError::Cancelled);
        }
        let duration = shared.lease_duration(lease)?;

        if !shared.semaphore.try_acquire() {
            shared.observer.on_waiting(holder.id());
            tracing::debug!(
                holder = %holder.id(),
                queued = shared.semaphore.waiting(),
                "Holder waiting for admission"
            );
            let cancel = holder.cancel_token();
            shared
                .semaphore
                .acquire(&cancel)
                .await
                .map_err(|e| shared.admission_error(e))?;
        }

        self.grant(holder, duration)
    }

    /// Like [`acquire`](Self::acquire) but keeps waiting through holder cancellation.
    ///
    /// The holder's cancellation is not cleared: the returned lease starts out
    /// interrupted if the holder was cancelled while waiting.
    pub async fn acquire_uninterruptibly(
        &self,
        holder: &Holder,
        lease: Option<Duration>,
    ) -> Result<Lease, PoolError> {
        let shared = &self.shared;
        shared.check_running()?;
        let duration = shared.lease_duration(lease)?;

        if !shared.semaphore.try_acquire() {
            shared.observer.on_waiting(holder.id());
            shared
                .semaphore
                .acquire_uninterruptibly()
                .await
                .map_err(|e| shared.admission_error(e))?;
        }

        self.grant(holder, duration)
    }

    /// Take a resource only if one can be had without waiting.
    pub fn try_acquire(&self, holder: &Holder, lease: Option<Duration>) -> Result<Option<Lease>, PoolError> {
        self.shared.check_running()?;
        if holder.is_cancelled() {
            return Err(PoolError::Cancelled);
        }
        let duration = self.shared.lease_duration(lease)?;
        if !self.shared.semaphore.try_acquire() {
            return Ok(None);
        }
        self.grant(holder, duration).map(Some)
    }

    /// [`acquire`](Self::acquire) for thread-per-worker callers.
    ///
    /// Parks the calling OS thread. Do not call from inside an async task.
    pub fn blocking_acquire(&self, holder: &Holder, lease: Option<Duration>) -> Result<Lease, PoolError> {
        futures::executor::block_on(self.acquire(holder, lease))
    }

    fn grant(&self, holder: &Holder, duration: Option<Duration>) -> Result<Lease, PoolError> {
        let shared = &self.shared;
        if let Err(stopped) = shared.check_running() {
            shared.semaphore.release();
            return Err(stopped);
        }

        let Some(resource) = shared.table.claim_free() else {
            shared.violation(format!(
                "holder {} was admitted but no palantir is free ({} of {} leased)",
                holder.id(),
                shared.leases.active_count(),
                shared.config.capacity
            ));
        };

        let cancel = holder.cancel_token().child_token();
        let info = match shared
            .leases
            .register(resource.id, holder.id(), duration, cancel.clone())
        {
            Ok(info) => info,
            Err(e) => shared.violation(e.to_string()),
        };

        shared.stats.acquires.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(
            holder = %holder.id(),
            resource = %resource.id,
            lease = %info.lease,
            generation = resource.generation,
            ?duration,
            "Lease granted"
        );
        shared.observer.on_acquired(holder.id(), resource.id);
        shared.leases.arm(&info);

        Ok(Lease {
            shared: Arc::clone(shared),
            lease: info.lease,
            resource,
            holder: holder.id(),
            granted_at: info.granted_at,
            expires_at: info.expires_at,
            cancel,
            released: false,
        })
    }

    /// Same as [`Lease::release`].
    pub fn release(&self, lease: &mut Lease) -> ReleaseOutcome {
        lease.release()
    }

    /// Release whatever lease is active on `resource`.
    ///
    /// Releasing a free resource is a no-op; an id this pool never had is an error.
    pub fn release_resource(&self, resource: ResourceId) -> Result<ReleaseOutcome, PoolError> {
        let shared = &self.shared;
        if shared.table.is_free(resource).is_none() {
            tracing::warn!(%resource, "Release of unknown resource");
            return Err(PoolError::UnknownResource(resource));
        }
        match shared.leases.unregister_any(resource) {
            Some(info) => {
                shared.free_resource(&info);
                Ok(ReleaseOutcome::Released)
            }
            None => Ok(ReleaseOutcome::AlreadyReleased),
        }
    }

    /// Time left on the active lease of `resource`. Negative once overdue.
    pub fn remaining_time(&self, resource: ResourceId) -> Result<TimeDelta, PoolError> {
        if self.shared.table.is_free(resource).is_none() {
            return Err(PoolError::UnknownResource(resource));
        }
        self.shared.leases.remaining(resource)
    }

    pub fn lease_info(&self, resource: ResourceId) -> Option<LeaseInfo> {
        self.shared.leases.get(resource)
    }

    /// Interrupt every holder, fail every waiting acquire and stop the lease timer.
    ///
    /// Leases still held can be released afterwards. Repeated calls do nothing.
    pub fn shutdown(&self) {
        self.shared.stop(SHUT_DOWN);
    }

    pub fn state(&self) -> PoolState {
        self.shared.state()
    }

    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    pub fn capacity(&self) -> usize {
        self.shared.config.capacity
    }

    pub fn free_count(&self) -> usize {
        self.shared.table.free_count()
    }

    pub fn active_leases(&self) -> usize {
        self.shared.leases.active_count()
    }

    pub fn waiting(&self) -> usize {
        self.shared.semaphore.waiting()
    }

    pub fn available_permits(&self) -> isize {
        self.shared.semaphore.available_permits()
    }

    pub fn snapshot(&self) -> PoolSnapshot {
        let shared = &self.shared;
        PoolSnapshot {
            state: shared.state(),
            capacity: shared.config.capacity,
            free: shared.table.free_count(),
            leased: shared.leases.active_count(),
            waiting: shared.semaphore.waiting(),
            available_permits: shared.semaphore.available_permits(),
            acquires: shared.stats.acquires.load(Ordering::Relaxed),
            releases: shared.stats.releases.load(Ordering::Relaxed),
            expirations: shared.stats.expirations.load(Ordering::Relaxed),
            table: shared.table.strategy(),
            resources: shared.table.snapshot(),
        }
    }
}

/// Exclusive use of one resource. Released on drop if not released explicitly.
#[must_use = "dropping a Lease releases the palantir immediately"]
pub struct Lease {
    shared: Arc<Shared>,
    lease: LeaseId,
    resource: Resource,
    holder: HolderId,
    granted_at: DateTime<Utc>,
    expires_at: Option<Instant>,
    cancel: CancellationToken,
    released: bool,
}

impl Lease {
    pub fn id(&self) -> LeaseId {
        self.lease
    }

    pub fn resource_id(&self) -> ResourceId {
        self.resource.id
    }

    pub fn generation(&self) -> u64 {
        self.resource.generation
    }

    pub fn holder(&self) -> HolderId {
        self.holder
    }

    pub fn granted_at(&self) -> DateTime<Utc> {
        self.granted_at
    }

    pub fn expires_at(&self) -> Option<Instant> {
        self.expires_at
    }

    /// `None` for a lease without a deadline.
    pub fn remaining_time(&self) -> Option<TimeDelta> {
        self.expires_at
            .map(|deadline| signed_delta(deadline, Instant::now()))
    }

    /// Fires when the lease expires, the holder is cancelled, or the pool stops.
    ///
    /// Work done under the lease should watch this and stop promptly.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub async fn interrupted(&self) {
        self.cancel.cancelled().await
    }

    pub fn is_interrupted(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn is_released(&self) -> bool {
        self.released
    }

    /// Give the resource back. Calling this again is a no-op.
    pub fn release(&mut self) -> ReleaseOutcome {
        if self.released {
            return ReleaseOutcome::AlreadyReleased;
        }
        self.released = true;
        self.shared.release_lease(self.resource.id, self.lease)
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if !self.released {
            tracing::debug!(resource = %self.resource.id, lease = %self.lease, "Lease dropped, releasing");
            self.release();
        }
    }
}

impl std::fmt::Debug for Lease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lease")
            .field("lease", &self.lease)
            .field("resource", &self.resource)
            .field("holder", &self.holder)
            .field("expires_at", &self.expires_at)
            .field("released", &self.released)
            .finish_non_exhaustive()
    }
}
