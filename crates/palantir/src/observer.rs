//! Lifecycle callbacks for whoever displays pool state.
//!
//! The pool calls these synchronously at each transition, sometimes from the
//! lease timer task. Implementations must return promptly; hand work off to
//! another thread or task if it may block. Releasing the expiring lease from
//! inside `on_lease_expired` deadlocks: the release waits for that report.

use crate::resource::{HolderId, ResourceId};

pub trait PoolObserver: Send + Sync {
    /// The holder found no permit and is about to block.
    fn on_waiting(&self, _holder: HolderId) {}

    fn on_acquired(&self, _holder: HolderId, _resource: ResourceId) {}

    fn on_released(&self, _resource: ResourceId) {}

    /// The lease deadline passed while the holder still had the resource.
    fn on_lease_expired(&self, _holder: HolderId, _resource: ResourceId) {}

    fn on_pool_shutdown(&self) {}
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopObserver;

impl PoolObserver for NoopObserver {}

/// Logs every transition through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingObserver;

impl PoolObserver for TracingObserver {
    fn on_waiting(&self, holder: HolderId) {
        tracing::debug!(%holder, "Waiting for a palantir");
    }

    fn on_acquired(&self, holder: HolderId, resource: ResourceId) {
        tracing::info!(%holder, %resource, "Palantir acquired");
    }

    fn on_released(&self, resource: ResourceId) {
        tracing::info!(%resource, "Palantir released");
    }

    fn on_lease_expired(&self, holder: HolderId, resource: ResourceId) {
        tracing::warn!(%holder, %resource, "Lease expired");
    }

    fn on_pool_shutdown(&self) {
        tracing::info!("Pool shut down");
    }
}
