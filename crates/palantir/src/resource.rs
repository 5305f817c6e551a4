//! Identities handed out by the pool: palantiri, the beings holding them, and leases.

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

/// Identity of one pooled resource. Ids are dense: `0..capacity`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceId(u32);

impl ResourceId {
    pub fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// Index into a table sized by `capacity`. Capacity is validated to fit `u32`.
    pub(crate) fn from_index(index: usize) -> Self {
        Self(index as u32)
    }

    pub fn as_u32(&self) -> u32 {
        self.0
    }

    pub(crate) fn index(&self) -> usize {
        self.0 as usize
    }
}

impl std::fmt::Display for ResourceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of a worker, allocated by the pool it works against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HolderId(u64);

impl HolderId {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for HolderId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of a single acquire/release cycle.
///
/// A resource is leased many times over its life; the lease id is what keeps a
/// stale release or a late timer from touching a newer lease on the same resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LeaseId(u64);

impl LeaseId {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for LeaseId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A resource as seen at the moment it was claimed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Resource {
    pub id: ResourceId,
    /// Number of times this resource has been leased, including the current lease.
    pub generation: u64,
}

/// A worker's execution context.
///
/// The cancellation token is a child of the pool's shutdown token, so pool
/// shutdown interrupts every holder. Cancelling a holder aborts its pending
/// acquire and interrupts any lease it currently holds.
#[derive(Debug, Clone)]
pub struct Holder {
    id: HolderId,
    cancel: CancellationToken,
}

impl Holder {
    pub(crate) fn new(id: HolderId, cancel: CancellationToken) -> Self {
        Self { id, cancel }
    }

    pub fn id(&self) -> HolderId {
        self.id
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}
