//! palantir: a bounded, FIFO-fair, lease-aware resource pool.
//!
//! A fixed set of palantiri is shared among many beings. Each acquire waits
//! its turn on a fair semaphore, claims a free palantir from a resource table
//! and receives a [`Lease`]. Leases may carry a deadline; when it passes the
//! holder is interrupted through the lease's cancellation token.

pub mod config;
pub mod error;
pub mod lease;
pub mod observer;
pub mod pool;
pub mod resource;
pub mod semaphore;
pub mod table;

pub use config::{ExpiryPolicy, PoolConfig};
pub use error::{AcquireError, PoolError};
pub use lease::{LeaseInfo, LeaseRegistry, MAX_LEASE};
pub use observer::{NoopObserver, PoolObserver, TracingObserver};
pub use pool::{Lease, PoolSnapshot, PoolState, ReleaseOutcome, ResourcePool};
pub use resource::{Holder, HolderId, LeaseId, Resource, ResourceId};
pub use semaphore::FairSemaphore;
pub use table::{ResourceState, ResourceTable, TableStrategy};
pub use tokio_util::sync::CancellationToken;
