use std::time::Duration;

use thiserror::Error;

use crate::resource::ResourceId;

/// Why a semaphore acquire ended without a permit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AcquireError {
    #[error("acquire cancelled while waiting for a permit")]
    Cancelled,

    #[error("semaphore closed")]
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PoolError {
    #[error("invalid pool configuration: {0}")]
    InvalidConfig(String),

    #[error("no tokio runtime available to drive lease timers")]
    NoRuntime,

    /// The holder was cancelled while waiting for admission.
    #[error("acquire cancelled")]
    Cancelled,

    #[error("pool is shut down")]
    Shutdown,

    /// An internal invariant broke; the pool refuses all further acquires.
    #[error("pool halted: {0}")]
    Halted(String),

    #[error("lease duration {0:?} exceeds the maximum of {max:?}", max = crate::lease::MAX_LEASE)]
    LeaseTooLong(Duration),

    #[error("resource {0} has no active lease")]
    NotLeased(ResourceId),

    #[error("lease on resource {0} has no deadline")]
    NoDeadline(ResourceId),

    #[error("unknown resource {0}")]
    UnknownResource(ResourceId),

    #[error("bookkeeping violation: {0}")]
    Bookkeeping(String),
}

impl From<AcquireError> for PoolError {
    fn from(err: AcquireError) -> Self {
        match err {
            AcquireError::Cancelled => PoolError::Cancelled,
            AcquireError::Closed => PoolError::Shutdown,
        }
    }
}

pub type Result<T> = std::result::Result<T, PoolError>;
