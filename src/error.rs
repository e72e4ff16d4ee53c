use std::time::Duration;

use redis::RedisError;
use thiserror::Error;

/// Errors raised while building a [`Lock`](crate::Lock) or its options.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LockError {
    #[error("resource key must not be empty")]
    EmptyResource,

    /// Leases shorter than one millisecond cannot be expressed to Redis.
    #[error("lease must be between 1ms and one year, got {0:?}")]
    InvalidLease(Duration),

    #[error("invalid retry delay bounds {initial:?}..={max:?}")]
    InvalidRetryDelay { initial: Duration, max: Duration },
}

/// Failure talking to the backing store.
///
/// "The operation did not apply" is never an error; stores report it as
/// `Ok(false)`.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("redis error: {0}")]
    Redis(#[from] RedisError),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    /// True when the store could not be reached at all, as opposed to
    /// answering with a protocol-level error.
    pub fn is_unavailable(&self) -> bool {
        match self {
            StoreError::Redis(e) => {
                e.is_io_error()
                    || e.is_connection_refusal()
                    || e.is_connection_dropped()
                    || e.is_timeout()
            }
            StoreError::Unavailable(_) => true,
        }
    }
}

/// Why an acquisition did not succeed.
#[derive(Debug, Error)]
pub enum AcquireError {
    /// Another token held the resource for the whole timeout.
    #[error("resource {resource} is busy")]
    Busy { resource: String },

    /// The last attempt before the deadline failed on the store.
    #[error("store unavailable while acquiring {resource}: {source}")]
    StoreUnavailable {
        resource: String,
        #[source]
        source: StoreError,
    },

    #[error("lock on {0} is already held by this handle")]
    AlreadyHeld(String),

    #[error("lock on {0} was already released")]
    Released(String),
}
