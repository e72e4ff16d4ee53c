//! The two atomic primitives a lock needs from a shared store.

use std::sync::Arc;
use std::time::Duration;

use crate::error::StoreError;

mod memory;
mod redis_store;

pub use memory::MemoryStore;
pub use redis_store::RedisStore;

/// A shared key-value store able to host lock entries.
///
/// Both operations must be atomic at the store. An operation that ran but
/// did not apply returns `Ok(false)`; `Err` is reserved for failures to
/// talk to the store.
pub trait LockStore {
    /// Create `key = value` expiring after `ttl`, only if `key` is absent.
    fn set_if_absent_with_expiry(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError>;

    /// Like [`set_if_absent_with_expiry`](Self::set_if_absent_with_expiry),
    /// waiting on the store no longer than `budget`.
    ///
    /// Stores that cannot bound a single call ignore `budget`.
    fn set_if_absent_within(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
        _budget: Duration,
    ) -> Result<bool, StoreError> {
        self.set_if_absent_with_expiry(key, value, ttl)
    }

    /// Delete `key` only if its current value equals `expected`.
    fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool, StoreError>;
}

impl<S: LockStore + ?Sized> LockStore for &S {
    fn set_if_absent_with_expiry(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        (**self).set_if_absent_with_expiry(key, value, ttl)
    }

    fn set_if_absent_within(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
        budget: Duration,
    ) -> Result<bool, StoreError> {
        (**self).set_if_absent_within(key, value, ttl, budget)
    }

    fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool, StoreError> {
        (**self).compare_and_delete(key, expected)
    }
}

impl<S: LockStore + ?Sized> LockStore for Arc<S> {
    fn set_if_absent_with_expiry(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        (**self).set_if_absent_with_expiry(key, value, ttl)
    }

    fn set_if_absent_within(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
        budget: Duration,
    ) -> Result<bool, StoreError> {
        (**self).set_if_absent_within(key, value, ttl, budget)
    }

    fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool, StoreError> {
        (**self).compare_and_delete(key, expected)
    }
}

/// Whole milliseconds for a Redis `PX` argument, rounding sub-millisecond
/// remainders up so a lease is never shortened.
pub(crate) fn ttl_millis(ttl: Duration) -> u64 {
    let millis = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX);
    if ttl.subsec_nanos() % 1_000_000 != 0 {
        millis.saturating_add(1)
    } else {
        millis
    }
}
