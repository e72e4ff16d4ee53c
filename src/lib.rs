//! redis-mutex is a lease-based distributed mutex on top of a single
//! Redis instance.
//!
//! A [`Lock`] is bound to one resource key. Acquiring it writes a random
//! holder token with `SET NX PX`, so the entry disappears on its own once
//! the lease runs out, even if the holder crashed. Releasing it deletes the
//! key through a Lua script only if the token still matches, so a holder
//! whose lease expired can never remove somebody else's lock.
//!
//! Contention is not an error: `acquire` polls until its timeout and then
//! simply returns `false`.
//!
//! # Basic Operation
//! ```rust,no_run
//! # use std::time::Duration;
//! # use redis_mutex::{Lock, LockOptions, RedisStore};
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let store = RedisStore::open("redis://127.0.0.1:6379/")?;
//! let options = LockOptions::new(Duration::from_secs(90), Duration::from_secs(5))?;
//!
//! let mut lock = Lock::new(&store, "LOCK:ORDER:42", options)?;
//! if lock.acquire() {
//!     // Critical section
//!
//!     if !lock.release()?.is_released() {
//!         // The lease expired before we were done.
//!     }
//! } else {
//!     // Busy: fail fast.
//! }
//! # Ok(())
//! # }
//! ```

mod error;
mod lock;
mod options;
pub mod store;
mod token;

pub use crate::error::{AcquireError, LockError, StoreError};
pub use crate::lock::{Lock, LockState, ReleaseOutcome};
pub use crate::options::{LockOptions, MAX_LEASE, MAX_RETRY_DELAY_LIMIT};
pub use crate::store::{LockStore, MemoryStore, RedisStore};
