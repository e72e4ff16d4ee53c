use std::thread::sleep;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tracing::{debug, error, warn};

use crate::error::{AcquireError, LockError, StoreError};
use crate::options::{Backoff, LockOptions};
use crate::store::LockStore;
use crate::token;

/// What a [`Lock`] believes about its entry in the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    Unacquired,
    Held,
    Released,
}

/// Result of [`Lock::release`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// Our token was still in the store and the entry was removed.
    Released,
    /// The entry was gone or owned by another token. The lease ran out
    /// while we held it, so the critical section may have overlapped with
    /// another holder.
    LostOwnership,
    /// The handle was not holding the lock; nothing was sent to the store.
    NotHeld,
}

impl ReleaseOutcome {
    pub fn is_released(&self) -> bool {
        matches!(self, ReleaseOutcome::Released)
    }
}

/// A single-use handle on a named resource.
///
/// The store is the source of truth; the handle only tracks what its own
/// calls observed. Dropping a held handle does not release it, the lease
/// does.
#[derive(Debug)]
pub struct Lock<S> {
    store: S,
    resource: String,
    token: String,
    options: LockOptions,
    state: LockState,
    acquired_at: Option<DateTime<Utc>>,
}

enum Step {
    Done(Result<(), AcquireError>),
    Wait(Duration),
}

impl<S: LockStore> Lock<S> {
    /// Create a handle for `resource` with a fresh holder token.
    pub fn new(
        store: S,
        resource: impl Into<String>,
        options: LockOptions,
    ) -> Result<Lock<S>, LockError> {
        let resource = resource.into();
        if resource.is_empty() {
            return Err(LockError::EmptyResource);
        }

        Ok(Lock {
            store,
            resource,
            token: token::generate(),
            options,
            state: LockState::Unacquired,
            acquired_at: None,
        })
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// The token this handle writes into the store on its next (or
    /// current) acquisition.
    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn options(&self) -> &LockOptions {
        &self.options
    }

    pub fn state(&self) -> LockState {
        self.state
    }

    /// When the successful acquisition happened.
    pub fn acquired_at(&self) -> Option<DateTime<Utc>> {
        self.acquired_at
    }

    /// Local estimate of when the store will expire the entry.
    pub fn lease_expires_at(&self) -> Option<DateTime<Utc>> {
        let lease = chrono::Duration::from_std(self.options.lease()).ok()?;
        self.acquired_at?.checked_add_signed(lease)
    }

    /// Try to acquire the lock, polling until the acquire timeout.
    ///
    /// Returns `false` if the resource stayed busy or the store stayed
    /// unreachable, and also when the handle is not unacquired (already
    /// held, or released). Use [`try_acquire`](Self::try_acquire) to tell
    /// those apart.
    pub fn acquire(&mut self) -> bool {
        let result = self.try_acquire();
        self.succeeded(result)
    }

    /// Like [`acquire`](Self::acquire), reporting why it failed.
    pub fn try_acquire(&mut self) -> Result<(), AcquireError> {
        self.check_acquirable()?;

        let start = Instant::now();
        let mut backoff = self.options.backoff();
        let mut attempts = 0;
        loop {
            attempts += 1;
            match self.step(attempts, start, &mut backoff) {
                Step::Done(result) => return result,
                Step::Wait(delay) => sleep(delay),
            }
        }
    }

    /// Async version of [`try_acquire`](Self::try_acquire). Waits between
    /// attempts without blocking the runtime, so dropping the future
    /// cancels the acquisition with the handle left unacquired.
    #[cfg(feature = "async")]
    pub async fn try_acquire_async(&mut self) -> Result<(), AcquireError> {
        self.check_acquirable()?;

        let start = Instant::now();
        let mut backoff = self.options.backoff();
        let mut attempts = 0;
        loop {
            attempts += 1;
            match self.step(attempts, start, &mut backoff) {
                Step::Done(result) => return result,
                Step::Wait(delay) => tokio::time::sleep(delay).await,
            }
        }
    }

    #[cfg(feature = "async")]
    pub async fn acquire_async(&mut self) -> bool {
        let result = self.try_acquire_async().await;
        self.succeeded(result)
    }

    /// Release the lock if this handle holds it.
    ///
    /// On a store error the handle stays [`LockState::Held`] so the call
    /// can be retried; the lease still bounds how long the entry lives.
    pub fn release(&mut self) -> Result<ReleaseOutcome, StoreError> {
        if self.state != LockState::Held {
            return Ok(ReleaseOutcome::NotHeld);
        }

        match self.store.compare_and_delete(&self.resource, &self.token) {
            Ok(true) => {
                self.state = LockState::Released;
                debug!(resource = %self.resource, "lock released");
                Ok(ReleaseOutcome::Released)
            }
            Ok(false) => {
                self.state = LockState::Released;
                error!(
                    resource = %self.resource,
                    lease_ms = self.options.lease().as_millis() as u64,
                    "lock was not held by this handle at release time, lease expired"
                );
                Ok(ReleaseOutcome::LostOwnership)
            }
            Err(e) => {
                error!(
                    resource = %self.resource,
                    error = %e,
                    "failed to release lock, entry stays until its lease expires"
                );
                Err(e)
            }
        }
    }

    /// Acquire, run `f`, release.
    ///
    /// Returns `Ok(None)` without running `f` if the lock could not be
    /// acquired in time.
    pub fn run_exclusive<T>(
        &mut self,
        f: impl FnOnce() -> T,
    ) -> Result<Option<(T, ReleaseOutcome)>, StoreError> {
        if !self.acquire() {
            return Ok(None);
        }
        let value = f();
        let outcome = self.release()?;
        Ok(Some((value, outcome)))
    }

    /// Boolean view of an acquisition; busy and unavailable were already
    /// logged by the attempt loop.
    fn succeeded(&self, result: Result<(), AcquireError>) -> bool {
        match result {
            Ok(()) => true,
            Err(e @ (AcquireError::AlreadyHeld(_) | AcquireError::Released(_))) => {
                debug!(resource = %self.resource, error = %e, "acquire on a used handle");
                false
            }
            Err(_) => false,
        }
    }

    fn check_acquirable(&self) -> Result<(), AcquireError> {
        match self.state {
            LockState::Unacquired => Ok(()),
            LockState::Held => Err(AcquireError::AlreadyHeld(self.resource.clone())),
            LockState::Released => Err(AcquireError::Released(self.resource.clone())),
        }
    }

    /// One attempt against the store, then either a final result or how
    /// long to wait before the next attempt.
    fn step(&mut self, attempts: u32, start: Instant, backoff: &mut Backoff) -> Step {
        let timeout = self.options.acquire_timeout();
        let lease = self.options.lease();
        // A zero timeout still gets one full attempt.
        let attempt = if timeout.is_zero() {
            self.store
                .set_if_absent_with_expiry(&self.resource, &self.token, lease)
        } else {
            let budget = timeout.saturating_sub(start.elapsed());
            self.store
                .set_if_absent_within(&self.resource, &self.token, lease, budget)
        };

        let last_error = match attempt {
            Ok(true) => {
                self.state = LockState::Held;
                self.acquired_at = Some(Utc::now());
                debug!(
                    resource = %self.resource,
                    attempts,
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "lock acquired"
                );
                return Step::Done(Ok(()));
            }
            Ok(false) => {
                debug!(resource = %self.resource, attempts, "lock busy");
                None
            }
            Err(e) => {
                warn!(
                    resource = %self.resource,
                    attempts,
                    error = %e,
                    "store error while acquiring lock"
                );
                Some(e)
            }
        };

        let elapsed = start.elapsed();
        if elapsed < timeout {
            return Step::Wait(backoff.next_delay(timeout - elapsed));
        }

        // The token may have reached the store in a reply we never saw, so
        // it is not offered again.
        self.token = token::generate();

        let elapsed_ms = elapsed.as_millis() as u64;
        Step::Done(Err(match last_error {
            Some(source) => {
                warn!(
                    resource = %self.resource,
                    attempts,
                    elapsed_ms,
                    "gave up acquiring lock, store unavailable"
                );
                AcquireError::StoreUnavailable {
                    resource: self.resource.clone(),
                    source,
                }
            }
            None => {
                debug!(
                    resource = %self.resource,
                    attempts,
                    elapsed_ms,
                    "gave up acquiring lock, resource busy"
                );
                AcquireError::Busy {
                    resource: self.resource.clone(),
                }
            }
        }))
    }
}
