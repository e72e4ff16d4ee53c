use std::time::Duration;

use rand::{thread_rng, Rng};

use crate::error::LockError;

const MIN_RETRY_DELAY: Duration = Duration::from_millis(1);
const MAX_RETRY_DELAY: Duration = Duration::from_millis(200);
/// The default initial delay is this fraction of the acquire timeout.
const RETRY_DELAY_DIVISOR: u32 = 100;
const MAX_BACKOFF_FACTOR: u32 = 4;
/// Longest accepted lease: one year.
pub const MAX_LEASE: Duration = Duration::from_secs(365 * 24 * 60 * 60);
/// Longest accepted delay between acquire attempts.
pub const MAX_RETRY_DELAY_LIMIT: Duration = Duration::from_secs(60);

/// Lease and acquisition settings for a [`Lock`](crate::Lock).
///
/// Lease and timeout have no defaults; both must be given explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockOptions {
    lease: Duration,
    acquire_timeout: Duration,
    retry_delay: Duration,
    max_retry_delay: Duration,
}

impl LockOptions {
    /// Build options from a lease and an acquire timeout.
    ///
    /// The lease must be between 1ms and [`MAX_LEASE`]. A zero
    /// `acquire_timeout` means a single attempt. The retry delay
    /// defaults to 1/100th of the timeout, clamped to 1ms..=200ms, and
    /// backs off up to four times that (still capped at 200ms).
    pub fn new(lease: Duration, acquire_timeout: Duration) -> Result<LockOptions, LockError> {
        if lease < Duration::from_millis(1) || lease > MAX_LEASE {
            return Err(LockError::InvalidLease(lease));
        }

        let retry_delay =
            (acquire_timeout / RETRY_DELAY_DIVISOR).clamp(MIN_RETRY_DELAY, MAX_RETRY_DELAY);
        let max_retry_delay = (retry_delay * MAX_BACKOFF_FACTOR).min(MAX_RETRY_DELAY);

        Ok(LockOptions {
            lease,
            acquire_timeout,
            retry_delay,
            max_retry_delay,
        })
    }

    /// Lease in whole seconds and timeout in milliseconds.
    pub fn from_secs_millis(
        lease_seconds: u64,
        timeout_millis: u64,
    ) -> Result<LockOptions, LockError> {
        Self::new(
            Duration::from_secs(lease_seconds),
            Duration::from_millis(timeout_millis),
        )
    }

    /// Override the backoff bounds. `max` may not exceed
    /// [`MAX_RETRY_DELAY_LIMIT`].
    pub fn with_retry_delay(
        mut self,
        initial: Duration,
        max: Duration,
    ) -> Result<LockOptions, LockError> {
        if initial.is_zero() || initial > max || max > MAX_RETRY_DELAY_LIMIT {
            return Err(LockError::InvalidRetryDelay { initial, max });
        }
        self.retry_delay = initial;
        self.max_retry_delay = max;
        Ok(self)
    }

    pub fn lease(&self) -> Duration {
        self.lease
    }

    pub fn acquire_timeout(&self) -> Duration {
        self.acquire_timeout
    }

    pub fn retry_delay(&self) -> Duration {
        self.retry_delay
    }

    pub fn max_retry_delay(&self) -> Duration {
        self.max_retry_delay
    }

    pub(crate) fn backoff(&self) -> Backoff {
        Backoff {
            current: self.retry_delay,
            max: self.max_retry_delay,
        }
    }
}

/// Capped exponential backoff with jitter.
#[derive(Debug)]
pub(crate) struct Backoff {
    current: Duration,
    max: Duration,
}

impl Backoff {
    /// Next delay to sleep: the current step plus up to 50% jitter, never
    /// more than `remaining`.
    pub(crate) fn next_delay(&mut self, remaining: Duration) -> Duration {
        let base = self.current;
        self.current = base.checked_mul(2).unwrap_or(self.max).min(self.max);

        let jitter_ms = u64::try_from(base.as_millis()).unwrap_or(u64::MAX) / 2;
        let jitter = if jitter_ms > 0 {
            Duration::from_millis(thread_rng().gen_range(0..=jitter_ms))
        } else {
            Duration::ZERO
        };

        base.saturating_add(jitter).min(remaining)
    }
}
