use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use super::LockStore;
use crate::error::StoreError;

#[derive(Debug)]
struct Entry {
    value: String,
    /// `None` when the lease reaches past what `Instant` can represent.
    expires_at: Option<Instant>,
}

impl Entry {
    fn expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// In-process [`LockStore`] with lease expiry.
///
/// Expired entries are dropped lazily on access. Useful for tests and for
/// coordinating threads of a single process.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryStore {
    pub fn new() -> MemoryStore {
        MemoryStore::default()
    }

    /// Current live value of `key`, if any.
    pub fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut entries = self.entries()?;
        Ok(live(&mut entries, key, Instant::now()).map(|e| e.value.clone()))
    }

    /// Number of live entries.
    pub fn len(&self) -> Result<usize, StoreError> {
        let now = Instant::now();
        let mut entries = self.entries()?;
        entries.retain(|_, e| !e.expired(now));
        Ok(entries.len())
    }

    pub fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.len()? == 0)
    }

    fn entries(&self) -> Result<MutexGuard<'_, HashMap<String, Entry>>, StoreError> {
        self.entries
            .lock()
            .map_err(|_| StoreError::Unavailable("memory store mutex poisoned".to_string()))
    }
}

/// Look up `key`, evicting it first if its lease ran out.
fn live<'a>(entries: &'a mut HashMap<String, Entry>, key: &str, now: Instant) -> Option<&'a Entry> {
    if entries.get(key).is_some_and(|e| e.expired(now)) {
        entries.remove(key);
    }
    entries.get(key)
}

impl LockStore for MemoryStore {
    fn set_if_absent_with_expiry(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let now = Instant::now();
        let mut entries = self.entries()?;
        if live(&mut entries, key, now).is_some() {
            return Ok(false);
        }
        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: now.checked_add(ttl),
            },
        );
        Ok(true)
    }

    fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool, StoreError> {
        let mut entries = self.entries()?;
        let owned = live(&mut entries, key, Instant::now()).is_some_and(|e| e.value == expected);
        if owned {
            entries.remove(key);
        }
        Ok(owned)
    }
}
