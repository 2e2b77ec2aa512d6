//! In-memory credential cache with per-entry expiry.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tracing::debug;

use super::Backend;
use crate::error::{HelperError, Result};
use crate::record::{CredentialKey, CredentialRecord};

const NAME: &str = "cache";

struct CacheEntry {
  record: CredentialRecord,
  /// `None` when `now + timeout` does not fit in an `Instant`
  expires_at: Option<Instant>,
}

impl CacheEntry {
  fn is_expired_at(&self, now: Instant) -> bool {
    self.expires_at.is_some_and(|deadline| now >= deadline)
  }
}

/// Credentials held in memory until their timeout elapses.
///
/// `store` (re)starts the entry's timer. A `get` past the deadline evicts the
/// entry and reports nothing.
pub struct TimedCacheBackend {
  timeout: Duration,
  entries: Mutex<HashMap<CredentialKey, CacheEntry>>,
}

impl TimedCacheBackend {
  /// Long-lived default suited to personal access tokens
  pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10_000_000);

  pub fn new(timeout: Duration) -> Self {
    Self {
      timeout,
      entries: Mutex::new(HashMap::new()),
    }
  }

  pub fn timeout(&self) -> Duration {
    self.timeout
  }

  fn entries(&self) -> Result<MutexGuard<'_, HashMap<CredentialKey, CacheEntry>>> {
    self
      .entries
      .lock()
      .map_err(|e| HelperError::unavailable(NAME, format!("cache lock poisoned: {e}")))
  }

  pub fn get_at(&self, key: &CredentialKey, now: Instant) -> Result<Option<CredentialRecord>> {
    let mut entries = self.entries()?;
    match entries.get(key) {
      None => return Ok(None),
      Some(entry) if !entry.is_expired_at(now) => return Ok(Some(entry.record.clone())),
      Some(_) => {}
    }

    debug!(key = %key, "Evicting expired cache entry");
    entries.remove(key);
    Ok(None)
  }

  pub fn store_at(&self, record: &CredentialRecord, now: Instant) -> Result<()> {
    self.store_for(record, self.timeout, now)
  }

  /// Store with an entry-specific timeout instead of the cache default
  pub fn store_for(&self, record: &CredentialRecord, timeout: Duration, now: Instant) -> Result<()> {
    record.require_secret()?;
    let entry = CacheEntry {
      record: record.clone(),
      expires_at: now.checked_add(timeout),
    };
    self.entries()?.insert(record.key(), entry);
    Ok(())
  }

  /// Drop the entry for `key`, reporting whether one existed
  pub fn remove(&self, key: &CredentialKey) -> Result<bool> {
    Ok(self.entries()?.remove(key).is_some())
  }

  /// Evict every entry whose deadline has passed, returning how many went
  pub fn sweep_at(&self, now: Instant) -> Result<usize> {
    let mut entries = self.entries()?;
    let before = entries.len();
    entries.retain(|_, entry| !entry.is_expired_at(now));
    Ok(before - entries.len())
  }

  /// Earliest deadline among the cached entries
  pub fn next_expiry(&self) -> Result<Option<Instant>> {
    Ok(self.entries()?.values().filter_map(|entry| entry.expires_at).min())
  }

  pub fn len(&self) -> Result<usize> {
    Ok(self.entries()?.len())
  }

  pub fn is_empty(&self) -> Result<bool> {
    Ok(self.len()? == 0)
  }
}

impl Default for TimedCacheBackend {
  fn default() -> Self {
    Self::new(Self::DEFAULT_TIMEOUT)
  }
}

impl Backend for TimedCacheBackend {
  fn name(&self) -> &'static str {
    NAME
  }

  fn get(&self, key: &CredentialKey) -> Result<Option<CredentialRecord>> {
    self.get_at(key, Instant::now())
  }

  fn store(&self, record: &CredentialRecord) -> Result<()> {
    self.store_at(record, Instant::now())
  }

  fn erase(&self, key: &CredentialKey) -> Result<()> {
    self.remove(key).map(|_| ())
  }
}
