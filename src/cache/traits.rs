//! Core traits and types for the caching system.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use color_eyre::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// A single stored value together with its bookkeeping timestamps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheRecord {
  pub key: String,
  pub value: Value,
  pub stored_at: DateTime<Utc>,
  /// `None` means the record never expires on its own.
  pub expires_at: Option<DateTime<Utc>>,
}

impl CacheRecord {
  pub fn new(key: &str, value: Value, now: DateTime<Utc>, ttl: Option<Duration>) -> Self {
    Self {
      key: key.to_string(),
      value,
      stored_at: now,
      expires_at: expiry_for(now, ttl),
    }
  }

  /// Expiry is inclusive: a record is gone at exactly `expires_at`.
  pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
    self.expires_at.is_some_and(|at| at <= now)
  }

  /// Time left before expiry, or `None` for records without a TTL.
  pub fn remaining_ttl(&self, now: DateTime<Utc>) -> Option<Duration> {
    self
      .expires_at
      .map(|at| (at - now).to_std().unwrap_or(Duration::ZERO))
  }
}

/// Absolute expiry instant for a TTL. Zero or absent TTL means no expiry.
pub fn expiry_for(now: DateTime<Utc>, ttl: Option<Duration>) -> Option<DateTime<Utc>> {
  let ttl = ttl.filter(|d| !d.is_zero())?;
  let ttl = chrono::Duration::from_std(ttl).ok()?;
  now.checked_add_signed(ttl)
}

/// Best-effort statistics about a store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
  /// Number of live entries, if the backend can count them.
  pub entries: Option<u64>,
}

/// Trait for cache storage backends.
///
/// Backends are interchangeable: callers above this trait never need to know
/// which one is in use. TTLs are enforced here, not by the caller.
#[async_trait]
pub trait CacheStore: Send + Sync {
  /// Look up a live record. Expired records are reported as absent.
  async fn get_record(&self, key: &str) -> Result<Option<CacheRecord>>;

  /// Look up a live value.
  async fn get(&self, key: &str) -> Result<Option<Value>> {
    Ok(self.get_record(key).await?.map(|record| record.value))
  }

  /// Store a value, fully replacing any previous record for `key`.
  async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<()>;

  /// Drop a single key.
  async fn remove(&self, key: &str) -> Result<()>;

  /// Drop every key.
  async fn clear(&self) -> Result<()>;

  async fn stats(&self) -> Result<StoreStats>;

  /// Short backend name for logs and diagnostics.
  fn backend_name(&self) -> &'static str;
}

#[async_trait]
impl<T: CacheStore + ?Sized> CacheStore for Arc<T> {
  async fn get_record(&self, key: &str) -> Result<Option<CacheRecord>> {
    (**self).get_record(key).await
  }

  async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<()> {
    (**self).set(key, value, ttl).await
  }

  async fn remove(&self, key: &str) -> Result<()> {
    (**self).remove(key).await
  }

  async fn clear(&self) -> Result<()> {
    (**self).clear().await
  }

  async fn stats(&self) -> Result<StoreStats> {
    (**self).stats().await
  }

  fn backend_name(&self) -> &'static str {
    (**self).backend_name()
  }
}

/// Source of "now" for expiry and freshness decisions.
pub trait Clock: Send + Sync {
  fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
  fn now(&self) -> DateTime<Utc> {
    Utc::now()
  }
}

/// A clock that only moves when told to. Useful for exercising TTLs.
#[derive(Debug)]
pub struct ManualClock {
  now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
  pub fn new(start: DateTime<Utc>) -> Self {
    Self {
      now: Mutex::new(start),
    }
  }

  pub fn set(&self, at: DateTime<Utc>) {
    if let Ok(mut now) = self.now.lock() {
      *now = at;
    }
  }

  pub fn advance(&self, by: chrono::Duration) {
    if let Ok(mut now) = self.now.lock() {
      *now += by;
    }
  }
}

impl Clock for ManualClock {
  fn now(&self) -> DateTime<Utc> {
    match self.now.lock() {
      Ok(now) => *now,
      Err(poisoned) => *poisoned.into_inner(),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use chrono::TimeZone;

  fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
  }

  #[test]
  fn test_zero_ttl_means_no_expiry() {
    assert_eq!(expiry_for(t0(), None), None);
    assert_eq!(expiry_for(t0(), Some(Duration::ZERO)), None);
  }

  #[test]
  fn test_record_expiry_boundary() {
    let record = CacheRecord::new("k", Value::Null, t0(), Some(Duration::from_secs(60)));
    let expires = t0() + chrono::Duration::seconds(60);
    assert!(!record.is_expired(expires - chrono::Duration::milliseconds(1)));
    assert!(record.is_expired(expires));
  }

  #[test]
  fn test_remaining_ttl() {
    let record = CacheRecord::new("k", Value::Null, t0(), Some(Duration::from_secs(60)));
    let later = t0() + chrono::Duration::seconds(45);
    assert_eq!(record.remaining_ttl(later), Some(Duration::from_secs(15)));
    assert_eq!(
      record.remaining_ttl(t0() + chrono::Duration::seconds(90)),
      Some(Duration::ZERO)
    );
  }

  #[test]
  fn test_manual_clock_advances() {
    let clock = ManualClock::new(t0());
    clock.advance(chrono::Duration::minutes(5));
    assert_eq!(clock.now(), t0() + chrono::Duration::minutes(5));
  }
}
