//! In-process cache storage.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::traits::{CacheRecord, CacheStore, Clock, StoreStats, SystemClock};

/// Hash-map backed store. Expired records are dropped when read and swept on
/// every write.
pub struct MemoryStore {
  entries: Mutex<HashMap<String, CacheRecord>>,
  clock: Arc<dyn Clock>,
}

impl MemoryStore {
  pub fn new() -> Self {
    Self::with_clock(Arc::new(SystemClock))
  }

  pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
    Self {
      entries: Mutex::new(HashMap::new()),
      clock,
    }
  }
}

impl Default for MemoryStore {
  fn default() -> Self {
    Self::new()
  }
}

#[async_trait]
impl CacheStore for MemoryStore {
  async fn get_record(&self, key: &str) -> Result<Option<CacheRecord>> {
    let mut entries = self
      .entries
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    let now = self.clock.now();

    if entries.get(key).is_some_and(|record| record.is_expired(now)) {
      entries.remove(key);
      return Ok(None);
    }
    Ok(entries.get(key).cloned())
  }

  async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<()> {
    let now = self.clock.now();
    let mut entries = self
      .entries
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    entries.retain(|_, r| !r.is_expired(now));
    entries.insert(key.to_string(), CacheRecord::new(key, value, now, ttl));
    Ok(())
  }

  async fn remove(&self, key: &str) -> Result<()> {
    self
      .entries
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?
      .remove(key);
    Ok(())
  }

  async fn clear(&self) -> Result<()> {
    self
      .entries
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?
      .clear();
    Ok(())
  }

  async fn stats(&self) -> Result<StoreStats> {
    let entries = self
      .entries
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    let now = self.clock.now();
    let live = entries.values().filter(|r| !r.is_expired(now)).count();
    Ok(StoreStats {
      entries: Some(live as u64),
    })
  }

  fn backend_name(&self) -> &'static str {
    "memory"
  }
}
