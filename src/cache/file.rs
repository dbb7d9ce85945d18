//! File-backed cache storage: the whole cache lives in one JSON document.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::traits::{CacheRecord, CacheStore, Clock, StoreStats, SystemClock};

/// Embedded store that rewrites a single JSON file on every mutation.
///
/// Suited to small caches; every write serializes the full map.
pub struct FileStore {
  path: PathBuf,
  entries: Mutex<BTreeMap<String, CacheRecord>>,
  clock: Arc<dyn Clock>,
}

impl FileStore {
  pub fn open(path: &Path) -> Result<Self> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let entries = if path.exists() {
      let contents = std::fs::read_to_string(path)
        .map_err(|e| eyre!("Failed to read cache file {}: {}", path.display(), e))?;
      if contents.trim().is_empty() {
        BTreeMap::new()
      } else {
        serde_json::from_str(&contents)
          .map_err(|e| eyre!("Failed to parse cache file {}: {}", path.display(), e))?
      }
    } else {
      BTreeMap::new()
    };

    let store = Self {
      path: path.to_path_buf(),
      entries: Mutex::new(entries),
      clock: Arc::new(SystemClock),
    };
    // Fail early if the location is not writable.
    {
      let entries = store
        .entries
        .lock()
        .map_err(|e| eyre!("Lock poisoned: {}", e))?;
      store.flush(&entries)?;
    }
    Ok(store)
  }

  pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
    self.clock = clock;
    self
  }

  pub fn path(&self) -> &Path {
    &self.path
  }

  fn flush(&self, entries: &BTreeMap<String, CacheRecord>) -> Result<()> {
    let data =
      serde_json::to_vec(entries).map_err(|e| eyre!("Failed to serialize cache file: {}", e))?;
    let tmp = self.path.with_extension("tmp");
    std::fs::write(&tmp, data)
      .map_err(|e| eyre!("Failed to write cache file {}: {}", tmp.display(), e))?;
    std::fs::rename(&tmp, &self.path)
      .map_err(|e| eyre!("Failed to replace cache file {}: {}", self.path.display(), e))?;
    Ok(())
  }
}

#[async_trait]
impl CacheStore for FileStore {
  async fn get_record(&self, key: &str) -> Result<Option<CacheRecord>> {
    let entries = self
      .entries
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    let now = self.clock.now();
    Ok(entries.get(key).filter(|r| !r.is_expired(now)).cloned())
  }

  async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<()> {
    let mut entries = self
      .entries
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    let now = self.clock.now();
    entries.retain(|_, r| !r.is_expired(now));
    entries.insert(key.to_string(), CacheRecord::new(key, value, now, ttl));
    self.flush(&entries)
  }

  async fn remove(&self, key: &str) -> Result<()> {
    let mut entries = self
      .entries
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    if entries.remove(key).is_some() {
      self.flush(&entries)?;
    }
    Ok(())
  }

  async fn clear(&self) -> Result<()> {
    let mut entries = self
      .entries
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    entries.clear();
    self.flush(&entries)
  }

  async fn stats(&self) -> Result<StoreStats> {
    let entries = self
      .entries
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    let now = self.clock.now();
    Ok(StoreStats {
      entries: Some(entries.values().filter(|r| !r.is_expired(now)).count() as u64),
    })
  }

  fn backend_name(&self) -> &'static str {
    "file"
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::traits::ManualClock;
  use chrono::{TimeZone, Utc};
  use serde_json::json;

  #[tokio::test]
  async fn test_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cache.json");

    let store = FileStore::open(&path).unwrap();
    store.set("a", json!({"ok": true}), None).await.unwrap();
    drop(store);

    let store = FileStore::open(&path).unwrap();
    assert_eq!(store.get("a").await.unwrap(), Some(json!({"ok": true})));
  }

  #[tokio::test]
  async fn test_expired_entries_are_hidden_and_dropped_on_write() {
    let dir = tempfile::tempdir().unwrap();
    let clock = Arc::new(ManualClock::new(
      Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
    ));
    let store = FileStore::open(&dir.path().join("cache.json"))
      .unwrap()
      .with_clock(clock.clone());

    store
      .set("a", json!(1), Some(Duration::from_secs(5)))
      .await
      .unwrap();
    clock.advance(chrono::Duration::seconds(6));
    assert_eq!(store.get("a").await.unwrap(), None);

    store.set("b", json!(2), None).await.unwrap();
    assert_eq!(store.stats().await.unwrap().entries, Some(1));
  }

  #[tokio::test]
  async fn test_open_writes_an_empty_cache_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("cache.json");

    let store = FileStore::open(&path).unwrap();
    assert_eq!(std::fs::read_to_string(store.path()).unwrap(), "{}");
    assert_eq!(store.stats().await.unwrap().entries, Some(0));
  }

  #[tokio::test]
  async fn test_unwritable_location_fails_open() {
    let dir = tempfile::tempdir().unwrap();
    let blocker = dir.path().join("blocker");
    std::fs::write(&blocker, b"not a directory").unwrap();

    assert!(FileStore::open(&blocker.join("cache.json")).is_err());
  }
}
