//! SQLite cache storage.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::traits::{CacheRecord, CacheStore, Clock, StoreStats, SystemClock};
use crate::freshness::Predicate;

/// SQLite-based cache storage implementation.
pub struct SqliteStore {
  conn: Mutex<Connection>,
  clock: Arc<dyn Clock>,
}

impl SqliteStore {
  /// Open (or create) the cache database at the default location.
  pub fn open() -> Result<Self> {
    Self::open_at(&Self::default_path()?)
  }

  /// Open (or create) the cache database at `path`.
  pub fn open_at(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    Self::from_connection(conn)
  }

  /// A private, non-persistent database.
  pub fn in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory cache database: {}", e))?;
    Self::from_connection(conn)
  }

  fn from_connection(conn: Connection) -> Result<Self> {
    let storage = Self {
      conn: Mutex::new(conn),
      clock: Arc::new(SystemClock),
    };
    storage.run_migrations()?;
    Ok(storage)
  }

  pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
    self.clock = clock;
    self
  }

  /// Get the default database path.
  pub fn default_path() -> Result<PathBuf> {
    Ok(crate::config::data_dir()?.join("cache.db"))
  }

  /// Run database migrations for cache tables.
  fn run_migrations(&self) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;

    Ok(())
  }

  /// Keys whose `stored_at` satisfies `predicate`, oldest first.
  ///
  /// Expired rows are never reported.
  pub fn keys_matching(&self, predicate: &Predicate) -> Result<Vec<String>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    let now = self.clock.now();
    let filter = predicate.to_sql("stored_at", now);

    let sql = format!(
      "SELECT key FROM cache_entries
       WHERE {} AND (expires_at IS NULL OR expires_at > ?2)
       ORDER BY stored_at, key",
      filter.clause
    );
    let mut stmt = conn
      .prepare(&sql)
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let keys = stmt
      .query_map(params![filter.boundary_ms, now.timestamp_millis()], |row| {
        row.get::<_, String>(0)
      })
      .map_err(|e| eyre!("Failed to query keys: {}", e))?
      .collect::<rusqlite::Result<Vec<_>>>()
      .map_err(|e| eyre!("Failed to read key row: {}", e))?;

    Ok(keys)
  }

  /// Physically delete expired rows. Returns how many were removed.
  pub fn purge_expired(&self) -> Result<usize> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute(
        "DELETE FROM cache_entries WHERE expires_at IS NOT NULL AND expires_at <= ?",
        params![self.clock.now().timestamp_millis()],
      )
      .map_err(|e| eyre!("Failed to purge expired entries: {}", e))
  }
}

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
-- One row per cache key; value is serialized JSON
CREATE TABLE IF NOT EXISTS cache_entries (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    stored_at INTEGER NOT NULL,
    expires_at INTEGER
);

CREATE INDEX IF NOT EXISTS idx_cache_entries_stored ON cache_entries(stored_at);
"#;

#[async_trait]
impl CacheStore for SqliteStore {
  async fn get_record(&self, key: &str) -> Result<Option<CacheRecord>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let row: Option<(String, i64, Option<i64>)> = conn
      .query_row(
        "SELECT value, stored_at, expires_at FROM cache_entries WHERE key = ?",
        params![key],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read cache entry: {}", e))?;

    let Some((data, stored_at, expires_at)) = row else {
      return Ok(None);
    };

    let record = CacheRecord {
      key: key.to_string(),
      value: serde_json::from_str(&data)
        .map_err(|e| eyre!("Failed to deserialize cache entry {}: {}", key, e))?,
      stored_at: from_millis(stored_at)?,
      expires_at: expires_at.map(from_millis).transpose()?,
    };

    if record.is_expired(self.clock.now()) {
      conn
        .execute("DELETE FROM cache_entries WHERE key = ?", params![key])
        .map_err(|e| eyre!("Failed to drop expired entry: {}", e))?;
      return Ok(None);
    }

    Ok(Some(record))
  }

  async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<()> {
    let record = CacheRecord::new(key, value, self.clock.now(), ttl);
    let data =
      serde_json::to_string(&record.value).map_err(|e| eyre!("Failed to serialize value: {}", e))?;

    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute(
        "INSERT OR REPLACE INTO cache_entries (key, value, stored_at, expires_at)
         VALUES (?, ?, ?, ?)",
        params![
          key,
          data,
          record.stored_at.timestamp_millis(),
          record.expires_at.map(|at| at.timestamp_millis())
        ],
      )
      .map_err(|e| eyre!("Failed to store cache entry: {}", e))?;

    Ok(())
  }

  async fn remove(&self, key: &str) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute("DELETE FROM cache_entries WHERE key = ?", params![key])
      .map_err(|e| eyre!("Failed to delete cache entry: {}", e))?;

    Ok(())
  }

  async fn clear(&self) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute("DELETE FROM cache_entries", [])
      .map_err(|e| eyre!("Failed to clear cache: {}", e))?;

    Ok(())
  }

  async fn stats(&self) -> Result<StoreStats> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let count: i64 = conn
      .query_row(
        "SELECT COUNT(*) FROM cache_entries WHERE expires_at IS NULL OR expires_at > ?",
        params![self.clock.now().timestamp_millis()],
        |row| row.get(0),
      )
      .map_err(|e| eyre!("Failed to count cache entries: {}", e))?;

    Ok(StoreStats {
      entries: Some(count.max(0) as u64),
    })
  }

  fn backend_name(&self) -> &'static str {
    "sqlite"
  }
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>> {
  DateTime::<Utc>::from_timestamp_millis(ms).ok_or_else(|| eyre!("Invalid timestamp {}", ms))
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::traits::ManualClock;
  use chrono::TimeZone;
  use serde_json::json;

  fn start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
  }

  #[tokio::test]
  async fn test_persists_across_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("cache.db");

    {
      let store = SqliteStore::open_at(&path).unwrap();
      store
        .set("gh.issues.list(\"acme\")#00", json!([{"n": 1}]), None)
        .await
        .unwrap();
    }

    let store = SqliteStore::open_at(&path).unwrap();
    assert_eq!(
      store.get("gh.issues.list(\"acme\")#00").await.unwrap(),
      Some(json!([{"n": 1}]))
    );
    assert_eq!(store.stats().await.unwrap().entries, Some(1));
  }

  #[tokio::test]
  async fn test_ttl_expiry_window() {
    let clock = Arc::new(ManualClock::new(start()));
    let store = SqliteStore::in_memory().unwrap().with_clock(clock.clone());
    store
      .set("k", json!("v"), Some(Duration::from_secs(10)))
      .await
      .unwrap();

    clock.set(start() + chrono::Duration::seconds(10) - chrono::Duration::milliseconds(1));
    assert_eq!(store.get("k").await.unwrap(), Some(json!("v")));

    clock.set(start() + chrono::Duration::seconds(10) + chrono::Duration::milliseconds(1));
    assert_eq!(store.get("k").await.unwrap(), None);
    assert_eq!(store.stats().await.unwrap().entries, Some(0));
  }

  #[tokio::test]
  async fn test_keys_matching_stale_predicate() {
    let clock = Arc::new(ManualClock::new(start()));
    let store = SqliteStore::in_memory().unwrap().with_clock(clock.clone());

    store.set("old", json!(1), None).await.unwrap();
    clock.advance(chrono::Duration::hours(2));
    store.set("new", json!(2), None).await.unwrap();

    let stale = store
      .keys_matching(&Predicate::stale_since(chrono::Duration::hours(1)))
      .unwrap();
    assert_eq!(stale, vec!["old".to_string()]);

    let fresh = store
      .keys_matching(&Predicate::fresh_since(chrono::Duration::hours(1)))
      .unwrap();
    assert_eq!(fresh, vec!["new".to_string()]);
  }

  #[tokio::test]
  async fn test_purge_expired() {
    let clock = Arc::new(ManualClock::new(start()));
    let store = SqliteStore::in_memory().unwrap().with_clock(clock.clone());
    store
      .set("short", json!(1), Some(Duration::from_secs(1)))
      .await
      .unwrap();
    store.set("forever", json!(2), None).await.unwrap();

    clock.advance(chrono::Duration::seconds(5));
    assert_eq!(store.purge_expired().unwrap(), 1);
    assert_eq!(store.get("forever").await.unwrap(), Some(json!(2)));
  }

  #[tokio::test]
  async fn test_clear_and_remove() {
    let store = SqliteStore::in_memory().unwrap();
    store.set("a", json!(1), None).await.unwrap();
    store.set("b", json!(2), None).await.unwrap();

    store.remove("a").await.unwrap();
    assert_eq!(store.get("a").await.unwrap(), None);

    store.clear().await.unwrap();
    assert_eq!(store.stats().await.unwrap().entries, Some(0));
  }
}
