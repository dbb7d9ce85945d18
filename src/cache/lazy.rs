//! Deferred backend construction with an in-memory fallback.

use async_trait::async_trait;
use color_eyre::Result;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{info, warn};

use super::file::FileStore;
use super::memory::MemoryStore;
use super::storage::SqliteStore;
use super::tiered::TieredStore;
use super::traits::{CacheRecord, CacheStore, StoreStats};
use crate::config::{BackendKind, CacheConfig};

type Builder = Box<dyn Fn() -> Result<Arc<dyn CacheStore>> + Send + Sync>;

/// Store whose backend is built on first use, exactly once.
///
/// If building fails the store logs a warning and carries on with a plain
/// [`MemoryStore`]; callers never see the construction error.
pub struct LazyStore {
  builder: Builder,
  backend: OnceCell<Arc<dyn CacheStore>>,
  degraded: AtomicBool,
}

impl LazyStore {
  pub fn new<F>(builder: F) -> Self
  where
    F: Fn() -> Result<Arc<dyn CacheStore>> + Send + Sync + 'static,
  {
    Self {
      builder: Box::new(builder),
      backend: OnceCell::new(),
      degraded: AtomicBool::new(false),
    }
  }

  /// Lazily build the backend described by `config`.
  pub fn from_config(config: &CacheConfig) -> Self {
    let kind = config.backend;
    let path = config.path.clone();
    Self::new(move || build_backend(kind, path.clone()))
  }

  /// True once the preferred backend failed and memory is used instead.
  pub fn is_degraded(&self) -> bool {
    self.degraded.load(Ordering::Acquire)
  }

  /// Whether the backend has been built yet.
  pub fn is_initialized(&self) -> bool {
    self.backend.initialized()
  }

  pub async fn backend(&self) -> &Arc<dyn CacheStore> {
    self
      .backend
      .get_or_init(|| async {
        match (self.builder)() {
          Ok(store) => {
            info!(backend = store.backend_name(), "cache backend ready");
            store
          }
          Err(e) => {
            warn!(error = %e, "cache backend unavailable, falling back to memory");
            self.degraded.store(true, Ordering::Release);
            Arc::new(MemoryStore::new()) as Arc<dyn CacheStore>
          }
        }
      })
      .await
  }
}

fn build_backend(kind: BackendKind, path: Option<PathBuf>) -> Result<Arc<dyn CacheStore>> {
  let store: Arc<dyn CacheStore> = match kind {
    BackendKind::Memory => Arc::new(MemoryStore::new()),
    BackendKind::File => {
      let path = match path {
        Some(p) => p,
        None => crate::config::data_dir()?.join("cache.json"),
      };
      Arc::new(FileStore::open(&path)?)
    }
    BackendKind::Sqlite => Arc::new(open_sqlite(path)?),
    BackendKind::Tiered => Arc::new(TieredStore::new(
      Arc::new(MemoryStore::new()),
      Arc::new(open_sqlite(path)?),
    )),
  };
  Ok(store)
}

fn open_sqlite(path: Option<PathBuf>) -> Result<SqliteStore> {
  match path {
    Some(p) => SqliteStore::open_at(&p),
    None => SqliteStore::open(),
  }
}

#[async_trait]
impl CacheStore for LazyStore {
  async fn get_record(&self, key: &str) -> Result<Option<CacheRecord>> {
    self.backend().await.get_record(key).await
  }

  async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<()> {
    self.backend().await.set(key, value, ttl).await
  }

  async fn remove(&self, key: &str) -> Result<()> {
    self.backend().await.remove(key).await
  }

  async fn clear(&self) -> Result<()> {
    self.backend().await.clear().await
  }

  async fn stats(&self) -> Result<StoreStats> {
    self.backend().await.stats().await
  }

  fn backend_name(&self) -> &'static str {
    match self.backend.get() {
      Some(store) => store.backend_name(),
      None => "lazy",
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use color_eyre::eyre::eyre;
  use serde_json::json;
  use std::sync::atomic::AtomicUsize;

  #[tokio::test]
  async fn test_builds_on_first_use_only() {
    let builds = Arc::new(AtomicUsize::new(0));
    let counter = builds.clone();
    let store = LazyStore::new(move || {
      counter.fetch_add(1, Ordering::SeqCst);
      Ok(Arc::new(MemoryStore::new()) as Arc<dyn CacheStore>)
    });

    assert!(!store.is_initialized());
    assert_eq!(builds.load(Ordering::SeqCst), 0);

    store.set("k", json!(1), None).await.unwrap();
    store.get("k").await.unwrap();
    assert_eq!(builds.load(Ordering::SeqCst), 1);
    assert!(!store.is_degraded());
  }

  #[tokio::test]
  async fn test_concurrent_first_access_builds_once() {
    let builds = Arc::new(AtomicUsize::new(0));
    let counter = builds.clone();
    let store = Arc::new(LazyStore::new(move || {
      counter.fetch_add(1, Ordering::SeqCst);
      Ok(Arc::new(MemoryStore::new()) as Arc<dyn CacheStore>)
    }));

    let tasks: Vec<_> = (0..8)
      .map(|i| {
        let store = store.clone();
        tokio::spawn(async move { store.set(&format!("k{i}"), json!(i), None).await })
      })
      .collect();
    for task in tasks {
      task.await.unwrap().unwrap();
    }

    assert_eq!(builds.load(Ordering::SeqCst), 1);
    assert_eq!(store.stats().await.unwrap().entries, Some(8));
  }

  #[tokio::test]
  async fn test_failed_build_degrades_to_memory() {
    let store = LazyStore::new(|| Err(eyre!("disk on fire")));

    store.set("k", json!("still works"), None).await.unwrap();
    assert_eq!(store.get("k").await.unwrap(), Some(json!("still works")));
    assert!(store.is_degraded());
    assert_eq!(store.backend_name(), "memory");
  }

  #[tokio::test]
  async fn test_unusable_sqlite_path_degrades() {
    let dir = tempfile::tempdir().unwrap();
    let blocker = dir.path().join("blocker");
    std::fs::write(&blocker, b"file, not directory").unwrap();

    let config = CacheConfig {
      backend: BackendKind::Sqlite,
      path: Some(blocker.join("cache.db")),
      ttl_secs: 0,
    };
    let store = LazyStore::from_config(&config);
    store.set("k", json!(1), None).await.unwrap();
    assert!(store.is_degraded());
  }

  #[tokio::test]
  async fn test_tiered_from_config() {
    let dir = tempfile::tempdir().unwrap();
    let config = CacheConfig {
      backend: BackendKind::Tiered,
      path: Some(dir.path().join("cache.db")),
      ttl_secs: 0,
    };
    let store = LazyStore::from_config(&config);
    store.set("k", json!(1), None).await.unwrap();
    assert_eq!(store.backend_name(), "tiered");
    assert!(!store.is_degraded());
  }
}
