//! Cache manager: the one handle every cached component shares.

use color_eyre::Result;
use std::sync::Arc;
use std::time::Duration;

use super::lazy::LazyStore;
use super::proxy::Proxy;
use super::traits::{CacheStore, StoreStats};
use crate::config::CacheConfig;

/// Owns the store and the default TTL, and hands out [`Proxy`] wrappers.
///
/// Construct one at startup and pass it (or clones of it) to whatever needs
/// caching; clones share the same store.
#[derive(Clone)]
pub struct CacheManager {
  store: Arc<dyn CacheStore>,
  ttl: Option<Duration>,
}

impl CacheManager {
  /// Create a manager over an existing store, with no default TTL.
  pub fn new(store: Arc<dyn CacheStore>) -> Self {
    Self { store, ttl: None }
  }

  /// Create a manager whose backend is built lazily from configuration.
  pub fn from_config(config: &CacheConfig) -> Self {
    Self::new(Arc::new(LazyStore::from_config(config))).with_ttl(config.ttl())
  }

  /// TTL applied to every value stored through this manager's proxies.
  pub fn with_ttl(mut self, ttl: Option<Duration>) -> Self {
    self.ttl = ttl;
    self
  }

  pub fn ttl(&self) -> Option<Duration> {
    self.ttl
  }

  pub fn store(&self) -> &Arc<dyn CacheStore> {
    &self.store
  }

  /// Wrap `client` so its calls go through the cache under `namespace`.
  pub fn wrap<C: Send + Sync + 'static>(&self, client: C, namespace: &str) -> Proxy<C> {
    self.wrap_shared(Arc::new(client), namespace)
  }

  pub fn wrap_shared<C: Send + Sync + 'static>(&self, client: Arc<C>, namespace: &str) -> Proxy<C> {
    Proxy::new(client, namespace, self.clone())
  }

  pub async fn clear(&self) -> Result<()> {
    self.store.clear().await
  }

  pub async fn stats(&self) -> Result<StoreStats> {
    self.store.stats().await
  }
}

impl std::fmt::Debug for CacheManager {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("CacheManager")
      .field("backend", &self.store.backend_name())
      .field("ttl", &self.ttl)
      .finish()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::memory::MemoryStore;
  use crate::config::BackendKind;
  use serde_json::json;

  #[tokio::test]
  async fn test_clones_share_store() {
    let manager = CacheManager::new(Arc::new(MemoryStore::new()));
    let other = manager.clone();

    manager.store().set("k", json!(1), None).await.unwrap();
    assert_eq!(other.store().get("k").await.unwrap(), Some(json!(1)));
    assert_eq!(other.stats().await.unwrap().entries, Some(1));

    other.clear().await.unwrap();
    assert_eq!(manager.stats().await.unwrap().entries, Some(0));
  }

  #[tokio::test]
  async fn test_from_config_is_lazy_and_carries_ttl() {
    let config = CacheConfig {
      backend: BackendKind::Memory,
      path: None,
      ttl_secs: 90,
    };
    let manager = CacheManager::from_config(&config);
    assert_eq!(manager.ttl(), Some(Duration::from_secs(90)));
    assert_eq!(manager.store().backend_name(), "lazy");

    manager.stats().await.unwrap();
    assert_eq!(manager.store().backend_name(), "memory");
  }
}
