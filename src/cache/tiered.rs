//! Two-tier store: a fast local layer in front of a durable one.

use async_trait::async_trait;
use color_eyre::Result;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::traits::{CacheRecord, CacheStore, Clock, StoreStats, SystemClock};

/// Reads consult the fast layer first; a durable hit is promoted back into
/// the fast layer with whatever TTL it has left. Writes go to both layers.
pub struct TieredStore {
  fast: Arc<dyn CacheStore>,
  durable: Arc<dyn CacheStore>,
  clock: Arc<dyn Clock>,
}

impl TieredStore {
  pub fn new(fast: Arc<dyn CacheStore>, durable: Arc<dyn CacheStore>) -> Self {
    Self {
      fast,
      durable,
      clock: Arc::new(SystemClock),
    }
  }

  pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
    self.clock = clock;
    self
  }
}

#[async_trait]
impl CacheStore for TieredStore {
  async fn get_record(&self, key: &str) -> Result<Option<CacheRecord>> {
    match self.fast.get_record(key).await {
      Ok(Some(record)) => return Ok(Some(record)),
      Ok(None) => {}
      Err(e) => warn!(key, error = %e, "fast cache layer read failed"),
    }

    let Some(record) = self.durable.get_record(key).await? else {
      return Ok(None);
    };

    let remaining = record.remaining_ttl(self.clock.now());
    if remaining != Some(Duration::ZERO) {
      debug!(key, "promoting durable cache hit into fast layer");
      if let Err(e) = self.fast.set(key, record.value.clone(), remaining).await {
        warn!(key, error = %e, "failed to promote cache entry");
      }
    }

    Ok(Some(record))
  }

  async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<()> {
    if let Err(e) = self.fast.set(key, value.clone(), ttl).await {
      warn!(key, error = %e, "fast cache layer write failed");
    }
    self.durable.set(key, value, ttl).await
  }

  async fn remove(&self, key: &str) -> Result<()> {
    if let Err(e) = self.fast.remove(key).await {
      warn!(key, error = %e, "fast cache layer remove failed");
    }
    self.durable.remove(key).await
  }

  async fn clear(&self) -> Result<()> {
    self.fast.clear().await?;
    self.durable.clear().await
  }

  async fn stats(&self) -> Result<StoreStats> {
    self.durable.stats().await
  }

  fn backend_name(&self) -> &'static str {
    "tiered"
  }
}
