//! Durable per-engine progress markers.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::cache::CacheStore;
use crate::freshness::Timestamped;

/// Last item an engine fully handled, in source order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
  pub last_processed_id: String,
  pub last_edited_at: DateTime<Utc>,
}

impl Timestamped for Checkpoint {
  fn record_id(&self) -> Option<&str> {
    Some(&self.last_processed_id)
  }

  fn timestamp(&self) -> Option<DateTime<Utc>> {
    Some(self.last_edited_at)
  }
}

#[async_trait]
pub trait CheckpointStore: Send + Sync {
  async fn get(&self, name: &str) -> Result<Option<Checkpoint>>;

  async fn set(&self, name: &str, checkpoint: &Checkpoint) -> Result<()>;

  /// Forget progress so the next run starts from the beginning.
  async fn reset(&self, name: &str) -> Result<()>;
}

/// Checkpoints kept in any [`CacheStore`], without expiry.
///
/// Durability is whatever the store provides; pair it with a SQLite or file
/// store to survive restarts.
#[derive(Clone)]
pub struct StoreCheckpoints {
  store: Arc<dyn CacheStore>,
}

impl StoreCheckpoints {
  pub fn new(store: Arc<dyn CacheStore>) -> Self {
    Self { store }
  }

  fn key(name: &str) -> String {
    format!("checkpoint:{}", name)
  }
}

#[async_trait]
impl CheckpointStore for StoreCheckpoints {
  async fn get(&self, name: &str) -> Result<Option<Checkpoint>> {
    match self.store.get(&Self::key(name)).await? {
      Some(value) => serde_json::from_value(value)
        .map(Some)
        .map_err(|e| eyre!("Failed to parse checkpoint {}: {}", name, e)),
      None => Ok(None),
    }
  }

  async fn set(&self, name: &str, checkpoint: &Checkpoint) -> Result<()> {
    let value = serde_json::to_value(checkpoint)
      .map_err(|e| eyre!("Failed to serialize checkpoint {}: {}", name, e))?;
    self.store.set(&Self::key(name), value, None).await
  }

  async fn reset(&self, name: &str) -> Result<()> {
    self.store.remove(&Self::key(name)).await
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{MemoryStore, SqliteStore};
  use chrono::TimeZone;

  fn checkpoint(id: &str) -> Checkpoint {
    Checkpoint {
      last_processed_id: id.to_string(),
      last_edited_at: Utc.with_ymd_and_hms(2024, 7, 1, 10, 0, 0).unwrap(),
    }
  }

  #[tokio::test]
  async fn test_unset_is_none() {
    let checkpoints = StoreCheckpoints::new(Arc::new(MemoryStore::new()));
    assert_eq!(checkpoints.get("priority-sync").await.unwrap(), None);
  }

  #[tokio::test]
  async fn test_set_reset() {
    let checkpoints = StoreCheckpoints::new(Arc::new(MemoryStore::new()));
    checkpoints.set("a", &checkpoint("page-1")).await.unwrap();
    checkpoints.set("b", &checkpoint("page-9")).await.unwrap();

    assert_eq!(checkpoints.get("a").await.unwrap(), Some(checkpoint("page-1")));

    checkpoints.reset("a").await.unwrap();
    assert_eq!(checkpoints.get("a").await.unwrap(), None);
    assert_eq!(checkpoints.get("b").await.unwrap(), Some(checkpoint("page-9")));
  }

  #[tokio::test]
  async fn test_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("checkpoints.db");

    StoreCheckpoints::new(Arc::new(SqliteStore::open_at(&path).unwrap()))
      .set("sync", &checkpoint("page-3"))
      .await
      .unwrap();

    let reopened = StoreCheckpoints::new(Arc::new(SqliteStore::open_at(&path).unwrap()));
    assert_eq!(reopened.get("sync").await.unwrap(), Some(checkpoint("page-3")));
  }
}
