//! Cache storage over a shared document-database collection.
//!
//! The database driver itself lives outside this crate; anything that can
//! satisfy [`DocumentCollection`] can back the cache. Each cache record is one
//! document:
//!
//! ```text
//! { "_id": <key>, "value": <json>, "storedAt": <rfc3339>, "expiresAt": <rfc3339|null> }
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

use super::traits::{CacheRecord, CacheStore, Clock, StoreStats, SystemClock};
use crate::freshness::{document_timestamp, Predicate};

pub const STORED_AT_FIELD: &str = "storedAt";
pub const EXPIRES_AT_FIELD: &str = "expiresAt";

/// Minimal driver surface needed from a document collection.
#[async_trait]
pub trait DocumentCollection: Send + Sync {
  /// First document matching a query filter.
  async fn find_one(&self, filter: Value) -> Result<Option<Value>>;

  /// Ids of documents matching a query filter (`$gte`, `$lte`, `$or`,
  /// `$exists` and `null` equality are the only operators used).
  async fn find_ids(&self, filter: Value) -> Result<Vec<String>>;

  /// Insert or fully replace the document with this id.
  async fn upsert(&self, id: &str, document: Value) -> Result<()>;

  async fn delete_one(&self, id: &str) -> Result<()>;

  async fn delete_all(&self) -> Result<()>;

  async fn count(&self) -> Result<u64>;
}

pub struct CollectionStore<D: DocumentCollection> {
  collection: D,
  clock: Arc<dyn Clock>,
}

impl<D: DocumentCollection> CollectionStore<D> {
  pub fn new(collection: D) -> Self {
    Self {
      collection,
      clock: Arc::new(SystemClock),
    }
  }

  pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
    self.clock = clock;
    self
  }

  /// Keys whose stored timestamp satisfies `predicate`.
  pub async fn keys_matching(&self, predicate: &Predicate) -> Result<Vec<String>> {
    let filter = predicate.to_document_filter(STORED_AT_FIELD, self.clock.now());
    self.collection.find_ids(filter).await
  }
}

fn to_document(record: &CacheRecord) -> Value {
  json!({
    "_id": record.key,
    "value": record.value,
    STORED_AT_FIELD: document_timestamp(record.stored_at),
    EXPIRES_AT_FIELD: record.expires_at.map(document_timestamp),
  })
}

fn from_document(key: &str, mut document: Value) -> Result<CacheRecord> {
  let stored_at = parse_timestamp(document.get(STORED_AT_FIELD))?
    .ok_or_else(|| eyre!("Cache document {} has no {}", key, STORED_AT_FIELD))?;
  let expires_at = parse_timestamp(document.get(EXPIRES_AT_FIELD))?;
  let value = document
    .get_mut("value")
    .map(Value::take)
    .unwrap_or(Value::Null);

  Ok(CacheRecord {
    key: key.to_string(),
    value,
    stored_at,
    expires_at,
  })
}

fn parse_timestamp(field: Option<&Value>) -> Result<Option<DateTime<Utc>>> {
  match field {
    None | Some(Value::Null) => Ok(None),
    Some(Value::String(s)) => DateTime::parse_from_rfc3339(s)
      .map(|dt| Some(dt.with_timezone(&Utc)))
      .map_err(|e| eyre!("Failed to parse timestamp '{}': {}", s, e)),
    Some(other) => Err(eyre!("Unexpected timestamp value {}", other)),
  }
}

#[async_trait]
impl<D: DocumentCollection> CacheStore for CollectionStore<D> {
  async fn get_record(&self, key: &str) -> Result<Option<CacheRecord>> {
    let Some(document) = self.collection.find_one(json!({ "_id": key })).await? else {
      return Ok(None);
    };

    let record = from_document(key, document)?;
    if record.is_expired(self.clock.now()) {
      self.collection.delete_one(key).await?;
      return Ok(None);
    }
    Ok(Some(record))
  }

  async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<()> {
    let record = CacheRecord::new(key, value, self.clock.now(), ttl);
    self.collection.upsert(key, to_document(&record)).await
  }

  async fn remove(&self, key: &str) -> Result<()> {
    self.collection.delete_one(key).await
  }

  async fn clear(&self) -> Result<()> {
    self.collection.delete_all().await
  }

  async fn stats(&self) -> Result<StoreStats> {
    // Counts expired-but-not-yet-dropped documents too.
    Ok(StoreStats {
      entries: Some(self.collection.count().await?),
    })
  }

  fn backend_name(&self) -> &'static str {
    "collection"
  }
}
