//! Per-value cacheability decisions.

use serde_json::Value;

use super::key::CacheKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheabilityDecision {
  Store,
  Skip,
}

/// Decides whether a freshly fetched value may be written to the cache.
///
/// A skipped value is still returned to the caller; it just isn't stored.
pub trait CachePolicy: Send + Sync {
  fn decide(&self, key: &CacheKey, value: &Value) -> CacheabilityDecision;
}

impl<F> CachePolicy for F
where
  F: Fn(&CacheKey, &Value) -> CacheabilityDecision + Send + Sync,
{
  fn decide(&self, key: &CacheKey, value: &Value) -> CacheabilityDecision {
    self(key, value)
  }
}

/// Store everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysStore;

impl CachePolicy for AlwaysStore {
  fn decide(&self, _key: &CacheKey, _value: &Value) -> CacheabilityDecision {
    CacheabilityDecision::Store
  }
}

/// Skip values that lack a non-null `field`, e.g. a page of results without
/// its continuation cursor.
#[derive(Debug, Clone)]
pub struct RequireField {
  field: String,
}

impl RequireField {
  pub fn new(field: impl Into<String>) -> Self {
    Self {
      field: field.into(),
    }
  }
}

impl CachePolicy for RequireField {
  fn decide(&self, _key: &CacheKey, value: &Value) -> CacheabilityDecision {
    match value.get(&self.field) {
      Some(v) if !v.is_null() => CacheabilityDecision::Store,
      _ => CacheabilityDecision::Skip,
    }
  }
}
