//! Cache-aside interception of client calls.
//!
//! A [`Proxy`] keeps the shape of the wrapped client: sub-clients are reached
//! through [`Proxy::scope`] / [`Proxy::project`] and every call made through
//! the proxy is keyed by its full dotted path and arguments.
//!
//! ```ignore
//! let gh = manager.wrap(github, "github");
//! let labels: Vec<Label> = gh
//!   .project("issues", |c| c.issues())
//!   .call_with("list_labels", call_args![owner, repo, number], |issues| async move {
//!     issues.list_labels(&owner, &repo, number).await
//!   })
//!   .await?;
//! ```

use async_trait::async_trait;
use color_eyre::Result;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, warn};

use super::key::{CacheKey, CallArgs};
use super::layer::CacheManager;
use super::policy::{AlwaysStore, CacheabilityDecision, CachePolicy};

/// A client that can be driven by path and JSON arguments alone.
///
/// `path` is the proxy's accumulated call path followed by the method name.
#[async_trait]
pub trait Interceptable: Send + Sync {
  async fn invoke(&self, path: &[String], args: &[Value]) -> Result<Value>;
}

/// Cache-aside wrapper around a client.
pub struct Proxy<C> {
  client: Arc<C>,
  namespace: Arc<str>,
  path: Vec<String>,
  cache: CacheManager,
  policy: Arc<dyn CachePolicy>,
}

impl<C> Clone for Proxy<C> {
  fn clone(&self) -> Self {
    Self {
      client: Arc::clone(&self.client),
      namespace: Arc::clone(&self.namespace),
      path: self.path.clone(),
      cache: self.cache.clone(),
      policy: Arc::clone(&self.policy),
    }
  }
}

impl<C: Send + Sync + 'static> Proxy<C> {
  pub(crate) fn new(client: Arc<C>, namespace: &str, cache: CacheManager) -> Self {
    Self {
      client,
      namespace: Arc::from(namespace),
      path: Vec::new(),
      cache,
      policy: Arc::new(AlwaysStore),
    }
  }

  /// Replace the cacheability policy. Scopes derived afterwards inherit it.
  pub fn with_policy(mut self, policy: impl CachePolicy + 'static) -> Self {
    self.policy = Arc::new(policy);
    self
  }

  /// Same client, one level deeper in the call path.
  pub fn scope(&self, segment: &str) -> Self {
    let mut scoped = self.clone();
    scoped.path.push(segment.to_string());
    scoped
  }

  /// A sub-client reached from this one, one level deeper in the call path.
  pub fn project<S, F>(&self, segment: &str, f: F) -> Proxy<S>
  where
    S: Send + Sync + 'static,
    F: FnOnce(&C) -> S,
  {
    let mut path = self.path.clone();
    path.push(segment.to_string());
    Proxy {
      client: Arc::new(f(self.client.as_ref())),
      namespace: Arc::clone(&self.namespace),
      path,
      cache: self.cache.clone(),
      policy: Arc::clone(&self.policy),
    }
  }

  /// The wrapped client, for calls that must bypass the cache (writes).
  pub fn inner(&self) -> &C {
    &self.client
  }

  pub fn namespace(&self) -> &str {
    &self.namespace
  }

  pub fn path(&self) -> &[String] {
    &self.path
  }

  /// Key a call to `method` with `args` would use.
  pub fn key_for(&self, method: &str, args: &CallArgs) -> CacheKey {
    CacheKey::encode(&self.namespace, self.full_path(method).as_slice(), args)
  }

  fn full_path(&self, method: &str) -> Vec<String> {
    let mut path = self.path.clone();
    path.push(method.to_string());
    path
  }

  /// Drop the cached result of one call so the next one refetches.
  pub async fn invalidate(&self, method: &str, args: &CallArgs) -> Result<()> {
    let key = self.key_for(method, args);
    self.cache.store().remove(key.as_str()).await
  }

  /// Run `fetch` through the cache.
  ///
  /// 1. Hit: return the stored value; `fetch` is not called
  /// 2. Miss: call `fetch`; its error propagates and nothing is stored
  /// 3. Store the result unless the policy says skip
  ///
  /// Store failures are logged and otherwise ignored.
  pub async fn call_with<T, F, Fut>(&self, method: &str, args: CallArgs, fetch: F) -> Result<T>
  where
    T: Serialize + DeserializeOwned,
    F: FnOnce(Arc<C>) -> Fut,
    Fut: Future<Output = Result<T>>,
  {
    let key = self.key_for(method, &args);

    match self.cache.store().get(key.as_str()).await {
      Ok(Some(cached)) => match serde_json::from_value::<T>(cached) {
        Ok(value) => {
          debug!(key = %key, "cache hit");
          return Ok(value);
        }
        Err(e) => warn!(key = %key, error = %e, "cached value has unexpected shape, refetching"),
      },
      Ok(None) => debug!(key = %key, "cache miss"),
      Err(e) => warn!(key = %key, error = %e, "cache read failed, calling through"),
    }

    let value = fetch(Arc::clone(&self.client)).await?;

    match serde_json::to_value(&value) {
      Ok(json) => self.store(&key, json).await,
      Err(e) => warn!(key = %key, error = %e, "result not serializable, not cached"),
    }

    Ok(value)
  }

  async fn store(&self, key: &CacheKey, value: Value) {
    if self.policy.decide(key, &value) == CacheabilityDecision::Skip {
      debug!(key = %key, "result not cacheable, skipping store");
      return;
    }

    match self
      .cache
      .store()
      .set(key.as_str(), value, self.cache.ttl())
      .await
    {
      Ok(()) => debug!(key = %key, "cached"),
      Err(e) => warn!(key = %key, error = %e, "cache write failed"),
    }
  }
}

impl<C: Interceptable + 'static> Proxy<C> {
  /// Call `method` on an [`Interceptable`] client through the cache.
  pub async fn call(&self, method: &str, args: CallArgs) -> Result<Value> {
    let path = self.full_path(method);
    let values = args.values().to_vec();
    self
      .call_with(method, args, move |client| async move {
        client.invoke(&path, &values).await
      })
      .await
  }
}
