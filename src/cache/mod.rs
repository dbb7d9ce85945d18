//! Transparent caching for remote API clients.
//!
//! This module provides a client-agnostic caching mechanism that:
//! - Derives deterministic keys from a call path and its arguments
//! - Stores results behind one get/set/clear/TTL contract with swappable
//!   backends (memory, JSON file, SQLite, document collection, two-tier)
//! - Builds the backend lazily and falls back to memory if it can't
//! - Wraps clients in a [`Proxy`] so every call is cache-aside

mod collection;
mod file;
mod key;
mod layer;
mod lazy;
mod memory;
mod policy;
mod proxy;
mod storage;
mod tiered;
mod traits;

pub use collection::{CollectionStore, DocumentCollection};
pub use file::FileStore;
pub use key::{truncate_middle, CacheKey, CallArgs};
pub use layer::CacheManager;
pub use lazy::LazyStore;
pub use memory::MemoryStore;
pub use policy::{AlwaysStore, CacheabilityDecision, CachePolicy, RequireField};
pub use proxy::{Interceptable, Proxy};
pub use storage::SqliteStore;
pub use tiered::TieredStore;
pub use traits::{CacheRecord, CacheStore, Clock, ManualClock, StoreStats, SystemClock};
