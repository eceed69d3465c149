//! Coordination store shared by all engine instances.
//!
//! The rate-window counters and credential health records are mutated by
//! every worker across every process instance, so both go through this
//! trait: atomic counters, hash field operations, and an NX+TTL lock.
//! Backends: Redis for multi-instance deployments, an in-process map for
//! tests and single-instance runs. No caller holds a store lock across a
//! provider call.

pub mod memory;
pub mod redis_store;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;

pub use memory::MemoryStore;
pub use redis_store::RedisStore;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("store backend error: {0}")]
    Backend(String),
}

/// Atomic primitives required by the dispatch engine.
///
/// All operations are last-writer-wins per field with monotonic counters;
/// there is deliberately no read-modify-write surface.
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Atomically increment a window counter, setting `ttl` when the key is
    /// created. Returns the post-increment count.
    async fn incr_window(&self, key: &str, ttl: Duration) -> Result<u64, StoreError>;

    /// Current value of a window counter (0 when absent or expired).
    async fn get_counter(&self, key: &str) -> Result<u64, StoreError>;

    /// Remaining lifetime of a key, or `None` when absent/persistent.
    async fn window_ttl(&self, key: &str) -> Result<Option<Duration>, StoreError>;

    /// Atomically increment a hash field, returning the new value.
    async fn hash_incr(&self, key: &str, field: &str, by: i64) -> Result<i64, StoreError>;

    /// Set hash fields (last-writer-wins per field).
    async fn hash_set(&self, key: &str, fields: &[(&str, String)]) -> Result<(), StoreError>;

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>, StoreError>;

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), StoreError>;

    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// SET NX PX: returns true when the lock was acquired.
    async fn try_lock(&self, key: &str, ttl: Duration) -> Result<bool, StoreError>;

    async fn unlock(&self, key: &str) -> Result<(), StoreError>;
}
