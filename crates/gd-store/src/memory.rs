//! In-process store backend with the same expiry semantics as Redis.
//! Used in tests and single-instance deployments (no `redis_url` configured).

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::{CoordinationStore, StoreError};

#[derive(Debug, Clone)]
enum Slot {
    Counter(u64),
    Hash(HashMap<String, String>),
    Lock,
}

#[derive(Debug)]
struct Entry {
    slot: Slot,
    expires_at: Option<Instant>,
}

impl Entry {
    fn expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// `Mutex<HashMap>` store. Every method takes the lock briefly and never
/// across an await point.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_entries<T>(&self, f: impl FnOnce(&mut HashMap<String, Entry>) -> T) -> Result<T, StoreError> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| StoreError::Backend("memory store mutex poisoned".to_string()))?;
        let now = Instant::now();
        entries.retain(|_, entry| !entry.expired(now));
        Ok(f(&mut entries))
    }
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn incr_window(&self, key: &str, ttl: Duration) -> Result<u64, StoreError> {
        self.with_entries(|entries| match entries.get_mut(key) {
            Some(Entry {
                slot: Slot::Counter(count),
                ..
            }) => {
                *count += 1;
                *count
            }
            _ => {
                entries.insert(
                    key.to_string(),
                    Entry {
                        slot: Slot::Counter(1),
                        expires_at: Some(Instant::now() + ttl),
                    },
                );
                1
            }
        })
    }

    async fn get_counter(&self, key: &str) -> Result<u64, StoreError> {
        self.with_entries(|entries| match entries.get(key) {
            Some(Entry {
                slot: Slot::Counter(count),
                ..
            }) => *count,
            _ => 0,
        })
    }

    async fn window_ttl(&self, key: &str) -> Result<Option<Duration>, StoreError> {
        self.with_entries(|entries| {
            entries
                .get(key)
                .and_then(|entry| entry.expires_at)
                .map(|at| at.saturating_duration_since(Instant::now()))
        })
    }

    async fn hash_incr(&self, key: &str, field: &str, by: i64) -> Result<i64, StoreError> {
        self.with_entries(|entries| {
            let entry = entries.entry(key.to_string()).or_insert_with(|| Entry {
                slot: Slot::Hash(HashMap::new()),
                expires_at: None,
            });
            let Slot::Hash(hash) = &mut entry.slot else {
                entry.slot = Slot::Hash(HashMap::new());
                let Slot::Hash(hash) = &mut entry.slot else {
                    unreachable!()
                };
                hash.insert(field.to_string(), by.to_string());
                return by;
            };
            let current: i64 = hash
                .get(field)
                .and_then(|v| v.parse().ok())
                .unwrap_or(0);
            let next = current + by;
            hash.insert(field.to_string(), next.to_string());
            next
        })
    }

    async fn hash_set(&self, key: &str, fields: &[(&str, String)]) -> Result<(), StoreError> {
        self.with_entries(|entries| {
            let entry = entries.entry(key.to_string()).or_insert_with(|| Entry {
                slot: Slot::Hash(HashMap::new()),
                expires_at: None,
            });
            if !matches!(entry.slot, Slot::Hash(_)) {
                entry.slot = Slot::Hash(HashMap::new());
            }
            if let Slot::Hash(hash) = &mut entry.slot {
                for (field, value) in fields {
                    hash.insert((*field).to_string(), value.clone());
                }
            }
        })
    }

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>, StoreError> {
        self.with_entries(|entries| match entries.get(key) {
            Some(Entry {
                slot: Slot::Hash(hash),
                ..
            }) => hash.clone(),
            _ => HashMap::new(),
        })
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), StoreError> {
        self.with_entries(|entries| {
            if let Some(entry) = entries.get_mut(key) {
                entry.expires_at = Some(Instant::now() + ttl);
            }
        })
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.with_entries(|entries| {
            entries.remove(key);
        })
    }

    async fn try_lock(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        self.with_entries(|entries| {
            if entries.contains_key(key) {
                return false;
            }
            entries.insert(
                key.to_string(),
                Entry {
                    slot: Slot::Lock,
                    expires_at: Some(Instant::now() + ttl),
                },
            );
            true
        })
    }

    async fn unlock(&self, key: &str) -> Result<(), StoreError> {
        self.delete(key).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_incr_window_counts_up() {
        let store = MemoryStore::new();
        assert_eq!(store.incr_window("w", Duration::from_secs(60)).await.unwrap(), 1);
        assert_eq!(store.incr_window("w", Duration::from_secs(60)).await.unwrap(), 2);
        assert_eq!(store.get_counter("w").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_window_expires() {
        let store = MemoryStore::new();
        store.incr_window("w", Duration::from_millis(20)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(store.get_counter("w").await.unwrap(), 0);
        // A fresh increment restarts the window at 1.
        assert_eq!(store.incr_window("w", Duration::from_millis(20)).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_window_ttl_reports_remaining() {
        let store = MemoryStore::new();
        store.incr_window("w", Duration::from_secs(60)).await.unwrap();
        let ttl = store.window_ttl("w").await.unwrap().unwrap();
        assert!(ttl <= Duration::from_secs(60));
        assert!(ttl > Duration::from_secs(58));
        assert!(store.window_ttl("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_hash_incr_and_get_all() {
        let store = MemoryStore::new();
        assert_eq!(store.hash_incr("h", "success", 1).await.unwrap(), 1);
        assert_eq!(store.hash_incr("h", "success", 1).await.unwrap(), 2);
        store
            .hash_set("h", &[("throttled_until", "0".to_string())])
            .await
            .unwrap();
        let all = store.hash_get_all("h").await.unwrap();
        assert_eq!(all.get("success").map(String::as_str), Some("2"));
        assert_eq!(all.get("throttled_until").map(String::as_str), Some("0"));
    }

    #[tokio::test]
    async fn test_hash_get_all_missing_is_empty() {
        let store = MemoryStore::new();
        assert!(store.hash_get_all("nope").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_lock_is_exclusive_until_released() {
        let store = MemoryStore::new();
        assert!(store.try_lock("l", Duration::from_secs(1)).await.unwrap());
        assert!(!store.try_lock("l", Duration::from_secs(1)).await.unwrap());
        store.unlock("l").await.unwrap();
        assert!(store.try_lock("l", Duration::from_secs(1)).await.unwrap());
    }

    #[tokio::test]
    async fn test_lock_expires_on_ttl() {
        let store = MemoryStore::new();
        assert!(store.try_lock("l", Duration::from_millis(20)).await.unwrap());
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(store.try_lock("l", Duration::from_millis(20)).await.unwrap());
    }

    #[tokio::test]
    async fn test_delete_removes_key() {
        let store = MemoryStore::new();
        store.hash_incr("h", "f", 5).await.unwrap();
        store.delete("h").await.unwrap();
        assert!(store.hash_get_all("h").await.unwrap().is_empty());
    }
}
