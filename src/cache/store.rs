//! Cache store boundary and in-memory reference implementation
//!
//! The backing store is external and swappable; orchestration logic only sees
//! this trait. Entries are inserted or evicted, never mutated in place.

use crate::plan::types::StepResult;
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;

/// Key-value cache store with TTL and prefix invalidation
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Fetch a live entry, or `None` on miss/expiry
    async fn get(&self, key: &str) -> Option<StepResult>;

    /// Insert an entry with a time-to-live
    async fn set(&self, key: &str, value: StepResult, ttl: Duration);

    /// Drop every entry whose key starts with `prefix`
    async fn invalidate_prefix(&self, prefix: &str);
}

/// In-memory cache store
///
/// Expiry is checked lazily on `get`; expired entries are dropped on access
/// and swept opportunistically on insert.
#[derive(Default)]
pub struct InMemoryCacheStore {
    entries: RwLock<HashMap<String, (StepResult, Instant)>>,
}

impl InMemoryCacheStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live (unexpired) entries
    pub async fn len(&self) -> usize {
        let now = Instant::now();
        self.entries
            .read()
            .await
            .values()
            .filter(|(_, expires)| *expires > now)
            .count()
    }

    /// True when no live entries remain
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl CacheStore for InMemoryCacheStore {
    async fn get(&self, key: &str) -> Option<StepResult> {
        {
            let entries = self.entries.read().await;
            match entries.get(key) {
                Some((value, expires)) if *expires > Instant::now() => {
                    return Some(value.clone());
                }
                None => return None,
                Some(_) => {}
            }
        }
        // Expired: drop it so the map does not accumulate dead entries.
        self.entries.write().await.remove(key);
        None
    }

    async fn set(&self, key: &str, value: StepResult, ttl: Duration) {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        entries.retain(|_, (_, expires)| *expires > now);
        entries.insert(key.to_string(), (value, now + ttl));
    }

    async fn invalidate_prefix(&self, prefix: &str) {
        self.entries
            .write()
            .await
            .retain(|key, _| !key.starts_with(prefix));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::types::{CostMeta, StepKind, StepResult};
    use serde_json::json;

    fn result(id: &str) -> StepResult {
        StepResult::succeeded(
            id.to_string(),
            StepKind::Calculation,
            json!({"value": id}),
            CostMeta::default(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_entries_expire_by_ttl() {
        let store = InMemoryCacheStore::new();
        store
            .set("v1:step:abc", result("a"), Duration::from_secs(600))
            .await;

        assert!(store.get("v1:step:abc").await.is_some());

        tokio::time::advance(Duration::from_secs(601)).await;
        assert!(store.get("v1:step:abc").await.is_none());
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_prefix_invalidation() {
        let store = InMemoryCacheStore::new();
        store
            .set("v1:step:abc", result("a"), Duration::from_secs(600))
            .await;
        store
            .set("v1:query:def", result("b"), Duration::from_secs(600))
            .await;
        store
            .set("v2:step:ghi", result("c"), Duration::from_secs(600))
            .await;

        store.invalidate_prefix("v1:").await;

        assert!(store.get("v1:step:abc").await.is_none());
        assert!(store.get("v1:query:def").await.is_none());
        assert!(store.get("v2:step:ghi").await.is_some());
    }

    #[tokio::test]
    async fn test_miss_on_unknown_key() {
        let store = InMemoryCacheStore::new();
        assert!(store.get("v1:step:missing").await.is_none());
    }
}
