//! Per-query row cache
//!
//! Single-flight memoization of hydrate results. Owned by exactly one query
//! and cleared when that query finishes.

use crate::error::CallFailure;
use crate::scope::ResourceScope;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::OnceCell;

pub type CachedResult = Result<Value, CallFailure>;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub kind: String,
    pub scope: ResourceScope,
    pub item_id: String,
    pub hydrate: String,
}

impl CacheKey {
    pub fn new(kind: &str, scope: &ResourceScope, item_id: &str, hydrate: &str) -> Self {
        Self {
            kind: kind.to_string(),
            scope: scope.clone(),
            item_id: item_id.to_string(),
            hydrate: hydrate.to_string(),
        }
    }
}

#[derive(Debug, Default)]
pub struct RowCache {
    entries: Mutex<HashMap<CacheKey, Arc<OnceCell<CachedResult>>>>,
    computations: AtomicUsize,
}

impl RowCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the cached result for `key`, computing it at most once.
    ///
    /// Concurrent callers for the same key wait on the in-flight computation.
    /// Failures are cached as well, so a failed hydrate is not re-issued for
    /// every column it feeds.
    pub async fn get_or_compute<F, Fut>(&self, key: CacheKey, compute: F) -> CachedResult
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = CachedResult>,
    {
        let cell = {
            let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
            entries.entry(key).or_default().clone()
        };

        cell.get_or_init(|| async move {
            self.computations.fetch_add(1, Ordering::Relaxed);
            compute().await
        })
        .await
        .clone()
    }

    /// Number of computations actually started
    pub fn computations(&self) -> usize {
        self.computations.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every entry; called when the owning query ends
    pub fn clear(&self) {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HydrateError;
    use std::time::Duration;

    fn key(item: &str) -> CacheKey {
        CacheKey::new(
            "gcp_storage_bucket",
            &ResourceScope::project("alpha-project"),
            item,
            "iam_policy",
        )
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_computation() {
        let cache = Arc::new(RowCache::new());
        let mut handles = Vec::new();

        for _ in 0..16 {
            let cache = cache.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_compute(key("bucket-1"), || async {
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        Ok(serde_json::json!({"bindings": []}))
                    })
                    .await
            }));
        }

        for handle in handles {
            assert!(handle.await.unwrap().is_ok());
        }
        assert_eq!(cache.computations(), 1);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn test_failures_are_cached() {
        let cache = RowCache::new();
        let fail = || async { Err(CallFailure::new(HydrateError::fatal("400"), 1)) };

        assert!(cache.get_or_compute(key("b"), fail).await.is_err());
        assert!(cache.get_or_compute(key("b"), fail).await.is_err());
        assert_eq!(cache.computations(), 1);
    }

    #[tokio::test]
    async fn test_distinct_keys_and_clear() {
        let cache = RowCache::new();
        let ok = || async { Ok(Value::Null) };

        cache.get_or_compute(key("a"), ok).await.unwrap();
        cache.get_or_compute(key("b"), ok).await.unwrap();
        assert_eq!(cache.computations(), 2);

        cache.clear();
        assert!(cache.is_empty());
    }
}
