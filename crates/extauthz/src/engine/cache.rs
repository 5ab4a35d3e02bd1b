//! Shared caches used across check calls

use std::future::Future;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use serde_json::Value;
use tokio::sync::OnceCell;
use tracing::debug;

use super::PreparedQuery;
use crate::error::Result;

type Slot = Arc<OnceCell<Arc<dyn PreparedQuery>>>;

/// Lazily compiled entry point, reset on every policy recompilation
///
/// Concurrent callers that race the first compile share a single
/// compilation. `invalidate` swaps in an empty slot; a compile already in
/// flight finishes into the old slot and is never observed by later calls.
pub struct PreparedQueryCache {
    slot: RwLock<Slot>,
}

impl Default for PreparedQueryCache {
    fn default() -> Self {
        Self::new()
    }
}

impl PreparedQueryCache {
    /// Create an empty cache
    pub fn new() -> Self {
        Self {
            slot: RwLock::new(Arc::new(OnceCell::new())),
        }
    }

    /// Return the compiled query, compiling it if the slot is empty
    ///
    /// A failed compile leaves the slot empty so the next call retries.
    pub async fn get_or_compile<F, Fut>(&self, compile: F) -> Result<Arc<dyn PreparedQuery>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Arc<dyn PreparedQuery>>>,
    {
        let slot = self.slot.read().clone();
        slot.get_or_try_init(compile).await.map(Arc::clone)
    }

    /// Drop the compiled query
    pub fn invalidate(&self) {
        *self.slot.write() = Arc::new(OnceCell::new());
        debug!("Prepared query invalidated");
    }

    /// Whether a compiled query is currently cached
    pub fn is_initialized(&self) -> bool {
        self.slot.read().initialized()
    }
}

/// Process-wide cache of builtin call results, keyed by call signature
///
/// Shared by every call and never cleared per call. Engines that memoize
/// builtins across queries fill it; `RegoEngine` does not.
pub struct BuiltinCache {
    entries: DashMap<String, Value>,
    max_entries: usize,
}

impl BuiltinCache {
    /// Create a cache holding at most `max_entries` results
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: DashMap::new(),
            max_entries,
        }
    }

    /// Upper bound on cached results
    pub fn max_entries(&self) -> usize {
        self.max_entries
    }

    /// Number of cached results
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for BuiltinCache {
    fn default() -> Self {
        Self::new(10_000)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{Evaluation, InputValue};
    use crate::error::ExtAuthzError;
    use crate::store::Transaction;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct Fixed;

    #[async_trait]
    impl PreparedQuery for Fixed {
        async fn eval(
            &self,
            _input: &InputValue,
            _txn: &Transaction,
            _cache: &BuiltinCache,
        ) -> Result<Evaluation> {
            Ok(Evaluation::default())
        }
    }

    async fn slow_compile(counter: Arc<AtomicUsize>) -> Result<Arc<dyn PreparedQuery>> {
        counter.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(20)).await;
        Ok(Arc::new(Fixed))
    }

    #[tokio::test]
    async fn test_racing_callers_compile_once() {
        let cache = Arc::new(PreparedQueryCache::new());
        let compiles = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let cache = cache.clone();
            let compiles = compiles.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_compile(|| slow_compile(compiles))
                    .await
                    .map(|_| ())
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(compiles.load(Ordering::SeqCst), 1);
        assert!(cache.is_initialized());
    }

    #[tokio::test]
    async fn test_invalidate_forces_one_recompile() {
        let cache = Arc::new(PreparedQueryCache::new());
        let compiles = Arc::new(AtomicUsize::new(0));

        cache
            .get_or_compile(|| slow_compile(compiles.clone()))
            .await
            .unwrap();
        cache.invalidate();
        assert!(!cache.is_initialized());

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            let compiles = compiles.clone();
            handles.push(tokio::spawn(async move {
                cache.get_or_compile(|| slow_compile(compiles)).await.is_ok()
            }));
        }
        for handle in handles {
            assert!(handle.await.unwrap());
        }

        assert_eq!(compiles.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_failed_compile_is_retried() {
        let cache = PreparedQueryCache::new();

        let err = cache
            .get_or_compile(|| async { Err(ExtAuthzError::evaluation("rego_parse_error")) })
            .await;
        assert!(err.is_err());
        assert!(!cache.is_initialized());

        let ok = cache
            .get_or_compile(|| async { Ok(Arc::new(Fixed) as Arc<dyn PreparedQuery>) })
            .await;
        assert!(ok.is_ok());
    }

    #[test]
    fn test_builtin_cache_starts_empty() {
        let cache = BuiltinCache::default();
        assert!(cache.is_empty());
        assert_eq!(cache.len(), 0);
        assert_eq!(cache.max_entries(), 10_000);
    }
}
