//! DDL Cache
//!
//! Memoizes DDL text per (connection, catalog, schema, resource type, name).
//! A miss takes a lock for that key only: concurrent requests for the same
//! key wait for one supplier call, while other keys proceed independently.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::instrument;

use crate::error::Result;
use crate::plugin::Facet;
use crate::provider::Scope;

/// Cache key
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DdlKey {
    pub connection_id: String,
    pub scope: Scope,
    pub resource_type: Facet,
    pub resource_name: String,
}

impl DdlKey {
    pub fn new(connection_id: &str, scope: &Scope, resource_type: Facet, resource_name: &str) -> Self {
        Self {
            connection_id: connection_id.to_string(),
            scope: scope.clone(),
            resource_type,
            resource_name: resource_name.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
struct CachedDdl {
    ddl: String,
    fetched_at: Instant,
}

/// Per-key single-flight DDL cache
#[derive(Debug, Default)]
pub struct DdlCache {
    entries: DashMap<DdlKey, CachedDdl>,
    locks: DashMap<DdlKey, Arc<Mutex<()>>>,
    ttl: Option<Duration>,
}

impl DdlCache {
    /// `ttl = None` keeps entries until invalidated
    #[must_use]
    pub fn new(ttl: Option<Duration>) -> Self {
        Self { entries: DashMap::new(), locks: DashMap::new(), ttl }
    }

    /// Return cached DDL for `key`, calling `supplier` at most once per miss.
    ///
    /// Supplier errors are returned to the lock holder and not cached; the
    /// next waiter retries.
    #[instrument(skip(self, supplier), fields(resource = %key.resource_name, kind = %key.resource_type))]
    pub async fn fetch<F, Fut>(&self, key: &DdlKey, supplier: F) -> Result<String>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<String>>,
    {
        if let Some(ddl) = self.lookup(key) {
            tracing::trace!("ddl cache hit");
            return Ok(ddl);
        }

        let lock = Arc::clone(self.locks.entry(key.clone()).or_default().value());
        let outcome = {
            let _held = lock.lock().await;
            self.fill(key, supplier).await
        };

        // the map and this clone are the only holders once nobody waits
        self.locks.remove_if(key, |_, entry| Arc::ptr_eq(entry, &lock) && Arc::strong_count(entry) == 2);
        outcome
    }

    async fn fill<F, Fut>(&self, key: &DdlKey, supplier: F) -> Result<String>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<String>>,
    {
        if let Some(ddl) = self.lookup(key) {
            tracing::trace!("ddl cache filled while waiting");
            return Ok(ddl);
        }

        tracing::debug!("ddl cache miss; fetching");
        let ddl = supplier().await?;
        self.entries.insert(key.clone(), CachedDdl { ddl: ddl.clone(), fetched_at: Instant::now() });
        Ok(ddl)
    }

    /// Whether a live entry exists for `key`
    #[must_use]
    pub fn contains(&self, key: &DdlKey) -> bool {
        self.lookup(key).is_some()
    }

    /// Drop every entry belonging to a connection
    pub fn invalidate(&self, connection_id: &str) {
        self.entries.retain(|key, _| key.connection_id != connection_id);
        self.locks.retain(|key, lock| key.connection_id != connection_id || Arc::strong_count(lock) > 1);
    }

    /// Drop one entry
    pub fn invalidate_key(&self, key: &DdlKey) {
        self.entries.remove(key);
    }

    pub fn invalidate_all(&self) {
        self.entries.clear();
        self.locks.retain(|_, lock| Arc::strong_count(lock) > 1);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn lookup(&self, key: &DdlKey) -> Option<String> {
        let entry = self.entries.get(key)?;
        if let Some(ttl) = self.ttl {
            if entry.fetched_at.elapsed() >= ttl {
                drop(entry);
                self.entries.remove(key);
                return None;
            }
        }
        Some(entry.ddl.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HubError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn key(connection_id: &str, name: &str) -> DdlKey {
        DdlKey::new(connection_id, &Scope::new(Some("main"), None), Facet::Table, name)
    }

    #[tokio::test]
    async fn test_concurrent_fetch_calls_supplier_once() {
        let cache = Arc::new(DdlCache::new(None));
        let calls = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..16 {
            let cache = Arc::clone(&cache);
            let calls = Arc::clone(&calls);
            tasks.push(tokio::spawn(async move {
                cache
                    .fetch(&key("c1", "users"), || async {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        Ok("CREATE TABLE users (id INTEGER)".to_string())
                    })
                    .await
            }));
        }

        for task in tasks {
            assert_eq!(task.await.unwrap().unwrap(), "CREATE TABLE users (id INTEGER)");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(cache.locks.is_empty());
    }

    #[tokio::test]
    async fn test_fill_locks_do_not_accumulate() {
        let cache = DdlCache::new(None);
        for i in 0..50 {
            let name = format!("t{i}");
            cache.fetch(&key("c1", &name), || async { Ok(format!("CREATE TABLE {name} (x)")) }).await.unwrap();
        }
        let _ = cache.fetch(&key("c1", "gone"), || async { Err(HubError::not_found("gone")) }).await;

        assert_eq!(cache.len(), 50);
        assert!(cache.locks.is_empty());
    }

    #[tokio::test]
    async fn test_different_keys_fetch_independently() {
        let cache = DdlCache::new(None);
        let a = cache.fetch(&key("c1", "a"), || async { Ok("A".to_string()) }).await.unwrap();
        let b = cache.fetch(&key("c1", "b"), || async { Ok("B".to_string()) }).await.unwrap();
        assert_eq!((a.as_str(), b.as_str()), ("A", "B"));
        assert_eq!(cache.len(), 2);
    }

    #[tokio::test]
    async fn test_errors_are_not_cached() {
        let cache = DdlCache::new(None);
        let err = cache
            .fetch(&key("c1", "t"), || async { Err(HubError::not_found("table t does not exist")) })
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "NOT_FOUND");
        assert!(cache.is_empty());

        let ddl = cache.fetch(&key("c1", "t"), || async { Ok("CREATE TABLE t (x)".to_string()) }).await;
        assert_eq!(ddl.unwrap(), "CREATE TABLE t (x)");
    }

    #[tokio::test]
    async fn test_invalidate_connection() {
        let cache = DdlCache::new(None);
        cache.fetch(&key("c1", "a"), || async { Ok("A".to_string()) }).await.unwrap();
        cache.fetch(&key("c2", "a"), || async { Ok("A2".to_string()) }).await.unwrap();

        cache.invalidate("c1");
        assert!(!cache.contains(&key("c1", "a")));
        assert!(cache.contains(&key("c2", "a")));

        cache.invalidate_key(&key("c2", "a"));
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_ttl_expiry_refetches() {
        let cache = DdlCache::new(Some(Duration::from_millis(10)));
        cache.fetch(&key("c1", "a"), || async { Ok("old".to_string()) }).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        let ddl = cache.fetch(&key("c1", "a"), || async { Ok("new".to_string()) }).await.unwrap();
        assert_eq!(ddl, "new");
    }

    #[test]
    fn test_scope_is_part_of_key() {
        let main = DdlKey::new("c1", &Scope::new(Some("main"), None), Facet::View, "v");
        let temp = DdlKey::new("c1", &Scope::new(Some("temp"), None), Facet::View, "v");
        assert_ne!(main, temp);
    }
}
