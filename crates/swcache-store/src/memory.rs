//! In-memory cache backend.

use async_trait::async_trait;
use hashbrown::HashMap;
use tokio::sync::RwLock;

use crate::{CacheBackend, CacheEntry, StoreError};

#[derive(Debug, Default)]
struct Bucket {
    /// Keys in insertion order.
    order: Vec<String>,
    entries: HashMap<String, CacheEntry>,
}

impl Bucket {
    fn insert(&mut self, entry: CacheEntry) {
        if self.entries.contains_key(&entry.url) {
            self.order.retain(|k| k != &entry.url);
        }
        self.order.push(entry.url.clone());
        self.entries.insert(entry.url.clone(), entry);
    }

    fn remove(&mut self, key: &str) -> bool {
        if self.entries.remove(key).is_some() {
            self.order.retain(|k| k != key);
            true
        } else {
            false
        }
    }
}

/// Process-local backend. Contents are lost when dropped.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    /// Buckets in creation order.
    buckets: RwLock<Vec<(String, Bucket)>>,
}

impl MemoryBackend {
    /// Create an empty backend.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CacheBackend for MemoryBackend {
    async fn open(&self, name: &str) -> Result<(), StoreError> {
        let mut buckets = self.buckets.write().await;
        if !buckets.iter().any(|(n, _)| n == name) {
            buckets.push((name.to_string(), Bucket::default()));
        }
        Ok(())
    }

    async fn has(&self, name: &str) -> Result<bool, StoreError> {
        Ok(self.buckets.read().await.iter().any(|(n, _)| n == name))
    }

    async fn delete(&self, name: &str) -> Result<bool, StoreError> {
        let mut buckets = self.buckets.write().await;
        let before = buckets.len();
        buckets.retain(|(n, _)| n != name);
        Ok(buckets.len() != before)
    }

    async fn names(&self) -> Result<Vec<String>, StoreError> {
        Ok(self
            .buckets
            .read()
            .await
            .iter()
            .map(|(n, _)| n.clone())
            .collect())
    }

    async fn get(&self, name: &str, key: &str) -> Result<Option<CacheEntry>, StoreError> {
        let buckets = self.buckets.read().await;
        Ok(buckets
            .iter()
            .find(|(n, _)| n == name)
            .and_then(|(_, bucket)| bucket.entries.get(key).cloned()))
    }

    async fn put(&self, name: &str, entries: Vec<CacheEntry>) -> Result<(), StoreError> {
        let mut buckets = self.buckets.write().await;
        let (_, bucket) = buckets
            .iter_mut()
            .find(|(n, _)| n == name)
            .ok_or_else(|| StoreError::CacheNotFound(name.to_string()))?;
        for entry in entries {
            bucket.insert(entry);
        }
        Ok(())
    }

    async fn remove(&self, name: &str, key: &str) -> Result<bool, StoreError> {
        let mut buckets = self.buckets.write().await;
        Ok(buckets
            .iter_mut()
            .find(|(n, _)| n == name)
            .map(|(_, bucket)| bucket.remove(key))
            .unwrap_or(false))
    }

    async fn keys(&self, name: &str) -> Result<Vec<String>, StoreError> {
        let buckets = self.buckets.read().await;
        buckets
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, bucket)| bucket.order.clone())
            .ok_or_else(|| StoreError::CacheNotFound(name.to_string()))
    }
}
