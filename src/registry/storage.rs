use async_trait::async_trait;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

use crate::error::RouterResult;

/// Abstract key-value persistence used by the registry
#[async_trait]
pub trait Storage: Send + Sync {
    async fn get(&self, key: &str) -> RouterResult<Option<Vec<u8>>>;
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> RouterResult<()>;
    /// Returns whether the key existed
    async fn delete(&self, key: &str) -> RouterResult<bool>;
    async fn exists(&self, key: &str) -> RouterResult<bool>;
    async fn keys(&self, prefix: &str) -> RouterResult<Vec<String>>;
}

struct Entry {
    value: Vec<u8>,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

/// In-process storage with optional per-key expiry
#[derive(Default)]
pub struct MemoryStorage {
    entries: RwLock<HashMap<String, Entry>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop expired entries, returning how many were removed
    pub async fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, e| e.is_live(now));
        before - entries.len()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn get(&self, key: &str) -> RouterResult<Option<Vec<u8>>> {
        let entries = self.entries.read().await;
        Ok(entries
            .get(key)
            .filter(|e| e.is_live(Instant::now()))
            .map(|e| e.value.clone()))
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> RouterResult<()> {
        let expires_at = ttl.map(|ttl| Instant::now() + ttl);
        self.entries
            .write()
            .await
            .insert(key.to_string(), Entry { value, expires_at });
        Ok(())
    }

    async fn delete(&self, key: &str) -> RouterResult<bool> {
        let removed = self.entries.write().await.remove(key);
        Ok(removed.is_some_and(|e| e.is_live(Instant::now())))
    }

    async fn exists(&self, key: &str) -> RouterResult<bool> {
        Ok(self.get(key).await?.is_some())
    }

    async fn keys(&self, prefix: &str) -> RouterResult<Vec<String>> {
        let now = Instant::now();
        let entries = self.entries.read().await;
        let mut keys: Vec<String> = entries
            .iter()
            .filter(|(k, e)| k.starts_with(prefix) && e.is_live(now))
            .map(|(k, _)| k.clone())
            .collect();
        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_get_delete() {
        let storage = MemoryStorage::new();
        storage.set("service:a", b"one".to_vec(), None).await.unwrap();

        assert_eq!(storage.get("service:a").await.unwrap(), Some(b"one".to_vec()));
        assert!(storage.exists("service:a").await.unwrap());
        assert!(storage.delete("service:a").await.unwrap());
        assert!(!storage.delete("service:a").await.unwrap());
        assert_eq!(storage.get("service:a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_ttl_expiry() {
        let storage = MemoryStorage::new();
        storage
            .set("short", b"x".to_vec(), Some(Duration::from_millis(20)))
            .await
            .unwrap();
        storage.set("long", b"y".to_vec(), None).await.unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!storage.exists("short").await.unwrap());
        assert!(storage.exists("long").await.unwrap());
        assert_eq!(storage.purge_expired().await, 1);
    }

    #[tokio::test]
    async fn test_keys_by_prefix() {
        let storage = MemoryStorage::new();
        for key in ["service:b", "service:a", "config:x"] {
            storage.set(key, Vec::new(), None).await.unwrap();
        }
        assert_eq!(
            storage.keys("service:").await.unwrap(),
            vec!["service:a".to_string(), "service:b".to_string()]
        );
    }
}
