//! In-memory storage
//!
//! Process-local backend used by tests and by callers that do not need
//! persistence. Locks are process-wide only, which still satisfies the
//! advisory contract for a single instance.

use std::collections::HashSet;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;

use super::{KeyInfo, Storage};
use crate::error::{Error, Result};

const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(25);

#[derive(Debug)]
struct Entry {
    value: Vec<u8>,
    modified: DateTime<Utc>,
}

/// Map-backed storage for tests and single-process deployments
#[derive(Debug, Default)]
pub struct MemoryStorage {
    entries: DashMap<String, Entry>,
    locks: Mutex<HashSet<String>>,
}

impl MemoryStorage {
    /// Create an empty in-memory storage
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn store(&self, key: &str, value: Vec<u8>) -> Result<()> {
        self.entries.insert(
            key.to_string(),
            Entry {
                value,
                modified: Utc::now(),
            },
        );
        Ok(())
    }

    async fn load(&self, key: &str) -> Result<Vec<u8>> {
        self.entries
            .get(key)
            .map(|e| e.value.clone())
            .ok_or_else(|| Error::NotExist(key.to_string()))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries
            .remove(key)
            .map(|_| ())
            .ok_or_else(|| Error::NotExist(key.to_string()))
    }

    async fn exists(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    async fn list(&self, prefix: &str, recursive: bool) -> Result<Vec<String>> {
        let prefix = prefix.trim_matches('/');
        let mut keys: Vec<String> = Vec::new();
        for entry in self.entries.iter() {
            let key = entry.key();
            let rest = if prefix.is_empty() {
                key.as_str()
            } else if let Some(rest) = key.strip_prefix(prefix).and_then(|r| r.strip_prefix('/')) {
                rest
            } else {
                continue;
            };

            if recursive || !rest.contains('/') {
                keys.push(key.clone());
            } else if let Some(child) = rest.split('/').next() {
                // surface the next path level exactly once
                let child_key = if prefix.is_empty() {
                    child.to_string()
                } else {
                    format!("{prefix}/{child}")
                };
                if !keys.contains(&child_key) {
                    keys.push(child_key);
                }
            }
        }
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    async fn stat(&self, key: &str) -> Result<KeyInfo> {
        if let Some(entry) = self.entries.get(key) {
            return Ok(KeyInfo {
                key: key.to_string(),
                modified: Some(entry.modified),
                size: entry.value.len() as u64,
                is_terminal: true,
            });
        }

        // a prefix of other keys stats as a non-terminal entry whose
        // modification time is the newest child's
        let prefix = format!("{}/", key.trim_end_matches('/'));
        let newest = self
            .entries
            .iter()
            .filter(|e| e.key().starts_with(&prefix))
            .map(|e| e.modified)
            .max();

        match newest {
            Some(modified) => Ok(KeyInfo {
                key: key.to_string(),
                modified: Some(modified),
                size: 0,
                is_terminal: false,
            }),
            None => Err(Error::NotExist(key.to_string())),
        }
    }

    async fn lock(&self, name: &str) -> Result<()> {
        loop {
            {
                let mut locks = self.locks.lock().map_err(|_| {
                    Error::Storage("lock table poisoned".to_string())
                })?;
                if locks.insert(name.to_string()) {
                    return Ok(());
                }
            }
            tokio::time::sleep(LOCK_POLL_INTERVAL).await;
        }
    }

    async fn unlock(&self, name: &str) -> Result<()> {
        let mut locks = self
            .locks
            .lock()
            .map_err(|_| Error::Storage("lock table poisoned".to_string()))?;
        locks.remove(name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_round_trip() {
        let storage = MemoryStorage::new();
        storage.store("a/b/c", b"value".to_vec()).await.unwrap();
        assert_eq!(storage.load("a/b/c").await.unwrap(), b"value");
        assert!(storage.exists("a/b/c").await);

        storage.delete("a/b/c").await.unwrap();
        assert!(storage.load("a/b/c").await.unwrap_err().is_not_exist());
    }

    #[tokio::test]
    async fn test_list_levels() {
        let storage = MemoryStorage::new();
        storage.store("users/ca/a/a.json", b"{}".to_vec()).await.unwrap();
        storage.store("users/ca/b/b.json", b"{}".to_vec()).await.unwrap();

        let shallow = storage.list("users/ca", false).await.unwrap();
        assert_eq!(shallow, vec!["users/ca/a", "users/ca/b"]);

        let deep = storage.list("users/ca", true).await.unwrap();
        assert_eq!(deep, vec!["users/ca/a/a.json", "users/ca/b/b.json"]);
    }

    #[tokio::test]
    async fn test_stat_prefix() {
        let storage = MemoryStorage::new();
        storage.store("users/ca/a/a.json", b"{}".to_vec()).await.unwrap();

        let info = storage.stat("users/ca/a").await.unwrap();
        assert!(!info.is_terminal);
        assert!(info.modified.is_some());

        let info = storage.stat("users/ca/a/a.json").await.unwrap();
        assert!(info.is_terminal);
        assert_eq!(info.size, 2);
    }

    #[tokio::test]
    async fn test_lock_single_holder() {
        let storage = std::sync::Arc::new(MemoryStorage::new());
        storage.lock("op").await.unwrap();

        let s2 = storage.clone();
        let waiter = tokio::spawn(async move { s2.lock("op").await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        storage.unlock("op").await.unwrap();
        tokio::time::timeout(Duration::from_secs(2), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}
