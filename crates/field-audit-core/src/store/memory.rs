//! In-memory [`LocalStore`] implementation for tests and ephemeral sessions.
//!
//! Uses `HashMap` and `Vec` behind `std::sync::RwLock`. Snapshots keep their
//! blob handles, so nothing is re-read on restore.

use std::collections::HashMap;
use std::sync::RwLock;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::Utc;

use crate::fingerprint::Fingerprint;
use crate::models::{CacheEntry, ProjectSnapshot, SyncQueueItem};

use super::LocalStore;

#[derive(Default)]
struct SyncTable {
    next_id: i64,
    items: Vec<SyncQueueItem>,
}

/// In-memory store.
#[derive(Default)]
pub struct InMemoryStore {
    cache: RwLock<HashMap<(String, String), CacheEntry>>,
    session: RwLock<Option<ProjectSnapshot>>,
    sync: RwLock<SyncTable>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of cache entries currently held.
    pub fn cache_len(&self) -> usize {
        self.cache.read().map(|c| c.len()).unwrap_or(0)
    }
}

fn poisoned<T>(_: T) -> anyhow::Error {
    anyhow!("in-memory store lock poisoned")
}

#[async_trait]
impl LocalStore for InMemoryStore {
    async fn get_cache(
        &self,
        folder_path: &str,
        fingerprint: &Fingerprint,
    ) -> Result<Option<CacheEntry>> {
        let cache = self.cache.read().map_err(poisoned)?;
        Ok(cache
            .get(&(folder_path.to_string(), fingerprint.as_str().to_string()))
            .cloned())
    }

    async fn put_cache(&self, entry: &CacheEntry) -> Result<()> {
        let mut cache = self.cache.write().map_err(poisoned)?;
        cache.insert(
            (entry.folder_path.clone(), entry.fingerprint.clone()),
            entry.clone(),
        );
        Ok(())
    }

    async fn clear_cache(&self) -> Result<()> {
        self.cache.write().map_err(poisoned)?.clear();
        Ok(())
    }

    async fn session_version(&self) -> Result<Option<u32>> {
        let session = self.session.read().map_err(poisoned)?;
        Ok(session.as_ref().map(|s| s.schema_version))
    }

    async fn get_session(&self) -> Result<Option<ProjectSnapshot>> {
        Ok(self.session.read().map_err(poisoned)?.clone())
    }

    async fn put_session(&self, snapshot: &ProjectSnapshot) -> Result<()> {
        *self.session.write().map_err(poisoned)? = Some(snapshot.clone());
        Ok(())
    }

    async fn clear_session(&self) -> Result<()> {
        *self.session.write().map_err(poisoned)? = None;
        Ok(())
    }

    async fn enqueue_sync(&self, folder_name: &str, payload: &serde_json::Value) -> Result<i64> {
        let mut sync = self.sync.write().map_err(poisoned)?;
        sync.next_id += 1;
        let id = sync.next_id;
        sync.items.push(SyncQueueItem {
            id,
            folder_name: folder_name.to_string(),
            payload: payload.clone(),
            enqueued_at: Utc::now(),
        });
        Ok(id)
    }

    async fn list_sync_queue(&self) -> Result<Vec<SyncQueueItem>> {
        Ok(self.sync.read().map_err(poisoned)?.items.clone())
    }

    async fn remove_sync_item(&self, id: i64) -> Result<()> {
        self.sync
            .write()
            .map_err(poisoned)?
            .items
            .retain(|item| item.id != id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Verdict, VerdictStatus};
    use crate::tree::ProjectTree;

    fn entry(path: &str, fp: &str) -> CacheEntry {
        CacheEntry {
            folder_path: path.into(),
            fingerprint: fp.into(),
            verdict: Verdict::new(VerdictStatus::Completed, vec![], "ok", None),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn cache_is_keyed_by_path_and_fingerprint() {
        let store = InMemoryStore::new();
        store.put_cache(&entry("a", "f1")).await.unwrap();

        let f1 = Fingerprint::from("f1".to_string());
        let f2 = Fingerprint::from("f2".to_string());
        assert!(store.get_cache("a", &f1).await.unwrap().is_some());
        assert!(store.get_cache("a", &f2).await.unwrap().is_none());
        assert!(store.get_cache("b", &f1).await.unwrap().is_none());

        store.clear_cache().await.unwrap();
        assert_eq!(store.cache_len(), 0);
    }

    #[tokio::test]
    async fn sync_queue_is_fifo_with_increasing_ids() {
        let store = InMemoryStore::new();
        let a = store.enqueue_sync("a", &serde_json::json!({"n": 1})).await.unwrap();
        let b = store.enqueue_sync("b", &serde_json::json!({"n": 2})).await.unwrap();
        assert!(b > a);

        store.remove_sync_item(a).await.unwrap();
        let items = store.list_sync_queue().await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].folder_name, "b");
    }

    #[tokio::test]
    async fn session_roundtrip() {
        let store = InMemoryStore::new();
        assert_eq!(store.session_version().await.unwrap(), None);

        let snapshot = ProjectSnapshot::capture(&ProjectTree::new());
        store.put_session(&snapshot).await.unwrap();
        assert_eq!(
            store.session_version().await.unwrap(),
            Some(crate::models::SCHEMA_VERSION)
        );
        store.clear_session().await.unwrap();
        assert!(store.get_session().await.unwrap().is_none());
    }
}
