//! Storage abstraction for field-audit.
//!
//! The [`LocalStore`] trait covers the three independent tables the engine
//! persists locally:
//!
//! | Table | Contents |
//! |-------|----------|
//! | sessions | the single current [`ProjectSnapshot`], tagged with a schema version |
//! | cache | verdicts keyed by `(folder_path, fingerprint)` |
//! | sync queue | FIFO of payloads waiting to be mirrored remotely |
//!
//! Implementations must be `Send + Sync` to be shared across folder jobs.

pub mod memory;

use anyhow::Result;
use async_trait::async_trait;

use crate::fingerprint::Fingerprint;
use crate::models::{CacheEntry, ProjectSnapshot, SyncQueueItem};

/// Abstract local persistence backend.
///
/// # Operations
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`get_cache`](LocalStore::get_cache) | Look up a verdict by path and fingerprint |
/// | [`put_cache`](LocalStore::put_cache) | Insert or replace a cache entry |
/// | [`session_version`](LocalStore::session_version) | Schema tag of the stored snapshot |
/// | [`get_session`](LocalStore::get_session) | Load the stored snapshot |
/// | [`put_session`](LocalStore::put_session) | Replace the stored snapshot |
/// | [`enqueue_sync`](LocalStore::enqueue_sync) | Append to the sync queue |
/// | [`list_sync_queue`](LocalStore::list_sync_queue) | Queue contents in FIFO order |
/// | [`remove_sync_item`](LocalStore::remove_sync_item) | Drop a delivered item |
#[async_trait]
pub trait LocalStore: Send + Sync {
    /// Cache hit only when both the path and the fingerprint match.
    async fn get_cache(
        &self,
        folder_path: &str,
        fingerprint: &Fingerprint,
    ) -> Result<Option<CacheEntry>>;

    async fn put_cache(&self, entry: &CacheEntry) -> Result<()>;

    /// Drop every cache entry.
    async fn clear_cache(&self) -> Result<()>;

    /// Schema version of the stored snapshot, without decoding it.
    async fn session_version(&self) -> Result<Option<u32>>;

    async fn get_session(&self) -> Result<Option<ProjectSnapshot>>;

    async fn put_session(&self, snapshot: &ProjectSnapshot) -> Result<()>;

    async fn clear_session(&self) -> Result<()>;

    /// Append a payload; returns the assigned auto-increment id.
    async fn enqueue_sync(&self, folder_name: &str, payload: &serde_json::Value) -> Result<i64>;

    /// Every queued item, oldest first.
    async fn list_sync_queue(&self) -> Result<Vec<SyncQueueItem>>;

    async fn remove_sync_item(&self, id: i64) -> Result<()>;
}
