//! Best-effort mirror of completed analyses to a remote history log.
//!
//! Local-first: [`SyncMirror::enqueue`] always writes to the store's sync
//! queue before touching the network. [`SyncMirror::drain_queue`] delivers
//! in FIFO order and stops at the first failure, leaving that item and
//! everything after it queued for the next trigger (connectivity restored,
//! next enqueue, or application start).
//!
//! Without a configured remote every call is a successful no-op.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use field_audit_core::models::SyncQueueItem;
use field_audit_core::store::LocalStore;

use crate::config::SyncConfig;

/// Destination of mirrored history rows.
#[async_trait]
pub trait HistoryRemote: Send + Sync {
    /// Upsert one row `{user_id, folder_name, ...payload}`.
    async fn upsert(&self, user_id: &str, item: &SyncQueueItem) -> Result<()>;
}

/// Build the history row for a queued item.
pub fn history_row(user_id: &str, item: &SyncQueueItem) -> serde_json::Value {
    let mut row = match &item.payload {
        serde_json::Value::Object(map) => map.clone(),
        other => {
            let mut map = serde_json::Map::new();
            map.insert("payload".to_string(), other.clone());
            map
        }
    };
    row.insert("user_id".to_string(), serde_json::json!(user_id));
    row.insert("folder_name".to_string(), serde_json::json!(item.folder_name));
    serde_json::Value::Object(row)
}

/// PostgREST-style upsert: `POST {endpoint}/rest/v1/{table}` with
/// `Prefer: resolution=merge-duplicates`.
pub struct RestHistoryRemote {
    client: reqwest::Client,
    url: String,
    api_key: String,
}

impl RestHistoryRemote {
    pub fn new(config: &SyncConfig) -> Result<Self> {
        let endpoint = config
            .endpoint
            .as_deref()
            .ok_or_else(|| anyhow!("sync.endpoint required for rest provider"))?;
        let api_key = config
            .api_key
            .clone()
            .ok_or_else(|| anyhow!("sync.api_key required for rest provider"))?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            url: format!(
                "{}/rest/v1/{}?on_conflict=user_id,folder_name",
                endpoint.trim_end_matches('/'),
                config.table
            ),
            api_key,
        })
    }
}

#[async_trait]
impl HistoryRemote for RestHistoryRemote {
    async fn upsert(&self, user_id: &str, item: &SyncQueueItem) -> Result<()> {
        let response = self
            .client
            .post(&self.url)
            .header("apikey", &self.api_key)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Prefer", "resolution=merge-duplicates")
            .json(&history_row(user_id, item))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            bail!("history upsert failed {}: {}", status, body_text);
        }
        Ok(())
    }
}

/// Outcome of one [`SyncMirror::drain_queue`] pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub delivered: usize,
    pub remaining: usize,
}

/// Local-first forwarder of results to a [`HistoryRemote`].
pub struct SyncMirror {
    store: Arc<dyn LocalStore>,
    remote: Option<(Arc<dyn HistoryRemote>, String)>,
    online: AtomicBool,
    drain_lock: Mutex<()>,
}

impl SyncMirror {
    /// A mirror that delivers to `remote` on behalf of `user_id`.
    pub fn new(store: Arc<dyn LocalStore>, remote: Arc<dyn HistoryRemote>, user_id: impl Into<String>) -> Self {
        Self {
            store,
            remote: Some((remote, user_id.into())),
            online: AtomicBool::new(true),
            drain_lock: Mutex::new(()),
        }
    }

    /// A mirror with no remote: every call short-circuits successfully.
    pub fn disabled(store: Arc<dyn LocalStore>) -> Self {
        Self {
            store,
            remote: None,
            online: AtomicBool::new(true),
            drain_lock: Mutex::new(()),
        }
    }

    pub fn from_config(store: Arc<dyn LocalStore>, config: &SyncConfig) -> Result<Self> {
        if !config.is_enabled() {
            debug!(provider = %config.provider, "history sync disabled");
            return Ok(Self::disabled(store));
        }
        let user_id = config.user_id.clone().unwrap_or_default();
        match config.provider.as_str() {
            "rest" => Ok(Self::new(
                store,
                Arc::new(RestHistoryRemote::new(config)?),
                user_id,
            )),
            other => bail!("Unknown sync provider: {}", other),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.remote.is_some()
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// Record connectivity. Going from offline to online drains the queue.
    pub async fn set_online(&self, online: bool) -> DrainReport {
        let was_online = self.online.swap(online, Ordering::SeqCst);
        if online && !was_online {
            info!("connectivity restored, draining sync queue");
            return self.drain_queue().await;
        }
        DrainReport::default()
    }

    /// Queue a payload locally, then try to deliver if online.
    ///
    /// Only the local write can fail; delivery problems are logged and the
    /// item stays queued.
    pub async fn enqueue(&self, folder_name: &str, payload: serde_json::Value) -> Result<()> {
        if !self.record(folder_name, &payload).await? {
            return Ok(());
        }
        if self.is_online() {
            self.drain_queue().await;
        }
        Ok(())
    }

    /// Queue a payload locally and deliver it from a background task.
    ///
    /// Returns once the local write is durable; the caller never waits on
    /// the network.
    pub async fn enqueue_detached(
        self: &Arc<Self>,
        folder_name: &str,
        payload: serde_json::Value,
    ) -> Result<()> {
        if !self.record(folder_name, &payload).await? {
            return Ok(());
        }
        if self.is_online() {
            let mirror = Arc::clone(self);
            tokio::spawn(async move {
                mirror.drain_queue().await;
            });
        }
        Ok(())
    }

    /// Local write. `false` when there is no remote to mirror to.
    async fn record(&self, folder_name: &str, payload: &serde_json::Value) -> Result<bool> {
        if self.remote.is_none() {
            return Ok(false);
        }
        let id = self.store.enqueue_sync(folder_name, payload).await?;
        debug!(id, folder = folder_name, "queued history record");
        Ok(true)
    }

    /// Deliver queued items oldest first, stopping at the first failure.
    pub async fn drain_queue(&self) -> DrainReport {
        let Some((remote, user_id)) = &self.remote else {
            return DrainReport::default();
        };
        let _guard = self.drain_lock.lock().await;

        let items = match self.store.list_sync_queue().await {
            Ok(items) => items,
            Err(e) => {
                warn!(error = %e, "could not read sync queue");
                return DrainReport::default();
            }
        };

        let total = items.len();
        let mut delivered = 0;
        for item in &items {
            if let Err(e) = remote.upsert(user_id, item).await {
                warn!(id = item.id, folder = %item.folder_name, error = %e, "history delivery failed");
                break;
            }
            if let Err(e) = self.store.remove_sync_item(item.id).await {
                warn!(id = item.id, error = %e, "could not remove delivered sync item");
                break;
            }
            delivered += 1;
        }

        if delivered > 0 {
            info!(delivered, remaining = total - delivered, "sync queue drained");
        }
        DrainReport {
            delivered,
            remaining: total - delivered,
        }
    }
}
