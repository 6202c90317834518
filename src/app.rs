//! Application session wiring.
//!
//! [`AuditSession`] builds one instance of every component (store, tree,
//! analysis client, sync mirror, queue, autosaver) and owns them for the
//! lifetime of an application session. Nothing here is process-global: two
//! sessions over two databases are fully independent.

use std::sync::Arc;

use anyhow::Result;
use tracing::info;

use field_audit_core::models::ImportEntry;
use field_audit_core::store::LocalStore;
use field_audit_core::tree::ProjectTree;

use crate::analysis::AnalysisClient;
use crate::config::{validate, Config};
use crate::progress::LogProgress;
use crate::queue::{AnalysisQueue, QueueStats};
use crate::session::{reset_local_state, restore_session, save_now, Autosaver};
use crate::sqlite_store::SqliteStore;
use crate::state::SharedTree;
use crate::sync::{DrainReport, SyncMirror};

pub struct AuditSession {
    store: Arc<dyn LocalStore>,
    tree: Arc<SharedTree>,
    mirror: Arc<SyncMirror>,
    queue: Arc<AnalysisQueue>,
    autosaver: Autosaver,
}

impl AuditSession {
    /// Open the configured database, restore the last project and deliver
    /// any history records left over from a previous run.
    pub async fn open(config: &Config) -> Result<Self> {
        validate(config)?;
        let store: Arc<dyn LocalStore> = Arc::new(SqliteStore::open(config).await?);
        let client = Arc::new(AnalysisClient::from_config(&config.analysis)?);
        let mirror = Arc::new(SyncMirror::from_config(Arc::clone(&store), &config.sync)?);
        Self::with_components(config, store, client, mirror).await
    }

    /// Wire a session around caller-supplied components.
    pub async fn with_components(
        config: &Config,
        store: Arc<dyn LocalStore>,
        client: Arc<AnalysisClient>,
        mirror: Arc<SyncMirror>,
    ) -> Result<Self> {
        let restored = restore_session(store.as_ref()).await?;
        if let Some(tree) = &restored {
            info!(folders = tree.folders().len(), "restored previous project");
        }
        let tree = Arc::new(SharedTree::new(restored.unwrap_or_default()));

        mirror.drain_queue().await;

        let queue = Arc::new(
            AnalysisQueue::new(
                Arc::clone(&tree),
                Arc::clone(&store),
                client,
                Arc::clone(&mirror),
            )
            .with_policy(config.analysis.policy())
            .with_verification_items(config.analysis.verification_items.clone())
            .with_reporter(Arc::new(LogProgress)),
        );
        let autosaver = Autosaver::spawn(
            Arc::clone(&tree),
            Arc::clone(&store),
            config.session.autosave_interval(),
        );

        Ok(Self {
            store,
            tree,
            mirror,
            queue,
            autosaver,
        })
    }

    pub fn tree(&self) -> &Arc<SharedTree> {
        &self.tree
    }

    pub fn queue(&self) -> &Arc<AnalysisQueue> {
        &self.queue
    }

    pub fn mirror(&self) -> &Arc<SyncMirror> {
        &self.mirror
    }

    pub fn store(&self) -> &Arc<dyn LocalStore> {
        &self.store
    }

    /// Merge picked files into the current project.
    pub fn import(&self, entries: impl IntoIterator<Item = ImportEntry>) -> usize {
        let imported = self.tree.import(entries);
        info!(imported, "files imported");
        imported
    }

    /// Queue every folder with direct images and run the queue.
    pub async fn analyze_all(&self) -> QueueStats {
        let paths = self.tree.snapshot().analyzable_folder_paths();
        self.queue.enqueue(paths);
        self.queue.run().await
    }

    /// Report connectivity changes to the sync mirror.
    pub async fn set_online(&self, online: bool) -> DrainReport {
        self.mirror.set_online(online).await
    }

    /// Start over: empty tree, no stored session, no cached verdicts.
    pub async fn reset_project(&self) -> Result<()> {
        self.queue.cancel();
        self.tree.replace(ProjectTree::new());
        reset_local_state(self.store.as_ref()).await?;
        info!("project reset");
        Ok(())
    }

    /// Persist the tree immediately.
    pub async fn save(&self) -> Result<bool> {
        save_now(&self.tree, self.store.as_ref()).await
    }

    /// Stop autosaving and write a final snapshot.
    pub async fn close(self) -> Result<()> {
        self.autosaver.stop().await;
        save_now(&self.tree, self.store.as_ref()).await?;
        Ok(())
    }
}
