//! Session restore and autosave.
//!
//! [`restore_session`] loads the last snapshot. A snapshot tagged with a
//! different [`SCHEMA_VERSION`], or one that no longer decodes, is not
//! migrated: the session and the cache are both discarded and the app starts
//! empty.
//!
//! [`Autosaver`] persists the tree on a fixed interval whenever its revision
//! has moved since the last save.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use field_audit_core::models::{FolderStatus, ProjectSnapshot, SCHEMA_VERSION};
use field_audit_core::store::LocalStore;
use field_audit_core::tree::ProjectTree;

use crate::state::SharedTree;

/// Load the stored project, if any.
///
/// Folders saved mid-analysis come back UNANALYZED.
pub async fn restore_session(store: &dyn LocalStore) -> Result<Option<ProjectTree>> {
    match store.session_version().await? {
        None => return Ok(None),
        Some(version) if version != SCHEMA_VERSION => {
            warn!(
                stored = version,
                current = SCHEMA_VERSION,
                "session schema changed, discarding session and cache"
            );
            reset_local_state(store).await?;
            return Ok(None);
        }
        Some(_) => {}
    }

    let snapshot = match store.get_session().await {
        Ok(Some(snapshot)) => snapshot,
        Ok(None) => return Ok(None),
        Err(e) => {
            warn!(error = %e, "stored session unreadable, discarding session and cache");
            reset_local_state(store).await?;
            return Ok(None);
        }
    };

    let mut tree = snapshot.tree;
    let interrupted: Vec<String> = tree
        .folders()
        .iter()
        .filter(|f| f.status == FolderStatus::Processing)
        .map(|f| f.path.clone())
        .collect();
    for path in &interrupted {
        tree.update_folder(path, |f| f.status = FolderStatus::Unanalyzed);
    }
    debug!(
        saved_at = %snapshot.saved_at,
        interrupted = interrupted.len(),
        "session restored"
    );
    Ok(Some(tree))
}

/// Drop the stored session and every cached verdict.
pub async fn reset_local_state(store: &dyn LocalStore) -> Result<()> {
    store.clear_session().await?;
    store.clear_cache().await?;
    Ok(())
}

/// Save the tree now, unless it is empty.
pub async fn save_now(tree: &SharedTree, store: &dyn LocalStore) -> Result<bool> {
    let current = tree.snapshot();
    if current.is_empty() {
        return Ok(false);
    }
    store.put_session(&ProjectSnapshot::capture(&current)).await?;
    Ok(true)
}

/// Background task persisting the tree on an interval.
pub struct Autosaver {
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl Autosaver {
    pub fn spawn(tree: Arc<SharedTree>, store: Arc<dyn LocalStore>, interval: Duration) -> Self {
        let (stop, mut stopped) = watch::channel(false);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            let mut saved_revision = tree.revision();
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = stopped.changed() => break,
                }
                let revision = tree.revision();
                if revision == saved_revision {
                    continue;
                }
                match save_now(&tree, store.as_ref()).await {
                    Ok(saved) => {
                        saved_revision = revision;
                        if saved {
                            debug!(revision, "session autosaved");
                        }
                    }
                    Err(e) => warn!(error = %e, "autosave failed"),
                }
            }
        });
        Self { stop, handle }
    }

    /// Stop the task and wait for it.
    pub async fn stop(self) {
        let _ = self.stop.send(true);
        if let Err(e) = self.handle.await {
            warn!(error = %e, "autosave task ended abnormally");
        }
    }
}
