//! Per-session state container for the project tree.
//!
//! [`SharedTree`] replaces process-wide mutable state: the application
//! creates one per session and hands an `Arc` of it to the queue, the
//! autosaver, and its UI. Every mutation bumps a revision counter that UIs
//! can watch.
//!
//! Readers get cheap [`ProjectTree`] clones. Because the tree is
//! copy-on-write, a clone taken before an update never changes underneath
//! its holder.

use std::sync::{Arc, PoisonError, RwLock};

use tokio::sync::watch;

use field_audit_core::models::{FolderNode, ImportEntry, LeafFile};
use field_audit_core::tree::ProjectTree;

pub struct SharedTree {
    tree: RwLock<ProjectTree>,
    revision: watch::Sender<u64>,
}

impl Default for SharedTree {
    fn default() -> Self {
        Self::new(ProjectTree::new())
    }
}

impl SharedTree {
    pub fn new(tree: ProjectTree) -> Self {
        let (revision, _) = watch::channel(0);
        Self {
            tree: RwLock::new(tree),
            revision,
        }
    }

    /// Current tree. Later updates are not visible through the returned value.
    pub fn snapshot(&self) -> ProjectTree {
        self.tree
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn find_folder(&self, path: &str) -> Option<Arc<FolderNode>> {
        self.tree
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .find_folder(path)
    }

    pub fn find_file(&self, path: &str) -> Option<Arc<LeafFile>> {
        self.tree
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .find_file(path)
    }

    /// Mutate the whole tree. Always counts as a change.
    pub fn update<R>(&self, f: impl FnOnce(&mut ProjectTree) -> R) -> R {
        let result = {
            let mut tree = self.tree.write().unwrap_or_else(PoisonError::into_inner);
            f(&mut tree)
        };
        self.bump();
        result
    }

    /// Mutate one folder. Returns `None`, and changes nothing, when the
    /// folder no longer exists.
    pub fn update_folder<R>(&self, path: &str, f: impl FnOnce(&mut FolderNode) -> R) -> Option<R> {
        let result = {
            let mut tree = self.tree.write().unwrap_or_else(PoisonError::into_inner);
            tree.update_folder(path, f)
        };
        if result.is_some() {
            self.bump();
        }
        result
    }

    /// Merge an import listing into the tree.
    pub fn import(&self, entries: impl IntoIterator<Item = ImportEntry>) -> usize {
        self.update(|tree| tree.import(entries))
    }

    /// Swap in a different tree (restore, reset).
    pub fn replace(&self, tree: ProjectTree) {
        self.update(|current| *current = tree);
    }

    pub fn revision(&self) -> u64 {
        *self.revision.borrow()
    }

    /// Receiver that changes whenever the tree does.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.revision.subscribe()
    }

    fn bump(&self) {
        self.revision.send_modify(|r| *r += 1);
    }
}
