//! The in-memory project tree.
//!
//! [`ProjectTree`] is a persistent structure: folders and files are held in
//! `Arc`s and every mutation rebuilds only the path from the changed node up
//! to the root (`Arc::make_mut`). A clone of the tree taken before a
//! mutation keeps seeing the old version, so readers never observe a
//! half-applied update.
//!
//! The root is a virtual folder with an empty path. Every other node's path
//! is `parent.path + "/" + name`, or just `name` directly under the root.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{FileKind, FolderNode, ImportEntry, LeafFile, Node, Verdict};

/// Join a parent path and a child name.
pub fn child_path(parent: &str, name: &str) -> String {
    if parent.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", parent, name)
    }
}

fn segments(path: &str) -> Vec<&str> {
    path.split('/').filter(|s| !s.is_empty()).collect()
}

/// Folder/file tree of one project.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectTree {
    project_id: String,
    root: Arc<FolderNode>,
}

impl Default for ProjectTree {
    fn default() -> Self {
        Self::new()
    }
}

impl ProjectTree {
    pub fn new() -> Self {
        Self {
            project_id: Uuid::new_v4().to_string(),
            root: Arc::new(FolderNode::new("", "")),
        }
    }

    /// Build a fresh tree from an import listing.
    pub fn from_import(entries: impl IntoIterator<Item = ImportEntry>) -> Self {
        let mut tree = Self::new();
        tree.import(entries);
        tree
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    pub fn root(&self) -> &Arc<FolderNode> {
        &self.root
    }

    pub fn is_empty(&self) -> bool {
        self.root.children.is_empty()
    }

    /// Merge files into the tree, creating a folder for every new path
    /// prefix. A file whose path already exists is replaced (new blob,
    /// selection reset). Entries with an empty path are ignored.
    ///
    /// Returns the number of files imported.
    pub fn import(&mut self, entries: impl IntoIterator<Item = ImportEntry>) -> usize {
        let mut imported = 0;
        for entry in entries {
            let segs = segments(&entry.relative_path);
            let Some((name, dirs)) = segs.split_last() else {
                continue;
            };
            let leaf = LeafFile {
                path: String::new(),
                name: name.to_string(),
                kind: FileKind::detect(name, &entry.mime_type),
                mime_type: entry.mime_type.clone(),
                size: entry.blob.len() as u64,
                last_modified_ms: entry.blob.last_modified_ms(),
                blob: Some(entry.blob.clone()),
                display_url: None,
                selected_by_ai: false,
            };
            insert_file(&mut self.root, dirs, leaf);
            imported += 1;
        }
        imported
    }

    /// Find a folder by path. The empty path resolves to the virtual root.
    pub fn find_folder(&self, path: &str) -> Option<Arc<FolderNode>> {
        let mut current = &self.root;
        for seg in segments(path) {
            current = current.subfolders().find(|f| f.name == seg)?;
        }
        Some(Arc::clone(current))
    }

    pub fn find_file(&self, path: &str) -> Option<Arc<LeafFile>> {
        let segs = segments(path);
        let (name, dirs) = segs.split_last()?;
        let folder = self.find_folder(&dirs.join("/"))?;
        folder.children.iter().find_map(|child| match child {
            Node::File(file) if file.name == *name => Some(Arc::clone(file)),
            _ => None,
        })
    }

    /// Apply `f` to the folder at `path`, copying only the nodes on the way
    /// to the root. Returns `None` when the folder does not exist.
    pub fn update_folder<R>(&mut self, path: &str, f: impl FnOnce(&mut FolderNode) -> R) -> Option<R> {
        let segs = segments(path);
        with_folder_mut(&mut self.root, &segs, f)
    }

    /// Apply `f` to the file at `path`. Returns `None` when it does not exist.
    pub fn update_file<R>(&mut self, path: &str, f: impl FnOnce(&mut LeafFile) -> R) -> Option<R> {
        let segs = segments(path);
        let (name, dirs) = segs.split_last()?;
        let name = name.to_string();
        with_folder_mut(&mut self.root, dirs, move |folder| {
            folder.children.iter_mut().find_map(|child| match child {
                Node::File(file) if file.name == name => Some(Arc::make_mut(file)),
                _ => None,
            })
            .map(f)
        })
        .flatten()
    }

    /// Delete a folder (with its subtree) or a file. The root cannot be removed.
    pub fn remove(&mut self, path: &str) -> bool {
        let segs = segments(path);
        let Some((name, dirs)) = segs.split_last() else {
            return false;
        };
        let name = name.to_string();
        with_folder_mut(&mut self.root, dirs, move |folder| {
            let before = folder.children.len();
            folder.children.retain(|child| child.name() != name);
            folder.children.len() != before
        })
        .unwrap_or(false)
    }

    /// Set or clear the human override for a folder.
    pub fn set_human_override(&mut self, path: &str, verdict: Option<Verdict>) -> bool {
        self.update_folder(path, |folder| folder.human_override = verdict)
            .is_some()
    }

    /// Flip a file's `selected_by_ai` flag. Returns the new value.
    pub fn toggle_selected(&mut self, file_path: &str) -> Option<bool> {
        self.update_file(file_path, |file| {
            file.selected_by_ai = !file.selected_by_ai;
            file.selected_by_ai
        })
    }

    /// Every folder except the virtual root, depth-first in tree order.
    pub fn folders(&self) -> Vec<Arc<FolderNode>> {
        let mut out = Vec::new();
        collect_folders(&self.root, &mut out);
        out
    }

    /// Paths of folders holding at least one direct image.
    pub fn analyzable_folder_paths(&self) -> Vec<String> {
        self.folders()
            .into_iter()
            .filter(|f| f.direct_images().next().is_some())
            .map(|f| f.path.clone())
            .collect()
    }

    /// Every leaf file, depth-first.
    pub fn files(&self) -> Vec<Arc<LeafFile>> {
        let mut out = Vec::new();
        collect_files(&self.root, &mut out);
        out
    }
}

fn with_folder_mut<R>(
    node: &mut Arc<FolderNode>,
    segs: &[&str],
    f: impl FnOnce(&mut FolderNode) -> R,
) -> Option<R> {
    match segs.split_first() {
        None => Some(f(Arc::make_mut(node))),
        Some((head, rest)) => {
            let idx = node
                .children
                .iter()
                .position(|c| matches!(c, Node::Folder(child) if child.name == *head))?;
            let folder = Arc::make_mut(node);
            match &mut folder.children[idx] {
                Node::Folder(child) => with_folder_mut(child, rest, f),
                Node::File(_) => None,
            }
        }
    }
}

fn insert_file(node: &mut Arc<FolderNode>, dirs: &[&str], mut leaf: LeafFile) {
    let folder = Arc::make_mut(node);
    match dirs.split_first() {
        None => {
            leaf.path = child_path(&folder.path, &leaf.name);
            let existing = folder
                .children
                .iter()
                .position(|c| matches!(c, Node::File(file) if file.name == leaf.name));
            match existing {
                Some(idx) => folder.children[idx] = Node::File(Arc::new(leaf)),
                None => folder.children.push(Node::File(Arc::new(leaf))),
            }
        }
        Some((head, rest)) => {
            let idx = match folder
                .children
                .iter()
                .position(|c| matches!(c, Node::Folder(child) if child.name == *head))
            {
                Some(idx) => idx,
                None => {
                    let path = child_path(&folder.path, head);
                    folder
                        .children
                        .push(Node::Folder(Arc::new(FolderNode::new(path, *head))));
                    folder.children.len() - 1
                }
            };
            if let Node::Folder(child) = &mut folder.children[idx] {
                insert_file(child, rest, leaf);
            }
        }
    }
}

fn collect_folders(folder: &Arc<FolderNode>, out: &mut Vec<Arc<FolderNode>>) {
    for child in folder.subfolders() {
        out.push(Arc::clone(child));
        collect_folders(child, out);
    }
}

fn collect_files(folder: &FolderNode, out: &mut Vec<Arc<LeafFile>>) {
    for child in &folder.children {
        match child {
            Node::File(file) => out.push(Arc::clone(file)),
            Node::Folder(sub) => collect_files(sub, out),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{FolderStatus, VerdictStatus};

    fn entry(path: &str, bytes: &[u8]) -> ImportEntry {
        ImportEntry::new(path, bytes.to_vec(), "image/jpeg", 1_700_000_000_000)
    }

    fn sample_tree() -> ProjectTree {
        ProjectTree::from_import(vec![
            entry("Obra/123 Rua X/a.jpg", b"aaa"),
            entry("Obra/123 Rua X/b.jpg", b"bbb"),
            entry("Obra/456 Rua Y/c.jpg", b"ccc"),
            ImportEntry::new("Obra/notes.txt", b"hi".to_vec(), "text/plain", 0),
        ])
    }

    #[test]
    fn import_builds_paths_from_prefixes() {
        let tree = sample_tree();
        let folder = tree.find_folder("Obra/123 Rua X").unwrap();
        assert_eq!(folder.name, "123 Rua X");
        assert_eq!(folder.direct_images().count(), 2);

        let file = tree.find_file("Obra/123 Rua X/b.jpg").unwrap();
        assert_eq!(file.path, "Obra/123 Rua X/b.jpg");
        assert_eq!(file.size, 3);

        let notes = tree.find_file("Obra/notes.txt").unwrap();
        assert_eq!(notes.kind, FileKind::Other);
    }

    #[test]
    fn child_paths_follow_parent() {
        let tree = sample_tree();
        for folder in tree.folders() {
            for child in &folder.children {
                assert_eq!(child.path(), child_path(&folder.path, child.name()));
            }
        }
    }

    #[test]
    fn reimport_replaces_file() {
        let mut tree = sample_tree();
        tree.toggle_selected("Obra/123 Rua X/a.jpg");
        tree.import(vec![entry("Obra/123 Rua X/a.jpg", b"new content")]);

        let folder = tree.find_folder("Obra/123 Rua X").unwrap();
        assert_eq!(folder.direct_images().count(), 2);
        let file = tree.find_file("Obra/123 Rua X/a.jpg").unwrap();
        assert_eq!(file.size, 11);
        assert!(!file.selected_by_ai);
    }

    #[test]
    fn update_is_copy_on_write() {
        let mut tree = sample_tree();
        let before = tree.clone();

        tree.update_folder("Obra/123 Rua X", |f| f.status = FolderStatus::Processing)
            .unwrap();

        assert_eq!(
            tree.find_folder("Obra/123 Rua X").unwrap().status,
            FolderStatus::Processing
        );
        assert_eq!(
            before.find_folder("Obra/123 Rua X").unwrap().status,
            FolderStatus::Unanalyzed
        );

        // Untouched sibling subtree is shared, not copied.
        let a = before.find_folder("Obra/456 Rua Y").unwrap();
        let b = tree.find_folder("Obra/456 Rua Y").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn update_missing_folder_returns_none() {
        let mut tree = sample_tree();
        assert!(tree.update_folder("Obra/nope", |_| ()).is_none());
        assert!(tree.update_file("Obra/123 Rua X/zzz.jpg", |_| ()).is_none());
    }

    #[test]
    fn remove_folder_and_file() {
        let mut tree = sample_tree();
        assert!(tree.remove("Obra/456 Rua Y"));
        assert!(tree.find_folder("Obra/456 Rua Y").is_none());
        assert!(tree.remove("Obra/123 Rua X/a.jpg"));
        assert!(tree.find_file("Obra/123 Rua X/a.jpg").is_none());
        assert!(!tree.remove("Obra/456 Rua Y"));
        assert!(!tree.remove(""));
    }

    #[test]
    fn override_and_toggle() {
        let mut tree = sample_tree();
        let verdict = Verdict::new(VerdictStatus::Completed, vec![], "ok by hand", None);
        assert!(tree.set_human_override("Obra/123 Rua X", Some(verdict)));
        assert_eq!(
            tree.find_folder("Obra/123 Rua X")
                .unwrap()
                .effective_verdict()
                .unwrap()
                .reason,
            "ok by hand"
        );

        assert_eq!(tree.toggle_selected("Obra/123 Rua X/a.jpg"), Some(true));
        assert_eq!(tree.toggle_selected("Obra/123 Rua X/a.jpg"), Some(false));
        assert_eq!(tree.toggle_selected("missing.jpg"), None);
    }

    #[test]
    fn analyzable_folders_need_direct_images() {
        let tree = sample_tree();
        let paths = tree.analyzable_folder_paths();
        assert_eq!(paths, vec!["Obra/123 Rua X", "Obra/456 Rua Y"]);
    }

    #[test]
    fn serde_roundtrip_drops_blobs() {
        let tree = sample_tree();
        let json = serde_json::to_string(&tree).unwrap();
        let restored: ProjectTree = serde_json::from_str(&json).unwrap();
        assert_eq!(restored.project_id(), tree.project_id());
        let file = restored.find_file("Obra/123 Rua X/a.jpg").unwrap();
        assert!(file.blob.is_none());
        assert_eq!(file.size, 3);
    }
}
