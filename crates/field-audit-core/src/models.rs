//! Core data models used throughout field-audit.
//!
//! These types describe the imported folder tree, the verdicts produced by
//! the vision model (or a human reviewer), and the records the local store
//! persists: cache entries, sync queue items, and session snapshots.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::tree::ProjectTree;

/// Version tag written into every persisted session snapshot.
///
/// Bump whenever the serialized shape of [`ProjectTree`] or [`Verdict`]
/// changes. A stored snapshot with a different tag is discarded together
/// with the analysis cache on restore.
pub const SCHEMA_VERSION: u32 = 3;

/// Maximum number of evidence files a verdict may select.
pub const MAX_SELECTED_FILES: usize = 3;

/// Analysis status of a folder as shown to the user.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FolderStatus {
    /// Never analyzed in this project.
    #[default]
    Unanalyzed,
    /// A folder job is currently working on it.
    Processing,
    Completed,
    Pending,
    /// The analysis failed (remote error, retries exhausted, internal error).
    Error,
}

impl FolderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FolderStatus::Unanalyzed => "UNANALYZED",
            FolderStatus::Processing => "PROCESSING",
            FolderStatus::Completed => "COMPLETED",
            FolderStatus::Pending => "PENDING",
            FolderStatus::Error => "ERROR",
        }
    }
}

impl fmt::Display for FolderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status reported by a verdict. The model only ever answers one of these two.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VerdictStatus {
    Completed,
    Pending,
}

/// A confidence-bearing sub-result attached to a verdict
/// (e.g. the electrical-panel check).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubCheck {
    pub name: String,
    /// Model confidence in `[0.0, 1.0]`.
    pub confidence: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

/// Structured outcome of analyzing one folder.
///
/// Produced by the analysis client or by a human override. Once attached to
/// a [`FolderNode`] it is never mutated, only replaced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Verdict {
    pub status: VerdictStatus,
    /// File names (not paths) chosen as evidence; at most [`MAX_SELECTED_FILES`].
    #[serde(default)]
    pub selected_files: Vec<String>,
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observation: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub checks: Vec<SubCheck>,
}

impl Verdict {
    /// Build a verdict, truncating the evidence list to [`MAX_SELECTED_FILES`].
    pub fn new(
        status: VerdictStatus,
        mut selected_files: Vec<String>,
        reason: impl Into<String>,
        observation: Option<String>,
    ) -> Self {
        selected_files.truncate(MAX_SELECTED_FILES);
        Self {
            status,
            selected_files,
            reason: reason.into(),
            observation,
            checks: Vec::new(),
        }
    }

    /// A PENDING verdict carrying a diagnostic reason and no evidence.
    pub fn pending(reason: impl Into<String>) -> Self {
        Self::new(VerdictStatus::Pending, Vec::new(), reason, None)
    }

    pub fn with_checks(mut self, checks: Vec<SubCheck>) -> Self {
        self.checks = checks;
        self
    }

    pub fn is_completed(&self) -> bool {
        self.status == VerdictStatus::Completed
    }
}

/// The last AI verdict applied to a folder, with the time it was produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AiResult {
    pub verdict: Verdict,
    pub analyzed_at: DateTime<Utc>,
    /// True when the verdict was reused from the local cache.
    #[serde(default)]
    pub from_cache: bool,
}

/// Optional enrichment describing the equipment photographed in a folder.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EquipmentMetadata {
    pub equipment_type: Option<String>,
    pub manufacturer: Option<String>,
    pub model: Option<String>,
    pub serial_number: Option<String>,
    pub notes: Option<String>,
}

impl EquipmentMetadata {
    /// One-line human description, or `None` when every field is empty.
    pub fn describe(&self) -> Option<String> {
        let parts: Vec<String> = [
            ("type", &self.equipment_type),
            ("manufacturer", &self.manufacturer),
            ("model", &self.model),
            ("serial", &self.serial_number),
            ("notes", &self.notes),
        ]
        .iter()
        .filter_map(|(label, value)| {
            value
                .as_deref()
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(|v| format!("{}: {}", label, v))
        })
        .collect();

        if parts.is_empty() {
            None
        } else {
            Some(parts.join("; "))
        }
    }
}

/// Kind of a leaf file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileKind {
    Image,
    Other,
}

const IMAGE_EXTENSIONS: &[&str] = &[
    "jpg", "jpeg", "png", "webp", "gif", "bmp", "heic", "heif", "tif", "tiff",
];

impl FileKind {
    /// Classify by mime type, falling back to the extension when the mime
    /// type is empty (drag-and-drop readers often omit it).
    pub fn detect(name: &str, mime_type: &str) -> Self {
        let mime = mime_type.trim();
        if !mime.is_empty() {
            return if mime.starts_with("image/") {
                FileKind::Image
            } else {
                FileKind::Other
            };
        }

        let ext = name
            .rsplit_once('.')
            .map(|(_, ext)| ext.to_ascii_lowercase())
            .unwrap_or_default();
        if IMAGE_EXTENSIONS.contains(&ext.as_str()) {
            FileKind::Image
        } else {
            FileKind::Other
        }
    }
}

/// Shared handle to the bytes of an imported file.
///
/// Cloning is cheap; the bytes are reference counted and never copied.
#[derive(Clone)]
pub struct Blob {
    data: Arc<[u8]>,
    last_modified_ms: i64,
}

impl Blob {
    pub fn new(data: impl Into<Arc<[u8]>>, last_modified_ms: i64) -> Self {
        Self {
            data: data.into(),
            last_modified_ms,
        }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn last_modified_ms(&self) -> i64 {
        self.last_modified_ms
    }
}

impl fmt::Debug for Blob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Blob")
            .field("len", &self.data.len())
            .field("last_modified_ms", &self.last_modified_ms)
            .finish()
    }
}

/// A file in the project tree. Never has children.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeafFile {
    pub path: String,
    pub name: String,
    pub kind: FileKind,
    #[serde(default)]
    pub mime_type: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub last_modified_ms: i64,
    /// Not serialized with the tree; stores persist blob bytes separately.
    #[serde(skip)]
    pub blob: Option<Blob>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_url: Option<String>,
    #[serde(default)]
    pub selected_by_ai: bool,
}

impl LeafFile {
    pub fn is_image(&self) -> bool {
        self.kind == FileKind::Image
    }
}

/// A folder in the project tree. Its `path` is its identity.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FolderNode {
    pub path: String,
    pub name: String,
    #[serde(default)]
    pub children: Vec<Node>,
    #[serde(default)]
    pub status: FolderStatus,
    #[serde(default)]
    pub last_analysis_summary: String,
    #[serde(default)]
    pub last_observation: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_ai_result: Option<AiResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub human_override: Option<Verdict>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub equipment: Option<EquipmentMetadata>,
}

impl FolderNode {
    pub fn new(path: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            name: name.into(),
            ..Default::default()
        }
    }

    /// Direct image children, in tree order. Nested folders are not included.
    pub fn direct_images(&self) -> impl Iterator<Item = &Arc<LeafFile>> {
        self.children.iter().filter_map(|child| match child {
            Node::File(file) if file.is_image() => Some(file),
            _ => None,
        })
    }

    pub fn subfolders(&self) -> impl Iterator<Item = &Arc<FolderNode>> {
        self.children.iter().filter_map(|child| match child {
            Node::Folder(folder) => Some(folder),
            Node::File(_) => None,
        })
    }

    /// The verdict to display: a human override wins over the AI verdict.
    pub fn effective_verdict(&self) -> Option<&Verdict> {
        self.human_override
            .as_ref()
            .or_else(|| self.last_ai_result.as_ref().map(|r| &r.verdict))
    }
}

/// A child of a folder.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Node {
    Folder(Arc<FolderNode>),
    File(Arc<LeafFile>),
}

impl Node {
    pub fn name(&self) -> &str {
        match self {
            Node::Folder(folder) => &folder.name,
            Node::File(file) => &file.name,
        }
    }

    pub fn path(&self) -> &str {
        match self {
            Node::Folder(folder) => &folder.path,
            Node::File(file) => &file.path,
        }
    }
}

/// A cached verdict, keyed by `(folder_path, fingerprint)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    pub folder_path: String,
    pub fingerprint: String,
    pub verdict: Verdict,
    pub created_at: DateTime<Utc>,
}

/// A payload waiting to be mirrored to the remote history log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncQueueItem {
    /// Auto-increment id assigned by the store; FIFO order follows it.
    pub id: i64,
    pub folder_name: String,
    pub payload: serde_json::Value,
    pub enqueued_at: DateTime<Utc>,
}

/// The persisted form of the current project.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectSnapshot {
    pub schema_version: u32,
    pub saved_at: DateTime<Utc>,
    pub tree: ProjectTree,
}

impl ProjectSnapshot {
    /// Snapshot `tree` with the current [`SCHEMA_VERSION`].
    pub fn capture(tree: &ProjectTree) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            saved_at: Utc::now(),
            tree: tree.clone(),
        }
    }
}

/// One file handed over by the directory picker or drag-and-drop reader.
#[derive(Debug, Clone)]
pub struct ImportEntry {
    /// Slash-delimited path relative to the picked directory,
    /// e.g. `"Obra 12/123 Rua X/a.jpg"`.
    pub relative_path: String,
    pub blob: Blob,
    pub mime_type: String,
}

impl ImportEntry {
    pub fn new(
        relative_path: impl Into<String>,
        data: impl Into<Arc<[u8]>>,
        mime_type: impl Into<String>,
        last_modified_ms: i64,
    ) -> Self {
        Self {
            relative_path: relative_path.into(),
            blob: Blob::new(data, last_modified_ms),
            mime_type: mime_type.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verdict_truncates_selected_files() {
        let v = Verdict::new(
            VerdictStatus::Completed,
            vec!["a".into(), "b".into(), "c".into(), "d".into()],
            "ok",
            None,
        );
        assert_eq!(v.selected_files, vec!["a", "b", "c"]);
    }

    #[test]
    fn file_kind_prefers_mime_type() {
        assert_eq!(FileKind::detect("a.jpg", "image/jpeg"), FileKind::Image);
        assert_eq!(FileKind::detect("a.jpg", "application/pdf"), FileKind::Other);
        assert_eq!(FileKind::detect("IMG_01.JPG", ""), FileKind::Image);
        assert_eq!(FileKind::detect("notes.txt", ""), FileKind::Other);
        assert_eq!(FileKind::detect("README", ""), FileKind::Other);
    }

    #[test]
    fn effective_verdict_prefers_override() {
        let mut folder = FolderNode::new("a", "a");
        assert!(folder.effective_verdict().is_none());

        folder.last_ai_result = Some(AiResult {
            verdict: Verdict::pending("missing photos"),
            analyzed_at: Utc::now(),
            from_cache: false,
        });
        assert_eq!(folder.effective_verdict().unwrap().reason, "missing photos");

        folder.human_override = Some(Verdict::new(
            VerdictStatus::Completed,
            vec![],
            "checked on site",
            None,
        ));
        assert_eq!(
            folder.effective_verdict().unwrap().reason,
            "checked on site"
        );
    }

    #[test]
    fn equipment_describe_skips_blank_fields() {
        let eq = EquipmentMetadata {
            equipment_type: Some("inverter".into()),
            model: Some("  ".into()),
            serial_number: Some("SN-1".into()),
            ..Default::default()
        };
        assert_eq!(eq.describe().unwrap(), "type: inverter; serial: SN-1");
        assert!(EquipmentMetadata::default().describe().is_none());
    }

    #[test]
    fn verdict_wire_format_is_camel_case() {
        let v = Verdict::new(
            VerdictStatus::Completed,
            vec!["a.jpg".into()],
            "ok",
            Some("clean install".into()),
        );
        let json = serde_json::to_value(&v).unwrap();
        assert_eq!(json["status"], "COMPLETED");
        assert_eq!(json["selectedFiles"][0], "a.jpg");
        assert_eq!(json["observation"], "clean install");
        assert!(json.get("checks").is_none());
    }
}
