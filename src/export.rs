//! Export per-folder audit results.
//!
//! One [`ExportRow`] per folder that has been analyzed or reviewed. A human
//! override wins over the AI result for status, summary and selected files.
//! Without an override the selection is whatever images are currently
//! flagged, which includes manual toggles.

use std::path::Path;

use anyhow::Result;
use serde::Serialize;

use field_audit_core::models::{FolderNode, FolderStatus, VerdictStatus};
use field_audit_core::tree::ProjectTree;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExportRow {
    pub path: String,
    pub status: FolderStatus,
    pub summary: String,
    pub observation: String,
    pub selected_files: Vec<String>,
    pub overridden: bool,
}

/// Rows for every analyzed or overridden folder, in tree order.
pub fn export_rows(tree: &ProjectTree) -> Vec<ExportRow> {
    tree.folders()
        .iter()
        .filter_map(|folder| export_row(folder))
        .collect()
}

fn export_row(folder: &FolderNode) -> Option<ExportRow> {
    if let Some(verdict) = &folder.human_override {
        let status = match verdict.status {
            VerdictStatus::Completed => FolderStatus::Completed,
            VerdictStatus::Pending => FolderStatus::Pending,
        };
        return Some(ExportRow {
            path: folder.path.clone(),
            status,
            summary: verdict.reason.clone(),
            observation: verdict.observation.clone().unwrap_or_default(),
            selected_files: verdict.selected_files.clone(),
            overridden: true,
        });
    }

    if matches!(
        folder.status,
        FolderStatus::Unanalyzed | FolderStatus::Processing
    ) {
        return None;
    }
    Some(ExportRow {
        path: folder.path.clone(),
        status: folder.status,
        summary: folder.last_analysis_summary.clone(),
        observation: folder.last_observation.clone(),
        selected_files: folder
            .direct_images()
            .filter(|f| f.selected_by_ai)
            .map(|f| f.name.clone())
            .collect(),
        overridden: false,
    })
}

/// Write the rows as pretty JSON to `output`, or stdout when `None`.
pub fn write_export(tree: &ProjectTree, output: Option<&Path>) -> Result<()> {
    let json = serde_json::to_string_pretty(&export_rows(tree))?;
    match output {
        Some(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(path, &json)?;
        }
        None => println!("{}", json),
    }
    Ok(())
}
