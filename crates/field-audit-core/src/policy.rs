//! Mapping from a verdict to the folder status shown to the user.

use serde::{Deserialize, Serialize};

use crate::models::{FolderStatus, Verdict, VerdictStatus};

/// Default minimum confidence a sub-check needs for a COMPLETED verdict to
/// stand. A tunable policy value, not a property of the domain.
pub const DEFAULT_MIN_CONFIDENCE: f32 = 0.6;

/// Decides the final [`FolderStatus`] for a verdict.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VerdictPolicy {
    pub min_confidence: f32,
}

impl Default for VerdictPolicy {
    fn default() -> Self {
        Self {
            min_confidence: DEFAULT_MIN_CONFIDENCE,
        }
    }
}

impl VerdictPolicy {
    pub fn new(min_confidence: f32) -> Self {
        Self { min_confidence }
    }

    /// COMPLETED only when the verdict says so and every attached sub-check
    /// reaches `min_confidence`; PENDING otherwise.
    pub fn resolve(&self, verdict: &Verdict) -> FolderStatus {
        match verdict.status {
            VerdictStatus::Completed if self.checks_pass(verdict) => FolderStatus::Completed,
            _ => FolderStatus::Pending,
        }
    }

    fn checks_pass(&self, verdict: &Verdict) -> bool {
        verdict
            .checks
            .iter()
            .all(|check| check.confidence >= self.min_confidence)
    }
}
