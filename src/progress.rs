//! Analysis queue progress reporting.
//!
//! The queue emits a [`QueueProgressEvent`] when a folder job starts, when
//! it reaches a terminal phase, and when a run ends. Reporters decide what to
//! do with them: nothing, a log line, or forwarding to a UI channel.

use tokio::sync::mpsc;
use tracing::{debug, info};

use field_audit_core::models::FolderStatus;

use crate::queue::{JobPhase, QueueStats};

/// A single progress event.
#[derive(Clone, Debug, PartialEq)]
pub enum QueueProgressEvent {
    /// The folder was found and marked PROCESSING.
    JobStarted { path: String },
    /// The job reached a terminal phase.
    JobFinished {
        path: String,
        phase: JobPhase,
        status: Option<FolderStatus>,
    },
    /// `run()` returned.
    RunFinished { stats: QueueStats },
}

/// Receives queue progress. Called from folder jobs; must not block.
pub trait ProgressReporter: Send + Sync {
    fn report(&self, event: QueueProgressEvent);
}

/// No-op reporter.
pub struct NoProgress;

impl ProgressReporter for NoProgress {
    fn report(&self, _event: QueueProgressEvent) {}
}

/// Writes progress through `tracing`: "analysis  1,234 / 5,000 folders".
pub struct LogProgress;

impl ProgressReporter for LogProgress {
    fn report(&self, event: QueueProgressEvent) {
        match &event {
            QueueProgressEvent::JobStarted { path } => debug!(path = %path, "analysis started"),
            QueueProgressEvent::JobFinished {
                path,
                phase,
                status,
            } => debug!(path = %path, ?phase, ?status, "analysis finished"),
            QueueProgressEvent::RunFinished { stats } => info!(
                cache_hits = stats.cache_hits,
                remote_calls = stats.remote_calls,
                failed = stats.failed,
                cancelled = stats.cancelled,
                "analysis  {} folders processed",
                format_number(stats.processed)
            ),
        }
    }
}

/// Forwards events to an unbounded channel, for UIs that poll.
pub struct ChannelProgress {
    tx: mpsc::UnboundedSender<QueueProgressEvent>,
}

impl ChannelProgress {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<QueueProgressEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl ProgressReporter for ChannelProgress {
    fn report(&self, event: QueueProgressEvent) {
        // A dropped receiver just means nobody is listening anymore.
        let _ = self.tx.send(event);
    }
}

fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    let chars: Vec<char> = s.chars().rev().collect();
    for (i, c) in chars.iter().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(*c);
    }
    result.chars().rev().collect()
}
