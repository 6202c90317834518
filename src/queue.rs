//! Bounded-concurrency analysis queue.
//!
//! Folder paths are enqueued, then [`AnalysisQueue::run`] drains them with at
//! most [`MAX_CONCURRENT_ANALYSES`] folder jobs in flight. Each job:
//!
//! 1. Resolves the folder in the current tree (gone → silently dropped).
//! 2. Marks it PROCESSING.
//! 3. Fingerprints its direct images on the blocking pool.
//! 4. On a cache hit, applies the cached verdict and stops.
//! 5. Otherwise calls the [`AnalysisClient`].
//! 6. Applies the verdict through the [`VerdictPolicy`] and flags the
//!    selected images.
//! 7. Stores the verdict in the cache.
//! 8. Writes a history record to the [`SyncMirror`]'s local queue; remote
//!    delivery happens in the background.
//!
//! Cancellation stops admission of new jobs; queued paths that never started
//! are dropped and in-flight jobs finish as PENDING `"cancelled"`. Failed and
//! cancelled analyses are never cached.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use anyhow::Result;
use chrono::Utc;
use serde::Serialize;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use field_audit_core::fingerprint::fingerprint;
use field_audit_core::models::{AiResult, CacheEntry, FolderNode, FolderStatus, Node, Verdict};
use field_audit_core::policy::VerdictPolicy;
use field_audit_core::store::LocalStore;

use crate::analysis::{AnalysisClient, AnalysisOutcome, AnalysisRequest};
use crate::cancel::CancelSignal;
use crate::progress::{NoProgress, ProgressReporter, QueueProgressEvent};
use crate::state::SharedTree;
use crate::sync::SyncMirror;

/// Upper bound on folder jobs running at once.
pub const MAX_CONCURRENT_ANALYSES: usize = 3;

/// Summary recorded on folders whose job was cancelled.
pub const CANCELLED_REASON: &str = "cancelled";

/// Where a folder job currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobPhase {
    Queued,
    Fingerprinting,
    CacheLookup,
    Calling,
    Applying,
    /// Verdict applied, from the cache or the remote model.
    Done,
    /// Remote call failed; folder marked ERROR.
    Failed,
    Cancelled,
    /// Folder no longer existed when the job ran.
    Dropped,
}

impl JobPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobPhase::Done | JobPhase::Failed | JobPhase::Cancelled | JobPhase::Dropped
        )
    }
}

/// Counters for the lifetime of the queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    /// Paths waiting to start.
    pub queued: usize,
    /// Jobs currently running.
    pub in_flight: usize,
    /// Jobs that reached a terminal phase.
    pub processed: u64,
    pub cache_hits: u64,
    pub remote_calls: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub dropped: u64,
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<String>,
    queued: HashSet<String>,
    active: HashSet<String>,
    phases: HashMap<String, JobPhase>,
    stats: QueueStats,
    cancel: CancelSignal,
    running: bool,
}

impl QueueState {
    fn snapshot(&self) -> QueueStats {
        QueueStats {
            queued: self.pending.len(),
            in_flight: self.active.len(),
            ..self.stats
        }
    }

    fn abandon_pending(&mut self) -> usize {
        let abandoned = self.pending.len();
        for path in self.pending.drain(..) {
            self.phases.insert(path, JobPhase::Cancelled);
            self.stats.cancelled += 1;
        }
        self.queued.clear();
        abandoned
    }
}

/// Clears a job's bookkeeping however the job ends.
struct JobGuard<'a> {
    queue: &'a AnalysisQueue,
    path: String,
}

impl Drop for JobGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.queue.lock_state();
        state.active.remove(&self.path);
        state.stats.processed += 1;
        if !state.phases.get(&self.path).is_some_and(JobPhase::is_terminal) {
            state.phases.insert(self.path.clone(), JobPhase::Failed);
            state.stats.failed += 1;
        }
    }
}

pub struct AnalysisQueue {
    tree: Arc<SharedTree>,
    store: Arc<dyn LocalStore>,
    client: Arc<AnalysisClient>,
    mirror: Arc<SyncMirror>,
    policy: VerdictPolicy,
    verification_items: RwLock<Vec<String>>,
    reporter: Arc<dyn ProgressReporter>,
    semaphore: Arc<Semaphore>,
    state: Mutex<QueueState>,
}

impl AnalysisQueue {
    pub fn new(
        tree: Arc<SharedTree>,
        store: Arc<dyn LocalStore>,
        client: Arc<AnalysisClient>,
        mirror: Arc<SyncMirror>,
    ) -> Self {
        Self {
            tree,
            store,
            client,
            mirror,
            policy: VerdictPolicy::default(),
            verification_items: RwLock::new(Vec::new()),
            reporter: Arc::new(NoProgress),
            semaphore: Arc::new(Semaphore::new(MAX_CONCURRENT_ANALYSES)),
            state: Mutex::new(QueueState::default()),
        }
    }

    pub fn with_policy(mut self, policy: VerdictPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn ProgressReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn with_verification_items(self, items: Vec<String>) -> Self {
        self.set_verification_items(items);
        self
    }

    /// Checklist sent with every subsequent analysis request.
    pub fn set_verification_items(&self, items: Vec<String>) {
        *self
            .verification_items
            .write()
            .unwrap_or_else(PoisonError::into_inner) = items;
    }

    pub fn verification_items(&self) -> Vec<String> {
        self.verification_items
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Queue folders for analysis, skipping paths already queued or running
    /// and folders already COMPLETED. Returns how many were added.
    pub fn enqueue<I, S>(&self, paths: I) -> usize
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.admit(paths, false)
    }

    /// Like [`enqueue`](Self::enqueue) but re-admits COMPLETED folders. The
    /// cache still answers when their images have not changed.
    pub fn enqueue_forced<I, S>(&self, paths: I) -> usize
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.admit(paths, true)
    }

    fn admit<I, S>(&self, paths: I, force: bool) -> usize
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let tree = self.tree.snapshot();
        let mut state = self.lock_state();
        let mut added = 0;
        for path in paths {
            let path = path.into();
            if path.is_empty() || state.queued.contains(&path) || state.active.contains(&path) {
                continue;
            }
            if !force
                && tree
                    .find_folder(&path)
                    .is_some_and(|f| f.status == FolderStatus::Completed)
            {
                continue;
            }
            state.queued.insert(path.clone());
            state.phases.insert(path.clone(), JobPhase::Queued);
            state.pending.push_back(path);
            added += 1;
        }
        if added > 0 {
            debug!(added, queued = state.pending.len(), "folders enqueued");
        }
        added
    }

    /// Drain the queue. Returns once the queue is empty and every admitted
    /// job has finished, or once a cancelled run has wound down. Paths
    /// enqueued while a run is active are drained by that run; a second
    /// concurrent call returns immediately.
    pub async fn run(self: &Arc<Self>) -> QueueStats {
        let cancel = {
            let mut state = self.lock_state();
            if state.running {
                return state.snapshot();
            }
            state.running = true;
            state.cancel.clone()
        };

        loop {
            self.drain(&cancel).await;

            let mut state = self.lock_state();
            if cancel.is_cancelled() {
                state.abandon_pending();
            } else if !state.pending.is_empty() {
                debug!(queued = state.pending.len(), "folders enqueued during wind-down");
                continue;
            }
            state.running = false;
            if cancel.is_cancelled() {
                state.cancel = CancelSignal::new();
            }
            let stats = state.snapshot();
            drop(state);

            self.reporter.report(QueueProgressEvent::RunFinished { stats });
            return stats;
        }
    }

    /// One pass: admit jobs until the queue is empty or cancel is requested,
    /// then wait for every admitted job.
    async fn drain(self: &Arc<Self>, cancel: &CancelSignal) {
        let mut jobs: JoinSet<()> = JoinSet::new();
        loop {
            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                permit = Arc::clone(&self.semaphore).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };
            while let Some(joined) = jobs.try_join_next() {
                log_join_error(joined);
            }
            if cancel.is_cancelled() {
                break;
            }

            match self.start_next() {
                Some(path) => {
                    let queue = Arc::clone(self);
                    let cancel = cancel.clone();
                    jobs.spawn(async move { queue.run_job(path, permit, cancel).await });
                }
                None => {
                    drop(permit);
                    match jobs.join_next().await {
                        Some(joined) => log_join_error(joined),
                        None => break,
                    }
                }
            }
        }

        if cancel.is_cancelled() {
            let abandoned = self.lock_state().abandon_pending();
            if abandoned > 0 {
                info!(abandoned, "analysis cancelled, dropped queued folders");
            }
        }
        while let Some(joined) = jobs.join_next().await {
            log_join_error(joined);
        }
    }

    /// Stop the current run. When idle, clears the queue instead.
    pub fn cancel(&self) {
        let mut state = self.lock_state();
        if state.running {
            state.cancel.cancel();
        } else {
            state.abandon_pending();
        }
    }

    pub fn is_running(&self) -> bool {
        self.lock_state().running
    }

    pub fn stats(&self) -> QueueStats {
        self.lock_state().snapshot()
    }

    /// Last known phase of the job for `path`.
    pub fn job_phase(&self, path: &str) -> Option<JobPhase> {
        self.lock_state().phases.get(path).copied()
    }

    fn start_next(&self) -> Option<String> {
        let mut state = self.lock_state();
        let path = state.pending.pop_front()?;
        state.queued.remove(&path);
        state.active.insert(path.clone());
        Some(path)
    }

    async fn run_job(self: Arc<Self>, path: String, _permit: OwnedSemaphorePermit, cancel: CancelSignal) {
        let _guard = JobGuard {
            queue: &self,
            path: path.clone(),
        };

        let phase = match self.process(&path, &cancel).await {
            Ok(phase) => phase,
            Err(e) => {
                warn!(path = %path, error = %e, "analysis job failed");
                self.mark_failed(&path, &format!("internal error: {}", e));
                JobPhase::Failed
            }
        };
        self.finish(&path, phase);
    }

    async fn process(&self, path: &str, cancel: &CancelSignal) -> Result<JobPhase> {
        let Some(folder) = self.tree.find_folder(path) else {
            debug!(path, "folder gone before analysis, dropping");
            return Ok(JobPhase::Dropped);
        };
        self.tree
            .update_folder(path, |f| f.status = FolderStatus::Processing);
        self.reporter.report(QueueProgressEvent::JobStarted {
            path: path.to_string(),
        });

        if cancel.is_cancelled() {
            return Ok(self.mark_cancelled(path));
        }

        self.set_phase(path, JobPhase::Fingerprinting);
        let hashed = Arc::clone(&folder);
        let fp = tokio::task::spawn_blocking(move || fingerprint(&hashed)).await?;

        self.set_phase(path, JobPhase::CacheLookup);
        if let Some(entry) = self.store.get_cache(path, &fp).await? {
            self.lock_state().stats.cache_hits += 1;
            debug!(path, fingerprint = %fp, "cache hit");
            self.set_phase(path, JobPhase::Applying);
            return Ok(match self.apply_verdict(path, &entry.verdict, true) {
                Some(_) => JobPhase::Done,
                None => JobPhase::Dropped,
            });
        }
        if cancel.is_cancelled() {
            return Ok(self.mark_cancelled(path));
        }

        self.set_phase(path, JobPhase::Calling);
        self.lock_state().stats.remote_calls += 1;
        let request = AnalysisRequest {
            folder_name: folder.name.clone(),
            images: folder.direct_images().cloned().collect(),
            verification_items: self.verification_items(),
            equipment: folder.equipment.clone(),
        };

        let verdict = match self.client.analyze(request, cancel).await {
            AnalysisOutcome::Answered(_) | AnalysisOutcome::Cancelled if cancel.is_cancelled() => {
                return Ok(self.mark_cancelled(path));
            }
            AnalysisOutcome::Cancelled => return Ok(self.mark_cancelled(path)),
            AnalysisOutcome::Failed(verdict) => {
                self.mark_failed(path, &verdict.reason);
                return Ok(JobPhase::Failed);
            }
            AnalysisOutcome::Answered(verdict) => verdict,
        };

        self.set_phase(path, JobPhase::Applying);
        let Some(status) = self.apply_verdict(path, &verdict, false) else {
            debug!(path, "folder removed during analysis, result discarded");
            return Ok(JobPhase::Dropped);
        };

        let entry = CacheEntry {
            folder_path: path.to_string(),
            fingerprint: fp.to_string(),
            verdict: verdict.clone(),
            created_at: Utc::now(),
        };
        if let Err(e) = self.store.put_cache(&entry).await {
            warn!(path, error = %e, "could not cache verdict");
        }

        self.hand_off_history(&folder.name, status, &verdict).await;
        Ok(JobPhase::Done)
    }

    /// Write a verdict onto the folder and its direct images. Returns the
    /// resulting status, or `None` when the folder no longer exists.
    fn apply_verdict(&self, path: &str, verdict: &Verdict, from_cache: bool) -> Option<FolderStatus> {
        let status = self.policy.resolve(verdict);
        self.tree.update_folder(path, |folder| {
            folder.status = status;
            folder.last_analysis_summary = verdict.reason.clone();
            folder.last_observation = verdict.observation.clone().unwrap_or_default();
            folder.last_ai_result = Some(AiResult {
                verdict: verdict.clone(),
                analyzed_at: Utc::now(),
                from_cache,
            });
            for child in folder.children.iter_mut() {
                if let Node::File(file) = child {
                    if !file.is_image() {
                        continue;
                    }
                    let selected = verdict.selected_files.iter().any(|n| *n == file.name);
                    if file.selected_by_ai != selected {
                        Arc::make_mut(file).selected_by_ai = selected;
                    }
                }
            }
            status
        })
    }

    fn mark_cancelled(&self, path: &str) -> JobPhase {
        self.tree.update_folder(path, |folder| {
            clear_ai_result(folder);
            folder.status = FolderStatus::Pending;
            folder.last_analysis_summary = CANCELLED_REASON.to_string();
        });
        JobPhase::Cancelled
    }

    fn mark_failed(&self, path: &str, reason: &str) {
        self.tree.update_folder(path, |folder| {
            clear_ai_result(folder);
            folder.status = FolderStatus::Error;
            folder.last_analysis_summary = reason.to_string();
        });
    }

    /// Record the result for the history mirror. Only the local queue write
    /// is awaited; delivery runs in the background.
    async fn hand_off_history(&self, folder_name: &str, status: FolderStatus, verdict: &Verdict) {
        if !self.mirror.is_enabled() {
            return;
        }
        let payload = serde_json::json!({
            "status": status.as_str(),
            "summary": verdict.reason,
            "observation": verdict.observation,
            "selected_files": verdict.selected_files,
        });
        if let Err(e) = self.mirror.enqueue_detached(folder_name, payload).await {
            warn!(folder = %folder_name, error = %e, "could not queue history record");
        }
    }

    fn finish(&self, path: &str, phase: JobPhase) {
        {
            let mut state = self.lock_state();
            state.phases.insert(path.to_string(), phase);
            match phase {
                JobPhase::Failed => state.stats.failed += 1,
                JobPhase::Cancelled => state.stats.cancelled += 1,
                JobPhase::Dropped => state.stats.dropped += 1,
                _ => {}
            }
        }
        let status = self.tree.find_folder(path).map(|f| f.status);
        self.reporter.report(QueueProgressEvent::JobFinished {
            path: path.to_string(),
            phase,
            status,
        });
    }

    fn set_phase(&self, path: &str, phase: JobPhase) {
        self.lock_state().phases.insert(path.to_string(), phase);
    }

    fn lock_state(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Forget the previous AI verdict and its evidence flags. A human override
/// is kept.
fn clear_ai_result(folder: &mut FolderNode) {
    folder.last_ai_result = None;
    folder.last_observation.clear();
    for child in folder.children.iter_mut() {
        if let Node::File(file) = child {
            if file.is_image() && file.selected_by_ai {
                Arc::make_mut(file).selected_by_ai = false;
            }
        }
    }
}

fn log_join_error(joined: std::result::Result<(), tokio::task::JoinError>) {
    if let Err(e) = joined {
        warn!(error = %e, "analysis task panicked");
    }
}
