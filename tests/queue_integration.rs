//! End-to-end tests of the analysis queue against a scripted model.

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;

use common::{client, completed_json, photo, FakeTransport};
use field_audit::progress::{ChannelProgress, QueueProgressEvent};
use field_audit::queue::{AnalysisQueue, JobPhase, CANCELLED_REASON, MAX_CONCURRENT_ANALYSES};
use field_audit::state::SharedTree;
use field_audit::sync::{HistoryRemote, SyncMirror};
use field_audit::transport::TransportError;
use field_audit_core::models::{FolderStatus, ImportEntry, SyncQueueItem};
use field_audit_core::store::memory::InMemoryStore;
use field_audit_core::store::LocalStore;

struct Harness {
    tree: Arc<SharedTree>,
    store: Arc<InMemoryStore>,
    transport: Arc<FakeTransport>,
    queue: Arc<AnalysisQueue>,
}

fn harness(entries: Vec<ImportEntry>, transport: FakeTransport) -> Harness {
    let store = Arc::new(InMemoryStore::new());
    let mirror = Arc::new(SyncMirror::disabled(store.clone()));
    harness_with_mirror(entries, transport, store, mirror)
}

fn harness_with_mirror(
    entries: Vec<ImportEntry>,
    transport: FakeTransport,
    store: Arc<InMemoryStore>,
    mirror: Arc<SyncMirror>,
) -> Harness {
    let tree = Arc::new(SharedTree::default());
    tree.import(entries);
    let transport = Arc::new(transport);
    let queue = Arc::new(AnalysisQueue::new(
        tree.clone(),
        store.clone(),
        client(transport.clone()),
        mirror,
    ));
    Harness {
        tree,
        store,
        transport,
        queue,
    }
}

fn rua_x() -> Vec<ImportEntry> {
    vec![photo("123 Rua X/a.jpg", 1), photo("123 Rua X/b.jpg", 2)]
}

fn many_sites(n: usize) -> Vec<ImportEntry> {
    (0..n)
        .map(|i| photo(&format!("obra/site-{}/p.jpg", i), i as u8))
        .collect()
}

#[tokio::test]
async fn analyzes_folder_and_flags_selected_images() {
    let h = harness(
        rua_x(),
        FakeTransport::answering(completed_json(&["a.jpg"], "meter visible")),
    );
    h.queue.enqueue(["123 Rua X"]);
    let stats = h.queue.run().await;

    assert_eq!(stats.remote_calls, 1);
    assert_eq!(stats.processed, 1);
    let folder = h.tree.find_folder("123 Rua X").unwrap();
    assert_eq!(folder.status, FolderStatus::Completed);
    assert_eq!(folder.last_analysis_summary, "meter visible");
    assert!(h.tree.find_file("123 Rua X/a.jpg").unwrap().selected_by_ai);
    assert!(!h.tree.find_file("123 Rua X/b.jpg").unwrap().selected_by_ai);
    assert_eq!(h.store.cache_len(), 1);
    assert_eq!(h.queue.job_phase("123 Rua X"), Some(JobPhase::Done));
}

#[tokio::test]
async fn unchanged_folder_is_answered_from_cache() {
    let h = harness(
        rua_x(),
        FakeTransport::answering(completed_json(&["a.jpg"], "ok")),
    );
    h.queue.enqueue(["123 Rua X"]);
    h.queue.run().await;

    // Already COMPLETED: plain enqueue skips it.
    assert_eq!(h.queue.enqueue(["123 Rua X"]), 0);

    h.queue.enqueue_forced(["123 Rua X"]);
    let stats = h.queue.run().await;

    assert_eq!(h.transport.calls(), 1);
    assert_eq!(stats.cache_hits, 1);
    let folder = h.tree.find_folder("123 Rua X").unwrap();
    assert!(folder.last_ai_result.as_ref().unwrap().from_cache);
    assert_eq!(folder.status, FolderStatus::Completed);
}

#[tokio::test]
async fn changed_image_invalidates_cache() {
    let h = harness(
        rua_x(),
        FakeTransport::answering(completed_json(&["a.jpg"], "ok")),
    );
    h.queue.enqueue(["123 Rua X"]);
    h.queue.run().await;

    h.tree.import(vec![photo("123 Rua X/a.jpg", 99)]);
    h.queue.enqueue_forced(["123 Rua X"]);
    h.queue.run().await;

    assert_eq!(h.transport.calls(), 2);
    assert_eq!(h.store.cache_len(), 2);
}

#[tokio::test(start_paused = true)]
async fn never_more_than_three_calls_in_flight() {
    let h = harness(
        many_sites(8),
        FakeTransport::answering(completed_json(&["p.jpg"], "ok"))
            .with_latency(Duration::from_secs(1)),
    );
    let paths = h.tree.snapshot().analyzable_folder_paths();
    assert_eq!(h.queue.enqueue(paths), 8);

    let stats = h.queue.run().await;
    assert_eq!(h.transport.calls(), 8);
    assert_eq!(h.transport.peak(), MAX_CONCURRENT_ANALYSES);
    assert_eq!(stats.processed, 8);
    assert_eq!(stats.in_flight, 0);
    assert_eq!(stats.queued, 0);
}

#[tokio::test]
async fn cancel_stops_admission_and_caches_nothing() {
    let h = harness(many_sites(5), FakeTransport::hanging());
    let paths = h.tree.snapshot().analyzable_folder_paths();
    h.queue.enqueue(paths.clone());

    let queue = h.queue.clone();
    let run = tokio::spawn(async move { queue.run().await });
    while h.transport.in_flight() < MAX_CONCURRENT_ANALYSES {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    h.queue.cancel();
    let stats = run.await.unwrap();

    assert_eq!(h.transport.calls(), MAX_CONCURRENT_ANALYSES);
    assert_eq!(stats.cancelled, 5);
    assert_eq!(h.store.cache_len(), 0);

    let mut started = 0;
    for path in &paths {
        let folder = h.tree.find_folder(path).unwrap();
        assert_eq!(h.queue.job_phase(path), Some(JobPhase::Cancelled));
        match folder.status {
            FolderStatus::Pending => {
                assert_eq!(folder.last_analysis_summary, CANCELLED_REASON);
                started += 1;
            }
            other => assert_eq!(other, FolderStatus::Unanalyzed),
        }
    }
    assert_eq!(started, MAX_CONCURRENT_ANALYSES);
    assert!(!h.queue.is_running());
}

#[tokio::test(start_paused = true)]
async fn overload_retries_with_doubling_backoff() {
    let mut transport = FakeTransport::answering(completed_json(&["a.jpg"], "ok"));
    for _ in 0..4 {
        transport = transport.then(Err(TransportError::Overloaded("503".into())));
    }
    let h = harness(rua_x(), transport);
    h.queue.enqueue(["123 Rua X"]);
    h.queue.run().await;

    assert_eq!(h.transport.calls(), 5);
    let times = h.transport.call_times();
    let gaps: Vec<u64> = times.windows(2).map(|w| (w[1] - w[0]).as_secs()).collect();
    assert_eq!(gaps, vec![8, 16, 32, 64]);
    assert_eq!(
        h.tree.find_folder("123 Rua X").unwrap().status,
        FolderStatus::Completed
    );
}

#[tokio::test(start_paused = true)]
async fn exhausted_retries_mark_error_without_caching() {
    let mut transport = FakeTransport::answering(completed_json(&["a.jpg"], "ok"));
    for _ in 0..6 {
        transport = transport.then(Err(TransportError::EmptyResponse));
    }
    let h = harness(rua_x(), transport);
    h.queue.enqueue(["123 Rua X"]);
    let stats = h.queue.run().await;

    assert_eq!(h.transport.calls(), 6);
    assert_eq!(stats.failed, 1);
    assert_eq!(h.store.cache_len(), 0);
    let folder = h.tree.find_folder("123 Rua X").unwrap();
    assert_eq!(folder.status, FolderStatus::Error);
    assert!(folder.last_analysis_summary.contains("gave up"));
}

#[tokio::test(start_paused = true)]
async fn cancel_during_backoff_returns_without_another_call() {
    let transport = FakeTransport::answering(completed_json(&["a.jpg"], "ok"))
        .then(Err(TransportError::Overloaded("503".into())));
    let h = harness(rua_x(), transport);
    h.queue.enqueue(["123 Rua X"]);

    let start = tokio::time::Instant::now();
    let queue = h.queue.clone();
    let run = tokio::spawn(async move { queue.run().await });
    while h.transport.calls() < 1 {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    tokio::time::sleep(Duration::from_secs(1)).await;
    h.queue.cancel();
    let stats = run.await.unwrap();

    assert!(start.elapsed() < Duration::from_secs(8));
    assert_eq!(h.transport.calls(), 1);
    assert_eq!(stats.cancelled, 1);
    assert_eq!(h.store.cache_len(), 0);
    let folder = h.tree.find_folder("123 Rua X").unwrap();
    assert_eq!(folder.status, FolderStatus::Pending);
    assert_eq!(folder.last_analysis_summary, CANCELLED_REASON);
}

#[tokio::test]
async fn answer_after_cancel_is_discarded() {
    let h = harness(
        rua_x(),
        FakeTransport::answering(completed_json(&["a.jpg"], "meter visible")),
    );
    let queue = Arc::downgrade(&h.queue);
    h.transport.on_answer(move || {
        if let Some(queue) = queue.upgrade() {
            queue.cancel();
        }
    });

    h.queue.enqueue(["123 Rua X"]);
    h.queue.run().await;

    assert_eq!(h.transport.calls(), 1);
    assert_eq!(h.store.cache_len(), 0);
    assert_eq!(h.queue.job_phase("123 Rua X"), Some(JobPhase::Cancelled));
    let folder = h.tree.find_folder("123 Rua X").unwrap();
    assert_eq!(folder.status, FolderStatus::Pending);
    assert_eq!(folder.last_analysis_summary, CANCELLED_REASON);
    assert!(!h.tree.find_file("123 Rua X/a.jpg").unwrap().selected_by_ai);
}

#[tokio::test]
async fn rejected_request_is_not_retried() {
    let transport = FakeTransport::answering(completed_json(&[], "ok")).then(Err(
        TransportError::Rejected {
            status: 401,
            message: "bad key".into(),
        },
    ));
    let h = harness(rua_x(), transport);
    h.queue.enqueue(["123 Rua X"]);
    h.queue.run().await;

    assert_eq!(h.transport.calls(), 1);
    assert_eq!(
        h.tree.find_folder("123 Rua X").unwrap().status,
        FolderStatus::Error
    );
}

#[tokio::test]
async fn low_confidence_check_downgrades_to_pending() {
    let answer = serde_json::json!({
        "status": "COMPLETED",
        "selectedFiles": ["a.jpg"],
        "reason": "panel visible",
        "checks": [{ "name": "electrical_panel", "confidence": 0.4 }],
    })
    .to_string();
    let h = harness(rua_x(), FakeTransport::answering(answer));
    h.queue.enqueue(["123 Rua X"]);
    h.queue.run().await;

    let folder = h.tree.find_folder("123 Rua X").unwrap();
    assert_eq!(folder.status, FolderStatus::Pending);
    assert!(folder.last_ai_result.as_ref().unwrap().verdict.is_completed());
}

#[tokio::test]
async fn folder_without_images_is_pending_without_a_call() {
    let h = harness(
        vec![ImportEntry::new("site/notes.txt", b"hello".to_vec(), "text/plain", 0)],
        FakeTransport::answering(completed_json(&[], "ok")),
    );
    h.queue.enqueue(["site"]);
    h.queue.run().await;

    assert_eq!(h.transport.calls(), 0);
    let folder = h.tree.find_folder("site").unwrap();
    assert_eq!(folder.status, FolderStatus::Pending);
    assert_eq!(folder.last_analysis_summary, "no images in folder");
}

#[tokio::test]
async fn folder_removed_mid_flight_is_dropped() {
    let h = harness(
        rua_x(),
        FakeTransport::answering(completed_json(&["a.jpg"], "ok"))
            .with_latency(Duration::from_millis(200)),
    );
    h.queue.enqueue(["123 Rua X"]);

    let queue = h.queue.clone();
    let run = tokio::spawn(async move { queue.run().await });
    while h.transport.in_flight() == 0 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    h.tree.update(|tree| tree.remove("123 Rua X"));
    let stats = run.await.unwrap();

    assert_eq!(stats.dropped, 1);
    assert_eq!(h.store.cache_len(), 0);
    assert!(h.tree.find_folder("123 Rua X").is_none());
}

struct RecordingRemote {
    rows: Mutex<Vec<serde_json::Value>>,
}

#[async_trait]
impl HistoryRemote for RecordingRemote {
    async fn upsert(&self, user_id: &str, item: &SyncQueueItem) -> Result<()> {
        if user_id.is_empty() {
            bail!("no user");
        }
        self.rows
            .lock()
            .unwrap()
            .push(field_audit::sync::history_row(user_id, item));
        Ok(())
    }
}

#[tokio::test]
async fn fresh_results_are_mirrored_but_cache_hits_are_not() {
    let store = Arc::new(InMemoryStore::new());
    let remote = Arc::new(RecordingRemote {
        rows: Mutex::new(Vec::new()),
    });
    let mirror = Arc::new(SyncMirror::new(store.clone(), remote.clone(), "inspector-7"));
    let h = harness_with_mirror(
        rua_x(),
        FakeTransport::answering(completed_json(&["a.jpg"], "meter visible")),
        store,
        mirror.clone(),
    );

    h.queue.enqueue(["123 Rua X"]);
    h.queue.run().await;
    h.queue.enqueue_forced(["123 Rua X"]);
    h.queue.run().await;
    // Delivery runs in the background; a second drain waits for it.
    mirror.drain_queue().await;

    let rows = remote.rows.lock().unwrap().clone();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["folder_name"], "123 Rua X");
    assert_eq!(rows[0]["user_id"], "inspector-7");
    assert_eq!(rows[0]["status"], "COMPLETED");
    assert_eq!(rows[0]["selected_files"][0], "a.jpg");
    assert!(h.store.list_sync_queue().await.unwrap().is_empty());
}

/// Remote that takes a while to accept each row.
struct SlowRemote {
    delay: Duration,
}

#[async_trait]
impl HistoryRemote for SlowRemote {
    async fn upsert(&self, _user_id: &str, _item: &SyncQueueItem) -> Result<()> {
        tokio::time::sleep(self.delay).await;
        Ok(())
    }
}

#[tokio::test]
async fn folder_enqueued_while_history_is_delivered_still_runs() {
    let store = Arc::new(InMemoryStore::new());
    let remote = Arc::new(SlowRemote {
        delay: Duration::from_millis(500),
    });
    let mirror = Arc::new(SyncMirror::new(store.clone(), remote, "inspector-7"));
    let tree = Arc::new(SharedTree::default());
    tree.import(vec![photo("site-a/p.jpg", 1), photo("site-b/p.jpg", 2)]);
    let transport = Arc::new(FakeTransport::answering(completed_json(&["p.jpg"], "ok")));
    let (progress, mut events) = ChannelProgress::new();
    let queue = Arc::new(
        AnalysisQueue::new(tree.clone(), store.clone(), client(transport.clone()), mirror)
            .with_reporter(Arc::new(progress)),
    );

    queue.enqueue(["site-a"]);
    let first = {
        let queue = queue.clone();
        tokio::spawn(async move { queue.run().await })
    };
    while let Some(event) = events.recv().await {
        if matches!(&event, QueueProgressEvent::JobFinished { path, .. } if path == "site-a") {
            break;
        }
    }

    queue.enqueue(["site-b"]);
    queue.run().await;
    first.await.unwrap();

    assert_eq!(transport.calls(), 2);
    assert_eq!(
        tree.find_folder("site-b").unwrap().status,
        FolderStatus::Completed
    );
    assert!(!queue.is_running());
}

#[tokio::test]
async fn verification_items_reach_the_prompt() {
    let h = harness(
        rua_x(),
        FakeTransport::answering(completed_json(&[], "ok")),
    );
    h.queue
        .set_verification_items(vec!["electrical_panel".into(), "meter".into()]);
    h.queue.enqueue(["123 Rua X"]);
    h.queue.run().await;

    let prompt = &h.transport.prompts()[0];
    assert!(prompt.contains("electrical_panel"));
    assert!(prompt.contains("meter"));
}
