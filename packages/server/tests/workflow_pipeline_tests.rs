//! End-to-end pipeline tests over the in-memory seams: test progress
//! store, test ledger, test publisher, and real connection registry.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;

use ragline_core::kernel::workflow::{
    ChunkingOutput, ChunkingRequest, ChunkingStage, EmbeddingOutput, EmbeddingRequest,
    EmbeddingStage, ProgressBroadcaster, ProgressManager, ProgressUpdate, RetryPolicy,
    StartWorkflowRequest, TestIdempotencyLedger, TestProgressStore, WorkflowError,
    WorkflowOrchestrator,
};
use ragline_core::kernel::{ConnectionRegistry, TestPublisher};

struct FakeChunker {
    calls: AtomicU32,
    /// Number of leading calls that fail before one succeeds.
    failures: u32,
    chunks: i64,
}

impl FakeChunker {
    fn reliable(chunks: i64) -> Self {
        Self {
            calls: AtomicU32::new(0),
            failures: 0,
            chunks,
        }
    }

    fn failing_first(failures: u32, chunks: i64) -> Self {
        Self {
            calls: AtomicU32::new(0),
            failures,
            chunks,
        }
    }
}

#[async_trait]
impl ChunkingStage for FakeChunker {
    async fn run(&self, request: ChunkingRequest) -> Result<ChunkingOutput> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.failures {
            anyhow::bail!("chunk store unavailable (attempt {})", call + 1);
        }
        Ok(ChunkingOutput {
            project_id: request.project_id,
            do_reset: request.do_reset,
            workflow_id: request.workflow_id,
            inserted_chunks: self.chunks,
        })
    }
}

struct FakeEmbedder {
    calls: AtomicU32,
}

impl FakeEmbedder {
    fn new() -> Self {
        Self {
            calls: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl EmbeddingStage for FakeEmbedder {
    async fn run(&self, request: EmbeddingRequest) -> Result<EmbeddingOutput> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(EmbeddingOutput {
            inserted_record_count: request.total_chunks,
            collection_info: serde_json::json!({"collection": format!("project_{}", request.project_id)}),
        })
    }
}

struct Harness {
    orchestrator: Arc<WorkflowOrchestrator>,
    publisher: Arc<TestPublisher>,
    registry: Arc<ConnectionRegistry>,
    ledger: Arc<TestIdempotencyLedger>,
}

fn harness(chunking: Arc<dyn ChunkingStage>, embedding: Arc<dyn EmbeddingStage>) -> Harness {
    let publisher = Arc::new(TestPublisher::new());
    let registry = Arc::new(ConnectionRegistry::new());
    let ledger = Arc::new(TestIdempotencyLedger::new());
    let manager = ProgressManager::new(Arc::new(TestProgressStore::new()));
    let broadcaster = ProgressBroadcaster::new(
        manager,
        Some(publisher.clone()),
        Some(registry.clone()),
    );
    let orchestrator = Arc::new(
        WorkflowOrchestrator::new(broadcaster, ledger.clone(), chunking, embedding)
            .with_retry_policy(RetryPolicy::immediate(3)),
    );
    Harness {
        orchestrator,
        publisher,
        registry,
        ledger,
    }
}

fn request(project_id: i64, file_id: i64) -> StartWorkflowRequest {
    StartWorkflowRequest::builder()
        .project_id(project_id)
        .file_id(file_id)
        .chunk_size(100)
        .overlap_size(20)
        .build()
}

/// Poll until the workflow row reaches a terminal status.
async fn wait_for_terminal(harness: &Harness, workflow_id: &str) -> String {
    for _ in 0..200 {
        if let Some(row) = harness
            .orchestrator
            .broadcaster()
            .manager()
            .get_progress(workflow_id)
            .await
            .unwrap()
        {
            if row.status_raw == "SUCCESS" || row.status_raw == "FAILURE" {
                return row.status_raw;
            }
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("workflow {} never reached a terminal state", workflow_id);
}

#[tokio::test]
async fn submission_runs_pipeline_to_success() {
    let chunker = Arc::new(FakeChunker::reliable(37));
    let embedder = Arc::new(FakeEmbedder::new());
    let h = harness(chunker.clone(), embedder.clone());

    let ack = h.orchestrator.start_workflow(request(42, 7)).await.unwrap();
    assert_eq!(ack.signal, "WORKFLOW_STARTED");
    assert_eq!(h.ledger.record_count(), 1);

    let status = wait_for_terminal(&h, &ack.workflow_id).await;
    assert_eq!(status, "SUCCESS");
    assert_eq!(chunker.calls.load(Ordering::SeqCst), 1);
    assert_eq!(embedder.calls.load(Ordering::SeqCst), 1);

    let row = h
        .orchestrator
        .broadcaster()
        .manager()
        .get_progress(&ack.workflow_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.overall_progress, 100.0);
    assert!(row.completed_at.is_some());
    assert_eq!(row.result.as_ref().unwrap()["inserted_record_count"], 37);
    assert!(row.error_message.is_none());
}

#[tokio::test]
async fn published_progress_is_monotonic_and_ends_at_100() {
    let chunker = Arc::new(FakeChunker::reliable(37));
    let embedder = Arc::new(FakeEmbedder::new());
    let h = harness(chunker, embedder);

    let ack = h.orchestrator.start_workflow(request(42, 7)).await.unwrap();
    wait_for_terminal(&h, &ack.workflow_id).await;

    // The terminal publish trails the terminal store write slightly.
    let mut messages = h.publisher.messages_for_subject("workflow.progress.42");
    for _ in 0..200 {
        let terminal_seen = messages.iter().any(|m| {
            h.publisher
                .deserialize_message::<ProgressUpdate>(m)
                .map(|u| u.status == "SUCCESS")
                .unwrap_or(false)
        });
        if terminal_seen {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
        messages = h.publisher.messages_for_subject("workflow.progress.42");
    }
    assert!(messages.len() >= 5, "expected a message per transition");

    let updates: Vec<ProgressUpdate> = messages
        .iter()
        .map(|m| h.publisher.deserialize_message(m).unwrap())
        .collect();

    let mut last = -1.0_f64;
    for update in &updates {
        assert_eq!(update.kind, "progress_update");
        assert_eq!(update.workflow_id, ack.workflow_id);
        assert!(
            update.overall_progress >= last,
            "progress regressed: {} after {}",
            update.overall_progress,
            last
        );
        last = update.overall_progress;
    }

    let first = &updates[0];
    assert_eq!(first.status, "PENDING");
    let terminal = updates.last().unwrap();
    assert_eq!(terminal.status, "SUCCESS");
    assert_eq!(terminal.overall_progress, 100.0);

    // 98% is the embedding ceiling; only the terminal write reaches 100.
    let near_end = &updates[updates.len() - 2];
    assert_eq!(near_end.overall_progress, 98.0);
    assert_ne!(near_end.status, "SUCCESS");
}

#[tokio::test]
async fn duplicate_submission_is_rejected_with_original_id() {
    let chunker = Arc::new(FakeChunker::reliable(3));
    let embedder = Arc::new(FakeEmbedder::new());
    let h = harness(chunker, embedder);

    let first = h.orchestrator.start_workflow(request(42, 7)).await.unwrap();
    wait_for_terminal(&h, &first.workflow_id).await;

    match h.orchestrator.start_workflow(request(42, 7)).await {
        Err(WorkflowError::Duplicate { workflow_id }) => {
            assert_eq!(workflow_id, first.workflow_id);
        }
        other => panic!(
            "expected duplicate rejection, got {:?}",
            other.map(|a| a.workflow_id)
        ),
    }
    assert_eq!(h.ledger.record_count(), 1);

    // Different arguments are a different logical task.
    let third = h.orchestrator.start_workflow(request(42, 8)).await.unwrap();
    assert_ne!(third.workflow_id, first.workflow_id);
    assert_eq!(h.ledger.record_count(), 2);
}

#[tokio::test]
async fn stage_failure_exhausts_retries_and_marks_failure() {
    // Fails more times than the policy allows.
    let chunker = Arc::new(FakeChunker::failing_first(10, 3));
    let embedder = Arc::new(FakeEmbedder::new());
    let h = harness(chunker.clone(), embedder.clone());

    let ack = h.orchestrator.start_workflow(request(42, 7)).await.unwrap();
    let status = wait_for_terminal(&h, &ack.workflow_id).await;

    assert_eq!(status, "FAILURE");
    assert_eq!(chunker.calls.load(Ordering::SeqCst), 3);
    assert_eq!(embedder.calls.load(Ordering::SeqCst), 0);

    let row = h
        .orchestrator
        .broadcaster()
        .manager()
        .get_progress(&ack.workflow_id)
        .await
        .unwrap()
        .unwrap();
    let error = row.error_message.as_deref().unwrap_or("");
    assert!(
        error.contains("ingest.chunk_and_store"),
        "error should name the failed task: {}",
        error
    );
    assert!(row.completed_at.is_some());
    assert!(row.result.is_none());
    assert!(row.overall_progress < 100.0);
}

#[tokio::test]
async fn transient_stage_failure_recovers_within_retry_budget() {
    let chunker = Arc::new(FakeChunker::failing_first(2, 5));
    let embedder = Arc::new(FakeEmbedder::new());
    let h = harness(chunker.clone(), embedder.clone());

    let ack = h.orchestrator.start_workflow(request(42, 7)).await.unwrap();
    let status = wait_for_terminal(&h, &ack.workflow_id).await;

    assert_eq!(status, "SUCCESS");
    assert_eq!(chunker.calls.load(Ordering::SeqCst), 3);
    assert_eq!(embedder.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn websocket_subscriber_sees_terminal_update() {
    let chunker = Arc::new(FakeChunker::reliable(4));
    let embedder = Arc::new(FakeEmbedder::new());
    let h = harness(chunker, embedder);

    // Project-level subscription, same as a client on /ws/progress/42.
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    h.registry.connect(tx, Some(42), None).await;
    let ack = rx.recv().await.unwrap();
    assert_eq!(ack["type"], "connected");

    let started = h.orchestrator.start_workflow(request(42, 7)).await.unwrap();
    wait_for_terminal(&h, &started.workflow_id).await;

    let mut saw_terminal = false;
    while let Ok(Some(frame)) =
        tokio::time::timeout(Duration::from_secs(1), rx.recv()).await
    {
        assert_eq!(frame["type"], "progress_update");
        assert_eq!(frame["workflow_id"], started.workflow_id.as_str());
        if frame["status"] == "SUCCESS" {
            assert_eq!(frame["overall_progress"], 100.0);
            saw_terminal = true;
            break;
        }
    }
    assert!(saw_terminal, "subscriber never saw the terminal update");
}

#[tokio::test]
async fn unrelated_project_subscriber_receives_nothing() {
    let chunker = Arc::new(FakeChunker::reliable(4));
    let embedder = Arc::new(FakeEmbedder::new());
    let h = harness(chunker, embedder);

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    h.registry.connect(tx, Some(99), None).await;
    let _connected = rx.recv().await.unwrap();

    let started = h.orchestrator.start_workflow(request(42, 7)).await.unwrap();
    wait_for_terminal(&h, &started.workflow_id).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(rx.try_recv().is_err(), "project 99 should see no frames");
}
