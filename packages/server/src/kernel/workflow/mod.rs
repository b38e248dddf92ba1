//! Ingestion workflow core: orchestration, progress tracking, and
//! idempotent submission.
//!
//! Module map:
//! - `progress` — data model and percentage math
//! - `store` — durable progress rows (Postgres + in-memory test impl)
//! - `manager` — phase-transition operations
//! - `broadcaster` — durable write + advisory fan-out per transition
//! - `idempotency` — submission ledger with duplicate rejection
//! - `pipeline` — stage chain definition and bounded retry
//! - `stages` — collaborator seams for chunking and embedding
//! - `orchestrator` — submission entry point and pipeline driver

pub mod broadcaster;
pub mod idempotency;
pub mod manager;
pub mod orchestrator;
pub mod pipeline;
pub mod progress;
pub mod stages;
pub mod store;

pub use broadcaster::ProgressBroadcaster;
pub use idempotency::{
    args_signature, IdempotencyLedger, LedgerInsert, PostgresIdempotencyLedger, TaskRecord,
    TestIdempotencyLedger,
};
pub use manager::ProgressManager;
pub use orchestrator::{StartedWorkflow, WorkflowError, WorkflowOrchestrator};
pub use pipeline::{RetryPolicy, StageDescriptor, PIPELINE, WORKFLOW_TASK_NAME};
pub use progress::{
    calculate_overall_progress, ProgressStatus, ProgressUpdate, WorkflowProgress, WorkflowStep,
};
pub use stages::{
    ChunkingOutput, ChunkingRequest, ChunkingStage, EmbeddingOutput, EmbeddingRequest,
    EmbeddingStage, NoopChunkingStage, NoopEmbeddingStage, StartWorkflowRequest,
};
pub use store::{PostgresProgressStore, ProgressPatch, ProgressStore, TestProgressStore};
