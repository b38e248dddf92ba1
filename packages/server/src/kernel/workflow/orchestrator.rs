//! Workflow orchestration.
//!
//! `start_workflow` performs one combined setup — ledger record, then
//! progress record — and only then dispatches the two-stage pipeline as
//! a background task, returning the workflow id immediately. Setup is
//! fail-closed: if either write fails nothing is dispatched, and a
//! duplicate submission returns the original workflow id instead of
//! running a second pipeline.

use std::sync::Arc;

use tracing::{error, info};
use uuid::Uuid;

use super::broadcaster::ProgressBroadcaster;
use super::idempotency::{args_signature, IdempotencyLedger, LedgerInsert};
use super::pipeline::{
    pipeline_task_names, run_with_retry, RetryPolicy, PIPELINE, WORKFLOW_TASK_NAME,
};
use super::stages::{
    ChunkingRequest, ChunkingStage, EmbeddingOutput, EmbeddingRequest, EmbeddingStage,
    StartWorkflowRequest,
};

/// Errors surfaced by workflow submission.
#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    /// Ledger or progress-record creation failed before dispatch.
    /// The display string already formats the whole cause chain, so the
    /// inner error is not exposed as `source()` as well.
    #[error("workflow setup failed: {0:#}")]
    Setup(anyhow::Error),

    /// A workflow with the same task name and argument set was already
    /// accepted; `workflow_id` is the original run's handle.
    #[error("duplicate workflow submission, already tracked as {workflow_id}")]
    Duplicate { workflow_id: String },
}

/// Acknowledgment returned to the submitter.
#[derive(Debug, Clone, serde::Serialize)]
pub struct StartedWorkflow {
    pub signal: &'static str,
    pub workflow_id: String,
    pub tasks: Vec<&'static str>,
}

/// Drives the chunk→embed pipeline for one file at a time.
pub struct WorkflowOrchestrator {
    broadcaster: ProgressBroadcaster,
    ledger: Arc<dyn IdempotencyLedger>,
    chunking: Arc<dyn ChunkingStage>,
    embedding: Arc<dyn EmbeddingStage>,
    retry: RetryPolicy,
}

impl WorkflowOrchestrator {
    pub fn new(
        broadcaster: ProgressBroadcaster,
        ledger: Arc<dyn IdempotencyLedger>,
        chunking: Arc<dyn ChunkingStage>,
        embedding: Arc<dyn EmbeddingStage>,
    ) -> Self {
        Self {
            broadcaster,
            ledger,
            chunking,
            embedding,
            retry: RetryPolicy::default(),
        }
    }

    /// Override the stage retry policy (tests use a zero backoff).
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn broadcaster(&self) -> &ProgressBroadcaster {
        &self.broadcaster
    }

    /// Accept a submission: seed the ledger and the progress store,
    /// dispatch the pipeline in the background, and return the stable
    /// workflow handle. The caller polls or subscribes for completion.
    pub async fn start_workflow(
        self: &Arc<Self>,
        request: StartWorkflowRequest,
    ) -> Result<StartedWorkflow, WorkflowError> {
        // The workflow id doubles as the queued-task id so observers
        // track one handle end to end.
        let workflow_id = Uuid::new_v4().to_string();
        let project_id = request.project_id;

        let task_args = serde_json::to_value(&request)
            .map_err(|e| WorkflowError::Setup(anyhow::Error::new(e)))?;

        let insert = self
            .ledger
            .create_task_record(WORKFLOW_TASK_NAME, &task_args, &workflow_id)
            .await
            .map_err(WorkflowError::Setup)?;

        if let LedgerInsert::Duplicate(existing) = insert {
            info!(
                workflow_id = %existing.queue_task_id,
                project_id,
                "duplicate workflow submission rejected"
            );
            return Err(WorkflowError::Duplicate {
                workflow_id: existing.queue_task_id,
            });
        }

        if let Err(setup_error) = self
            .broadcaster
            .initialize_workflow(&workflow_id, project_id, PIPELINE.len() as i32)
            .await
        {
            // Compensate so a corrected resubmission is not blocked by
            // a ledger row whose workflow never existed.
            let signature = args_signature(&task_args);
            if let Err(cleanup_error) = self
                .ledger
                .remove_task_record(WORKFLOW_TASK_NAME, &signature)
                .await
            {
                error!(
                    workflow_id = %workflow_id,
                    error = %cleanup_error,
                    "failed to remove ledger record after setup failure"
                );
            }
            error!(
                workflow_id = %workflow_id,
                project_id,
                error = %setup_error,
                "workflow setup failed, nothing dispatched"
            );
            return Err(WorkflowError::Setup(setup_error));
        }

        info!(workflow_id = %workflow_id, project_id, "workflow accepted, dispatching pipeline");

        let orchestrator = Arc::clone(self);
        let spawned_id = workflow_id.clone();
        tokio::spawn(async move {
            orchestrator.run_pipeline(&spawned_id, request).await;
        });

        Ok(StartedWorkflow {
            signal: "WORKFLOW_STARTED",
            workflow_id,
            tasks: pipeline_task_names(),
        })
    }

    /// Execute the stage chain to a terminal state. Public so tests can
    /// drive the pipeline to completion without polling.
    pub async fn run_pipeline(&self, workflow_id: &str, request: StartWorkflowRequest) {
        match self.execute_stages(workflow_id, &request).await {
            Ok(output) => {
                let result = serde_json::to_value(&output).unwrap_or(serde_json::Value::Null);
                if let Err(error) = self.broadcaster.complete_workflow(workflow_id, result).await {
                    error!(
                        workflow_id,
                        error = %error,
                        "failed to record workflow success"
                    );
                }
            }
            Err(error) => {
                let message = format!("{:#}", error);
                error!(workflow_id, error = %message, "workflow failed");
                if let Err(store_error) =
                    self.broadcaster.fail_workflow(workflow_id, &message).await
                {
                    error!(
                        workflow_id,
                        error = %store_error,
                        "failed to record workflow failure"
                    );
                }
            }
        }
    }

    async fn execute_stages(
        &self,
        workflow_id: &str,
        request: &StartWorkflowRequest,
    ) -> anyhow::Result<EmbeddingOutput> {
        // Progress reporting is best-effort relative to pipeline
        // correctness: a lost write is logged, the stage still runs.
        self.report(self.broadcaster.start_chunking(workflow_id, 1).await, workflow_id);

        let chunking_request = ChunkingRequest::from_submission(request, workflow_id);
        let chunking = Arc::clone(&self.chunking);
        let chunking_output = run_with_retry(&PIPELINE[0], workflow_id, &self.retry, |_attempt| {
            let stage = Arc::clone(&chunking);
            let request = chunking_request.clone();
            async move { stage.run(request).await }
        })
        .await?;

        let total_chunks = chunking_output.inserted_chunks;
        self.report(
            self.broadcaster
                .update_chunking(workflow_id, 1, 1, total_chunks)
                .await,
            workflow_id,
        );
        self.report(
            self.broadcaster
                .complete_chunking(workflow_id, total_chunks)
                .await,
            workflow_id,
        );
        self.report(
            self.broadcaster
                .start_embedding(workflow_id, total_chunks)
                .await,
            workflow_id,
        );

        let embedding_request = EmbeddingRequest::from_chunking_output(&chunking_output);
        let embedding = Arc::clone(&self.embedding);
        let embedding_output =
            run_with_retry(&PIPELINE[1], workflow_id, &self.retry, |_attempt| {
                let stage = Arc::clone(&embedding);
                let request = embedding_request.clone();
                async move { stage.run(request).await }
            })
            .await?;

        self.report(
            self.broadcaster
                .update_embedding(workflow_id, total_chunks, total_chunks)
                .await,
            workflow_id,
        );

        Ok(embedding_output)
    }

    fn report(&self, result: anyhow::Result<()>, workflow_id: &str) {
        if let Err(error) = result {
            error!(workflow_id, error = %error, "progress update failed");
        }
    }
}
