//! Phase-transition operations over the progress store.
//!
//! The `ProgressManager` is the only writer/reader of workflow progress
//! rows. Each operation is one atomic update-then-read against the
//! store. Chunking occupies ~5-50% of overall progress and embedding
//! 50-98%; the last 2% closes only at terminal success.

use std::sync::Arc;

use anyhow::Result;
use tracing::debug;

use super::progress::{ProgressStatus, WorkflowProgress, WorkflowStep};
use super::store::{ProgressPatch, ProgressStore};

/// High-level progress operations used by the orchestrator and stages.
#[derive(Clone)]
pub struct ProgressManager {
    store: Arc<dyn ProgressStore>,
}

impl ProgressManager {
    pub fn new(store: Arc<dyn ProgressStore>) -> Self {
        Self { store }
    }

    /// Initialize a new PENDING record at 0% overall.
    pub async fn create_workflow_progress(
        &self,
        workflow_id: &str,
        project_id: i64,
        total_steps: i32,
    ) -> Result<WorkflowProgress> {
        let row = self
            .store
            .create(
                workflow_id,
                project_id,
                total_steps,
                "Workflow initialized, waiting to start...",
            )
            .await?;
        debug!(workflow_id, project_id, "created workflow progress record");
        Ok(row)
    }

    /// Enter the chunking phase: step 1, 5% overall.
    pub async fn mark_chunking_start(
        &self,
        workflow_id: &str,
        total_files: i64,
    ) -> Result<Option<WorkflowProgress>> {
        self.update(
            workflow_id,
            ProgressPatch {
                status: Some(ProgressStatus::Chunking),
                current_step: Some(WorkflowStep::Chunking),
                current_step_number: Some(WorkflowStep::Chunking.number()),
                step_progress: Some(0.0),
                overall_progress: Some(5.0),
                message: Some(format!(
                    "Starting chunking phase for {} file(s)...",
                    total_files
                )),
                ..Default::default()
            },
        )
        .await
    }

    /// Report chunking progress; overall = 5 + step_progress * 0.45.
    pub async fn update_chunking_progress(
        &self,
        workflow_id: &str,
        files_processed: i64,
        total_files: i64,
        chunks_created: i64,
    ) -> Result<Option<WorkflowProgress>> {
        // Clamp so an over-reporting collaborator cannot push overall
        // past the 50% chunking ceiling and regress later.
        let step_progress =
            ((files_processed as f64 / total_files.max(1) as f64) * 100.0).min(100.0);
        let overall_progress = 5.0 + step_progress * 0.45;

        self.update(
            workflow_id,
            ProgressPatch {
                step_progress: Some(step_progress),
                overall_progress: Some(overall_progress),
                message: Some(format!(
                    "Chunking: Processed {}/{} files ({} chunks created)",
                    files_processed, total_files, chunks_created
                )),
                ..Default::default()
            },
        )
        .await
    }

    /// Chunking done: step 100%, overall pinned at 50%.
    pub async fn mark_chunking_complete(
        &self,
        workflow_id: &str,
        total_chunks: i64,
    ) -> Result<Option<WorkflowProgress>> {
        self.update(
            workflow_id,
            ProgressPatch {
                step_progress: Some(100.0),
                overall_progress: Some(50.0),
                message: Some(format!(
                    "Chunking complete! Created {} chunks. Starting embedding...",
                    total_chunks
                )),
                ..Default::default()
            },
        )
        .await
    }

    /// Enter the embedding phase: step 2, 50% overall.
    pub async fn mark_embedding_start(
        &self,
        workflow_id: &str,
        total_chunks: i64,
    ) -> Result<Option<WorkflowProgress>> {
        self.update(
            workflow_id,
            ProgressPatch {
                status: Some(ProgressStatus::Embedding),
                current_step: Some(WorkflowStep::Embedding),
                current_step_number: Some(WorkflowStep::Embedding.number()),
                step_progress: Some(0.0),
                overall_progress: Some(50.0),
                message: Some(format!(
                    "Starting embedding phase for {} chunks...",
                    total_chunks
                )),
                ..Default::default()
            },
        )
        .await
    }

    /// Report embedding progress; overall = 50 + step_progress * 0.48.
    pub async fn update_embedding_progress(
        &self,
        workflow_id: &str,
        chunks_embedded: i64,
        total_chunks: i64,
    ) -> Result<Option<WorkflowProgress>> {
        // Same clamp as chunking; the 98% ceiling holds regardless of
        // the reported counts.
        let step_progress =
            ((chunks_embedded as f64 / total_chunks.max(1) as f64) * 100.0).min(100.0);
        let overall_progress = 50.0 + step_progress * 0.48;

        self.update(
            workflow_id,
            ProgressPatch {
                step_progress: Some(step_progress),
                overall_progress: Some(overall_progress),
                message: Some(format!(
                    "Embedding: Indexed {}/{} chunks into vector database",
                    chunks_embedded, total_chunks
                )),
                ..Default::default()
            },
        )
        .await
    }

    /// Terminal success: 100% overall, result stored, `completed_at` set.
    pub async fn mark_workflow_success(
        &self,
        workflow_id: &str,
        result: serde_json::Value,
    ) -> Result<Option<WorkflowProgress>> {
        self.update(
            workflow_id,
            ProgressPatch {
                status: Some(ProgressStatus::Success),
                step_progress: Some(100.0),
                overall_progress: Some(100.0),
                message: Some(
                    "Workflow completed successfully! Your data is ready for querying."
                        .to_string(),
                ),
                result: Some(result),
                completed: true,
                ..Default::default()
            },
        )
        .await
    }

    /// Terminal failure: error recorded, `completed_at` set.
    pub async fn mark_workflow_failure(
        &self,
        workflow_id: &str,
        error_message: &str,
    ) -> Result<Option<WorkflowProgress>> {
        self.update(
            workflow_id,
            ProgressPatch {
                status: Some(ProgressStatus::Failure),
                message: Some(format!("Workflow failed: {}", error_message)),
                error_message: Some(error_message.to_string()),
                completed: true,
                ..Default::default()
            },
        )
        .await
    }

    pub async fn get_progress(&self, workflow_id: &str) -> Result<Option<WorkflowProgress>> {
        self.store.get(workflow_id).await
    }

    /// Non-terminal workflows for a project, newest first.
    pub async fn get_project_active_workflows(
        &self,
        project_id: i64,
    ) -> Result<Vec<WorkflowProgress>> {
        self.store.project_active(project_id).await
    }

    async fn update(
        &self,
        workflow_id: &str,
        patch: ProgressPatch,
    ) -> Result<Option<WorkflowProgress>> {
        let row = self.store.update(workflow_id, patch).await?;
        match &row {
            Some(row) => debug!(workflow_id, status = %row.status_raw, "updated workflow progress"),
            None => debug!(workflow_id, "progress update skipped (unknown or terminal)"),
        }
        Ok(row)
    }
}
