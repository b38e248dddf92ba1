//! Progress fan-out: durable write first, advisory paths second.
//!
//! Every phase transition goes through here. The store write is the
//! only correctness-bearing one and its error surfaces to the caller;
//! the NATS publish and the local registry broadcast are advisory and
//! their failures are logged and swallowed, never escalated into a
//! workflow failure.

use std::sync::Arc;

use anyhow::Result;
use bytes::Bytes;
use tracing::warn;

use crate::kernel::connections::ConnectionRegistry;
use crate::kernel::notify::{progress_subject, ProgressPublisher};

use super::manager::ProgressManager;
use super::progress::{ProgressUpdate, WorkflowProgress};

/// Updates the progress store and pushes each transition to observers.
#[derive(Clone)]
pub struct ProgressBroadcaster {
    manager: ProgressManager,
    publisher: Option<Arc<dyn ProgressPublisher>>,
    registry: Option<Arc<ConnectionRegistry>>,
}

impl ProgressBroadcaster {
    pub fn new(
        manager: ProgressManager,
        publisher: Option<Arc<dyn ProgressPublisher>>,
        registry: Option<Arc<ConnectionRegistry>>,
    ) -> Self {
        Self {
            manager,
            publisher,
            registry,
        }
    }

    pub fn manager(&self) -> &ProgressManager {
        &self.manager
    }

    /// Create the PENDING record and announce it.
    pub async fn initialize_workflow(
        &self,
        workflow_id: &str,
        project_id: i64,
        total_steps: i32,
    ) -> Result<WorkflowProgress> {
        let row = self
            .manager
            .create_workflow_progress(workflow_id, project_id, total_steps)
            .await?;
        self.fan_out(&row).await;
        Ok(row)
    }

    pub async fn start_chunking(&self, workflow_id: &str, total_files: i64) -> Result<()> {
        let row = self
            .manager
            .mark_chunking_start(workflow_id, total_files)
            .await?;
        self.fan_out_opt(row).await;
        Ok(())
    }

    pub async fn update_chunking(
        &self,
        workflow_id: &str,
        files_processed: i64,
        total_files: i64,
        chunks_created: i64,
    ) -> Result<()> {
        let row = self
            .manager
            .update_chunking_progress(workflow_id, files_processed, total_files, chunks_created)
            .await?;
        self.fan_out_opt(row).await;
        Ok(())
    }

    pub async fn complete_chunking(&self, workflow_id: &str, total_chunks: i64) -> Result<()> {
        let row = self
            .manager
            .mark_chunking_complete(workflow_id, total_chunks)
            .await?;
        self.fan_out_opt(row).await;
        Ok(())
    }

    pub async fn start_embedding(&self, workflow_id: &str, total_chunks: i64) -> Result<()> {
        let row = self
            .manager
            .mark_embedding_start(workflow_id, total_chunks)
            .await?;
        self.fan_out_opt(row).await;
        Ok(())
    }

    pub async fn update_embedding(
        &self,
        workflow_id: &str,
        chunks_embedded: i64,
        total_chunks: i64,
    ) -> Result<()> {
        let row = self
            .manager
            .update_embedding_progress(workflow_id, chunks_embedded, total_chunks)
            .await?;
        self.fan_out_opt(row).await;
        Ok(())
    }

    pub async fn complete_workflow(
        &self,
        workflow_id: &str,
        result: serde_json::Value,
    ) -> Result<()> {
        let row = self.manager.mark_workflow_success(workflow_id, result).await?;
        self.fan_out_opt(row).await;
        Ok(())
    }

    pub async fn fail_workflow(&self, workflow_id: &str, error_message: &str) -> Result<()> {
        let row = self
            .manager
            .mark_workflow_failure(workflow_id, error_message)
            .await?;
        self.fan_out_opt(row).await;
        Ok(())
    }

    async fn fan_out_opt(&self, row: Option<WorkflowProgress>) {
        if let Some(row) = row {
            self.fan_out(&row).await;
        }
    }

    /// Advisory push of the freshly-written row. Never fails.
    async fn fan_out(&self, row: &WorkflowProgress) {
        let update = ProgressUpdate::from_progress(row);

        if let Some(publisher) = &self.publisher {
            let subject = progress_subject(row.project_id);
            match serde_json::to_vec(&update) {
                Ok(payload) => {
                    if let Err(error) = publisher.publish(subject, Bytes::from(payload)).await {
                        warn!(
                            workflow_id = %row.workflow_id,
                            error = %error,
                            "failed to publish progress update"
                        );
                    }
                }
                Err(error) => {
                    warn!(
                        workflow_id = %row.workflow_id,
                        error = %error,
                        "failed to serialize progress update"
                    );
                }
            }
        }

        if let Some(registry) = &self.registry {
            registry
                .broadcast_workflow_progress(&row.workflow_id, row.project_id, update.to_json())
                .await;
        }
    }
}
