//! Stage collaborator interfaces.
//!
//! The chunking and embedding algorithms live outside this crate. The
//! orchestrator only sees these traits: stage B's input is built from
//! stage A's output, and any side effect inside a stage must be safe to
//! repeat because the retry wrapper re-delivers identical arguments.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::warn;
use typed_builder::TypedBuilder;

/// Caller-supplied parameters for one workflow submission.
///
/// This is also the ledger argument set: two submissions with the same
/// field values are the same logical task.
#[derive(Debug, Clone, Serialize, Deserialize, TypedBuilder)]
pub struct StartWorkflowRequest {
    pub project_id: i64,
    pub file_id: i64,
    pub chunk_size: i32,
    pub overlap_size: i32,
    #[builder(default)]
    pub do_reset: bool,
    #[builder(default = default_chunking_method())]
    #[serde(default = "default_chunking_method")]
    pub chunking_method: String,
}

pub fn default_chunking_method() -> String {
    "simple".to_string()
}

/// Input to the chunk-and-store stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkingRequest {
    pub project_id: i64,
    pub file_id: i64,
    pub chunk_size: i32,
    pub overlap_size: i32,
    pub do_reset: bool,
    pub chunking_method: String,
    pub workflow_id: String,
}

impl ChunkingRequest {
    pub fn from_submission(req: &StartWorkflowRequest, workflow_id: &str) -> Self {
        Self {
            project_id: req.project_id,
            file_id: req.file_id,
            chunk_size: req.chunk_size,
            overlap_size: req.overlap_size,
            do_reset: req.do_reset,
            chunking_method: req.chunking_method.clone(),
            workflow_id: workflow_id.to_string(),
        }
    }
}

/// Output of the chunk-and-store stage; stage B's sole input is built
/// from this.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkingOutput {
    pub project_id: i64,
    pub do_reset: bool,
    pub workflow_id: String,
    pub inserted_chunks: i64,
}

/// Input to the embed-and-index stage, extracted from [`ChunkingOutput`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingRequest {
    pub project_id: i64,
    pub do_reset: bool,
    pub workflow_id: String,
    pub total_chunks: i64,
}

impl EmbeddingRequest {
    pub fn from_chunking_output(output: &ChunkingOutput) -> Self {
        Self {
            project_id: output.project_id,
            do_reset: output.do_reset,
            workflow_id: output.workflow_id.clone(),
            total_chunks: output.inserted_chunks,
        }
    }
}

/// Output of the embed-and-index stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingOutput {
    pub inserted_record_count: i64,
    pub collection_info: serde_json::Value,
}

/// Chunk-and-store collaborator. Splits the file into chunks and
/// persists them. Inserts must be upserts: the stage can be re-run with
/// identical arguments after a crash.
#[async_trait]
pub trait ChunkingStage: Send + Sync {
    async fn run(&self, request: ChunkingRequest) -> Result<ChunkingOutput>;
}

/// Embed-and-index collaborator. Embeds stored chunks and writes them
/// to the vector index. Same re-run discipline as chunking.
#[async_trait]
pub trait EmbeddingStage: Send + Sync {
    async fn run(&self, request: EmbeddingRequest) -> Result<EmbeddingOutput>;
}

/// Placeholder chunking stage for deployments where the real
/// collaborator is not wired yet. Does no work.
pub struct NoopChunkingStage;

#[async_trait]
impl ChunkingStage for NoopChunkingStage {
    async fn run(&self, request: ChunkingRequest) -> Result<ChunkingOutput> {
        warn!(
            workflow_id = %request.workflow_id,
            project_id = request.project_id,
            "no chunking collaborator configured; stage is a no-op"
        );
        Ok(ChunkingOutput {
            project_id: request.project_id,
            do_reset: request.do_reset,
            workflow_id: request.workflow_id,
            inserted_chunks: 0,
        })
    }
}

/// Placeholder embedding stage. Does no work.
pub struct NoopEmbeddingStage;

#[async_trait]
impl EmbeddingStage for NoopEmbeddingStage {
    async fn run(&self, request: EmbeddingRequest) -> Result<EmbeddingOutput> {
        warn!(
            workflow_id = %request.workflow_id,
            project_id = request.project_id,
            "no embedding collaborator configured; stage is a no-op"
        );
        Ok(EmbeddingOutput {
            inserted_record_count: 0,
            collection_info: serde_json::Value::Null,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embedding_request_extracts_chunk_count() {
        let output = ChunkingOutput {
            project_id: 7,
            do_reset: true,
            workflow_id: "wf-1".into(),
            inserted_chunks: 37,
        };
        let req = EmbeddingRequest::from_chunking_output(&output);
        assert_eq!(req.total_chunks, 37);
        assert_eq!(req.project_id, 7);
        assert!(req.do_reset);
        assert_eq!(req.workflow_id, "wf-1");
    }

    #[test]
    fn submission_defaults_to_simple_chunking() {
        let req = StartWorkflowRequest::builder()
            .project_id(1)
            .file_id(2)
            .chunk_size(512)
            .overlap_size(64)
            .build();
        assert_eq!(req.chunking_method, "simple");
        assert!(!req.do_reset);
    }
}
