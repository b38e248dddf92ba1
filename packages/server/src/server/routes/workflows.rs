//! HTTP surface for workflow submission and progress polling.

use axum::{
    extract::{Extension, Path},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use tracing::error;

use crate::kernel::workflow::{
    stages::default_chunking_method, StartWorkflowRequest, WorkflowError,
};
use crate::server::app::AxumAppState;

/// Submission body; chunking parameters default to the ingestion
/// service's standard values.
#[derive(Debug, Deserialize)]
pub struct StartWorkflowBody {
    pub file_id: i64,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: i32,
    #[serde(default = "default_overlap_size")]
    pub overlap_size: i32,
    #[serde(default)]
    pub do_reset: bool,
    #[serde(default = "default_chunking_method")]
    pub chunking_method: String,
}

fn default_chunk_size() -> i32 {
    100
}

fn default_overlap_size() -> i32 {
    20
}

/// POST /api/projects/:project_id/workflows
///
/// Fire-and-forget submission: returns the workflow handle immediately;
/// the caller polls or subscribes for completion.
pub async fn start_workflow_handler(
    Extension(state): Extension<AxumAppState>,
    Path(project_id): Path<i64>,
    Json(body): Json<StartWorkflowBody>,
) -> Response {
    let request = StartWorkflowRequest {
        project_id,
        file_id: body.file_id,
        chunk_size: body.chunk_size,
        overlap_size: body.overlap_size,
        do_reset: body.do_reset,
        chunking_method: body.chunking_method,
    };

    match state.orchestrator.start_workflow(request).await {
        Ok(started) => (StatusCode::ACCEPTED, Json(started)).into_response(),
        Err(WorkflowError::Duplicate { workflow_id }) => (
            StatusCode::CONFLICT,
            Json(serde_json::json!({
                "error": "workflow already submitted with identical arguments",
                "workflow_id": workflow_id,
            })),
        )
            .into_response(),
        Err(error @ WorkflowError::Setup(_)) => {
            error!(project_id, error = %error, "workflow submission failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({"error": error.to_string()})),
            )
                .into_response()
        }
    }
}

/// GET /api/workflows/:workflow_id/progress
pub async fn workflow_progress_handler(
    Extension(state): Extension<AxumAppState>,
    Path(workflow_id): Path<String>,
) -> Response {
    match state.progress.get_progress(&workflow_id).await {
        Ok(Some(progress)) => Json(progress).into_response(),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({
                "error": format!("Workflow {} not found", workflow_id),
            })),
        )
            .into_response(),
        Err(error) => {
            error!(workflow_id = %workflow_id, error = %error, "failed to read progress");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({"error": "failed to read progress"})),
            )
                .into_response()
        }
    }
}

/// GET /api/projects/:project_id/workflows/active
pub async fn project_active_workflows_handler(
    Extension(state): Extension<AxumAppState>,
    Path(project_id): Path<i64>,
) -> Response {
    match state.progress.get_project_active_workflows(project_id).await {
        Ok(workflows) => Json(workflows).into_response(),
        Err(error) => {
            error!(project_id, error = %error, "failed to list active workflows");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({"error": "failed to list active workflows"})),
            )
                .into_response()
        }
    }
}
