//! Application setup and server configuration.

use std::sync::Arc;

use axum::{
    extract::Extension,
    routing::{get, post},
    Router,
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::kernel::workflow::{ProgressManager, WorkflowOrchestrator};
use crate::kernel::ConnectionRegistry;
use crate::server::routes::{
    connections_status_handler, health_handler, project_active_workflows_handler,
    start_workflow_handler, workflow_progress_handler, ws_progress_handler,
};

/// Shared application state
#[derive(Clone)]
pub struct AxumAppState {
    pub orchestrator: Arc<WorkflowOrchestrator>,
    pub progress: ProgressManager,
    pub registry: Arc<ConnectionRegistry>,
}

/// Build the Axum application router
pub fn build_app(state: AxumAppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route(
            "/api/projects/:project_id/workflows",
            post(start_workflow_handler),
        )
        .route(
            "/api/projects/:project_id/workflows/active",
            get(project_active_workflows_handler),
        )
        .route(
            "/api/workflows/:workflow_id/progress",
            get(workflow_progress_handler),
        )
        .route("/ws/progress/:project_id", get(ws_progress_handler))
        .route("/ws/connections/status", get(connections_status_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .layer(Extension(state))
}
