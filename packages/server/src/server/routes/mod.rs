pub mod health;
pub mod workflows;
pub mod ws;

pub use health::health_handler;
pub use workflows::{
    project_active_workflows_handler, start_workflow_handler, workflow_progress_handler,
};
pub use ws::{connections_status_handler, ws_progress_handler};
