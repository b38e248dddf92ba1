//! Workflow progress data model.
//!
//! One `workflow_progress` row per workflow run. The row is the single
//! source of truth for "where is workflow W right now"; the NATS and
//! WebSocket paths are advisory copies of it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Coarse lifecycle state of a workflow.
///
/// Transitions only move forward:
/// PENDING → STARTED/CHUNKING → EMBEDDING → SUCCESS | FAILURE.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProgressStatus {
    Pending,
    Started,
    Chunking,
    Embedding,
    Success,
    Failure,
}

impl ProgressStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProgressStatus::Pending => "PENDING",
            ProgressStatus::Started => "STARTED",
            ProgressStatus::Chunking => "CHUNKING",
            ProgressStatus::Embedding => "EMBEDDING",
            ProgressStatus::Success => "SUCCESS",
            ProgressStatus::Failure => "FAILURE",
        }
    }

    /// Terminal states never change again; `completed_at` is set when
    /// one of these is first reached.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ProgressStatus::Success | ProgressStatus::Failure)
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(ProgressStatus::Pending),
            "STARTED" => Some(ProgressStatus::Started),
            "CHUNKING" => Some(ProgressStatus::Chunking),
            "EMBEDDING" => Some(ProgressStatus::Embedding),
            "SUCCESS" => Some(ProgressStatus::Success),
            "FAILURE" => Some(ProgressStatus::Failure),
            _ => None,
        }
    }
}

impl std::fmt::Display for ProgressStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The two pipeline stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowStep {
    Chunking,
    Embedding,
}

impl WorkflowStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowStep::Chunking => "chunking",
            WorkflowStep::Embedding => "embedding",
        }
    }

    /// 1-indexed position in the pipeline.
    pub fn number(&self) -> i32 {
        match self {
            WorkflowStep::Chunking => 1,
            WorkflowStep::Embedding => 2,
        }
    }
}

/// Durable progress record for one workflow run.
///
/// `status` is stored as text; use [`WorkflowProgress::status`] for the
/// typed view.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct WorkflowProgress {
    pub id: i64,
    pub workflow_id: String,
    pub project_id: i64,
    #[sqlx(rename = "status")]
    #[serde(rename = "status")]
    pub status_raw: String,
    pub current_step: Option<String>,
    pub current_step_number: i32,
    pub total_steps: i32,
    pub step_progress: f64,
    pub overall_progress: f64,
    pub message: Option<String>,
    pub result: Option<serde_json::Value>,
    pub error_message: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl WorkflowProgress {
    pub fn status(&self) -> Option<ProgressStatus> {
        ProgressStatus::parse(&self.status_raw)
    }

    pub fn is_terminal(&self) -> bool {
        self.status().map(|s| s.is_terminal()).unwrap_or(false)
    }
}

/// Normalized progress-update message pushed to observers.
///
/// This is the wire shape for both the NATS channel and the WebSocket
/// `progress_update` frames.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressUpdate {
    #[serde(rename = "type")]
    pub kind: String,
    pub workflow_id: String,
    pub project_id: i64,
    pub status: String,
    pub current_step: Option<String>,
    pub current_step_number: i32,
    pub total_steps: i32,
    pub step_progress: f64,
    pub overall_progress: f64,
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl ProgressUpdate {
    pub fn from_progress(progress: &WorkflowProgress) -> Self {
        Self {
            kind: "progress_update".to_string(),
            workflow_id: progress.workflow_id.clone(),
            project_id: progress.project_id,
            status: progress.status_raw.clone(),
            current_step: progress.current_step.clone(),
            current_step_number: progress.current_step_number,
            total_steps: progress.total_steps,
            step_progress: progress.step_progress,
            overall_progress: progress.overall_progress,
            message: progress.message.clone(),
            result: progress.result.clone(),
            error_message: progress.error_message.clone(),
            timestamp: progress.updated_at.unwrap_or_else(Utc::now),
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

/// Generic step-weighted progress calculation.
///
/// The two-stage pipeline uses its own asymmetric weighting (see
/// `ProgressManager`); this helper covers workflows with uniform steps.
pub fn calculate_overall_progress(step_number: i32, total_steps: i32, step_progress: f64) -> f64 {
    if total_steps == 0 {
        return 0.0;
    }

    let step_weight = 100.0 / total_steps as f64;
    let completed = (step_number - 1).max(0) as f64 * step_weight;
    let current = (step_progress / 100.0) * step_weight;

    (completed + current).min(100.0)
}
