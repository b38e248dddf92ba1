//! Durable storage for workflow progress records.
//!
//! The `ProgressStore` trait abstracts the `workflow_progress` table so
//! the manager can run against Postgres in production and an in-memory
//! store in tests. All writes are scoped to a single row by
//! `workflow_id`; no cross-row transactions are needed.

use std::collections::HashMap;
use std::sync::RwLock;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use sqlx::PgPool;

use super::progress::{ProgressStatus, WorkflowProgress, WorkflowStep};

/// Partial update applied to a progress row.
///
/// `None` fields are left untouched. `completed` sets `completed_at`
/// on its first true, never again after.
#[derive(Debug, Clone, Default)]
pub struct ProgressPatch {
    pub status: Option<ProgressStatus>,
    pub current_step: Option<WorkflowStep>,
    pub current_step_number: Option<i32>,
    pub step_progress: Option<f64>,
    pub overall_progress: Option<f64>,
    pub message: Option<String>,
    pub result: Option<serde_json::Value>,
    pub error_message: Option<String>,
    pub completed: bool,
}

/// Storage seam for workflow progress rows.
#[async_trait]
pub trait ProgressStore: Send + Sync {
    /// Insert a fresh PENDING row for a workflow. Fails if the
    /// workflow id already exists.
    async fn create(
        &self,
        workflow_id: &str,
        project_id: i64,
        total_steps: i32,
        message: &str,
    ) -> Result<WorkflowProgress>;

    /// Atomically apply a patch and return the updated row.
    ///
    /// Returns `None` if the workflow is unknown or already terminal
    /// (terminal rows are frozen; status never moves backward).
    async fn update(&self, workflow_id: &str, patch: ProgressPatch)
        -> Result<Option<WorkflowProgress>>;

    /// Read a single row.
    async fn get(&self, workflow_id: &str) -> Result<Option<WorkflowProgress>>;

    /// All non-terminal workflows for a project, newest first.
    async fn project_active(&self, project_id: i64) -> Result<Vec<WorkflowProgress>>;
}

/// PostgreSQL-backed progress store.
pub struct PostgresProgressStore {
    pool: PgPool,
}

impl PostgresProgressStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ProgressStore for PostgresProgressStore {
    async fn create(
        &self,
        workflow_id: &str,
        project_id: i64,
        total_steps: i32,
        message: &str,
    ) -> Result<WorkflowProgress> {
        let row = sqlx::query_as::<_, WorkflowProgress>(
            r#"
            INSERT INTO workflow_progress
                (workflow_id, project_id, status, current_step_number, total_steps,
                 step_progress, overall_progress, message, started_at)
            VALUES ($1, $2, 'PENDING', 0, $3, 0.0, 0.0, $4, NOW())
            RETURNING *
            "#,
        )
        .bind(workflow_id)
        .bind(project_id)
        .bind(total_steps)
        .bind(message)
        .fetch_one(&self.pool)
        .await
        .with_context(|| format!("failed to create progress record for {}", workflow_id))?;

        Ok(row)
    }

    async fn update(
        &self,
        workflow_id: &str,
        patch: ProgressPatch,
    ) -> Result<Option<WorkflowProgress>> {
        let row = sqlx::query_as::<_, WorkflowProgress>(
            r#"
            UPDATE workflow_progress
            SET status = COALESCE($2, status),
                current_step = COALESCE($3, current_step),
                current_step_number = COALESCE($4, current_step_number),
                step_progress = COALESCE($5, step_progress),
                overall_progress = COALESCE($6, overall_progress),
                message = COALESCE($7, message),
                result = COALESCE($8, result),
                error_message = COALESCE($9, error_message),
                completed_at = CASE WHEN $10 THEN COALESCE(completed_at, NOW())
                                    ELSE completed_at END,
                updated_at = NOW()
            WHERE workflow_id = $1
              AND status NOT IN ('SUCCESS', 'FAILURE')
            RETURNING *
            "#,
        )
        .bind(workflow_id)
        .bind(patch.status.map(|s| s.as_str()))
        .bind(patch.current_step.map(|s| s.as_str()))
        .bind(patch.current_step_number)
        .bind(patch.step_progress)
        .bind(patch.overall_progress)
        .bind(patch.message)
        .bind(patch.result)
        .bind(patch.error_message)
        .bind(patch.completed)
        .fetch_optional(&self.pool)
        .await
        .with_context(|| format!("failed to update progress record for {}", workflow_id))?;

        Ok(row)
    }

    async fn get(&self, workflow_id: &str) -> Result<Option<WorkflowProgress>> {
        let row = sqlx::query_as::<_, WorkflowProgress>(
            "SELECT * FROM workflow_progress WHERE workflow_id = $1",
        )
        .bind(workflow_id)
        .fetch_optional(&self.pool)
        .await
        .with_context(|| format!("failed to read progress record for {}", workflow_id))?;

        Ok(row)
    }

    async fn project_active(&self, project_id: i64) -> Result<Vec<WorkflowProgress>> {
        let rows = sqlx::query_as::<_, WorkflowProgress>(
            r#"
            SELECT * FROM workflow_progress
            WHERE project_id = $1
              AND status NOT IN ('SUCCESS', 'FAILURE')
            ORDER BY created_at DESC
            "#,
        )
        .bind(project_id)
        .fetch_all(&self.pool)
        .await
        .with_context(|| format!("failed to list active workflows for project {}", project_id))?;

        Ok(rows)
    }
}

/// In-memory progress store for tests.
///
/// Mirrors the Postgres semantics: one row per workflow id, terminal
/// rows frozen, `completed_at` set once.
#[derive(Default)]
pub struct TestProgressStore {
    rows: RwLock<HashMap<String, WorkflowProgress>>,
    next_id: RwLock<i64>,
}

impl TestProgressStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every stored row.
    pub fn rows(&self) -> Vec<WorkflowProgress> {
        self.rows
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }

    pub fn clear(&self) {
        self.rows.write().unwrap_or_else(|e| e.into_inner()).clear();
    }
}

#[async_trait]
impl ProgressStore for TestProgressStore {
    async fn create(
        &self,
        workflow_id: &str,
        project_id: i64,
        total_steps: i32,
        message: &str,
    ) -> Result<WorkflowProgress> {
        let mut rows = self.rows.write().unwrap_or_else(|e| e.into_inner());
        if rows.contains_key(workflow_id) {
            anyhow::bail!("duplicate workflow_id: {}", workflow_id);
        }

        let id = {
            let mut next = self.next_id.write().unwrap_or_else(|e| e.into_inner());
            *next += 1;
            *next
        };

        let now = Utc::now();
        let row = WorkflowProgress {
            id,
            workflow_id: workflow_id.to_string(),
            project_id,
            status_raw: ProgressStatus::Pending.as_str().to_string(),
            current_step: None,
            current_step_number: 0,
            total_steps,
            step_progress: 0.0,
            overall_progress: 0.0,
            message: Some(message.to_string()),
            result: None,
            error_message: None,
            started_at: Some(now),
            completed_at: None,
            created_at: now,
            updated_at: None,
        };

        rows.insert(workflow_id.to_string(), row.clone());
        Ok(row)
    }

    async fn update(
        &self,
        workflow_id: &str,
        patch: ProgressPatch,
    ) -> Result<Option<WorkflowProgress>> {
        let mut rows = self.rows.write().unwrap_or_else(|e| e.into_inner());
        let Some(row) = rows.get_mut(workflow_id) else {
            return Ok(None);
        };
        if row.is_terminal() {
            return Ok(None);
        }

        if let Some(status) = patch.status {
            row.status_raw = status.as_str().to_string();
        }
        if let Some(step) = patch.current_step {
            row.current_step = Some(step.as_str().to_string());
        }
        if let Some(n) = patch.current_step_number {
            row.current_step_number = n;
        }
        if let Some(p) = patch.step_progress {
            row.step_progress = p;
        }
        if let Some(p) = patch.overall_progress {
            row.overall_progress = p;
        }
        if let Some(m) = patch.message {
            row.message = Some(m);
        }
        if let Some(r) = patch.result {
            row.result = Some(r);
        }
        if let Some(e) = patch.error_message {
            row.error_message = Some(e);
        }
        if patch.completed && row.completed_at.is_none() {
            row.completed_at = Some(Utc::now());
        }
        row.updated_at = Some(Utc::now());

        Ok(Some(row.clone()))
    }

    async fn get(&self, workflow_id: &str) -> Result<Option<WorkflowProgress>> {
        Ok(self
            .rows
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(workflow_id)
            .cloned())
    }

    async fn project_active(&self, project_id: i64) -> Result<Vec<WorkflowProgress>> {
        let mut active: Vec<WorkflowProgress> = self
            .rows
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .filter(|r| r.project_id == project_id && !r.is_terminal())
            .cloned()
            .collect();

        active.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(active)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_then_get() {
        let store = TestProgressStore::new();
        store.create("wf-1", 42, 2, "init").await.unwrap();

        let row = store.get("wf-1").await.unwrap().unwrap();
        assert_eq!(row.status(), Some(ProgressStatus::Pending));
        assert_eq!(row.project_id, 42);
        assert_eq!(row.overall_progress, 0.0);
    }

    #[tokio::test]
    async fn duplicate_create_fails() {
        let store = TestProgressStore::new();
        store.create("wf-1", 42, 2, "init").await.unwrap();
        assert!(store.create("wf-1", 42, 2, "init").await.is_err());
    }

    #[tokio::test]
    async fn terminal_rows_are_frozen() {
        let store = TestProgressStore::new();
        store.create("wf-1", 42, 2, "init").await.unwrap();

        let patch = ProgressPatch {
            status: Some(ProgressStatus::Success),
            overall_progress: Some(100.0),
            completed: true,
            ..Default::default()
        };
        let row = store.update("wf-1", patch).await.unwrap().unwrap();
        let completed_at = row.completed_at.unwrap();

        // Any further write is a no-op.
        let late = ProgressPatch {
            status: Some(ProgressStatus::Failure),
            completed: true,
            ..Default::default()
        };
        assert!(store.update("wf-1", late).await.unwrap().is_none());

        let row = store.get("wf-1").await.unwrap().unwrap();
        assert_eq!(row.status(), Some(ProgressStatus::Success));
        assert_eq!(row.completed_at, Some(completed_at));
    }

    #[tokio::test]
    async fn unknown_workflow_update_returns_none() {
        let store = TestProgressStore::new();
        let patch = ProgressPatch::default();
        assert!(store.update("missing", patch).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn project_active_excludes_terminal_and_sorts_newest_first() {
        let store = TestProgressStore::new();
        store.create("wf-old", 7, 2, "init").await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        store.create("wf-new", 7, 2, "init").await.unwrap();
        store.create("wf-done", 7, 2, "init").await.unwrap();
        store.create("wf-other", 8, 2, "init").await.unwrap();

        store
            .update(
                "wf-done",
                ProgressPatch {
                    status: Some(ProgressStatus::Failure),
                    completed: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let active = store.project_active(7).await.unwrap();
        let ids: Vec<&str> = active.iter().map(|r| r.workflow_id.as_str()).collect();
        assert!(ids.contains(&"wf-old") && ids.contains(&"wf-new"));
        assert!(!ids.contains(&"wf-done"));
        assert!(!ids.contains(&"wf-other"));
        assert_eq!(ids.first(), Some(&"wf-new"));
    }
}
