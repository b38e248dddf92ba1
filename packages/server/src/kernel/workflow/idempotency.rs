//! Idempotency ledger for workflow submissions.
//!
//! One `task_records` row per accepted logical submission, keyed by
//! (task name, SHA-256 of the canonical argument JSON). A conditional
//! insert rejects a resubmission with identical semantics before the
//! pipeline is dispatched, so a re-delivered submission cannot run the
//! stage chain twice.

use std::collections::HashMap;
use std::sync::RwLock;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use sqlx::PgPool;

/// One accepted logical task invocation.
#[derive(Debug, Clone, serde::Serialize, sqlx::FromRow)]
pub struct TaskRecord {
    pub id: i64,
    pub task_name: String,
    pub args_signature: String,
    pub task_args: serde_json::Value,
    pub queue_task_id: String,
    pub created_at: DateTime<Utc>,
}

/// Outcome of a ledger insert.
#[derive(Debug, Clone)]
pub enum LedgerInsert {
    /// First submission with this argument set.
    Created(TaskRecord),
    /// A record with the same (task_name, args_signature) already
    /// exists; carries the original record.
    Duplicate(TaskRecord),
}

impl LedgerInsert {
    pub fn record(&self) -> &TaskRecord {
        match self {
            LedgerInsert::Created(r) | LedgerInsert::Duplicate(r) => r,
        }
    }

    pub fn is_created(&self) -> bool {
        matches!(self, LedgerInsert::Created(_))
    }
}

/// Hex SHA-256 over the canonical JSON encoding of the argument set.
///
/// serde_json serializes object keys in sorted order, so two argument
/// maps with the same contents produce the same signature regardless of
/// insertion order.
pub fn args_signature(task_args: &serde_json::Value) -> String {
    let canonical = serde_json::to_vec(task_args).unwrap_or_default();
    hex::encode(Sha256::digest(&canonical))
}

/// Bookkeeping seam for accepted task invocations.
#[async_trait]
pub trait IdempotencyLedger: Send + Sync {
    /// Record a submission. Returns `Duplicate` without writing when a
    /// record with the same name + argument signature exists.
    async fn create_task_record(
        &self,
        task_name: &str,
        task_args: &serde_json::Value,
        queue_task_id: &str,
    ) -> Result<LedgerInsert>;

    /// Remove a record (compensation when the paired progress-record
    /// write fails during setup).
    async fn remove_task_record(&self, task_name: &str, args_signature: &str) -> Result<()>;
}

/// PostgreSQL-backed ledger.
pub struct PostgresIdempotencyLedger {
    pool: PgPool,
}

impl PostgresIdempotencyLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl IdempotencyLedger for PostgresIdempotencyLedger {
    async fn create_task_record(
        &self,
        task_name: &str,
        task_args: &serde_json::Value,
        queue_task_id: &str,
    ) -> Result<LedgerInsert> {
        let signature = args_signature(task_args);

        let inserted = sqlx::query_as::<_, TaskRecord>(
            r#"
            INSERT INTO task_records (task_name, args_signature, task_args, queue_task_id)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT ON CONSTRAINT uq_task_records_name_signature DO NOTHING
            RETURNING *
            "#,
        )
        .bind(task_name)
        .bind(&signature)
        .bind(task_args)
        .bind(queue_task_id)
        .fetch_optional(&self.pool)
        .await
        .with_context(|| format!("failed to insert task record for {}", task_name))?;

        if let Some(record) = inserted {
            return Ok(LedgerInsert::Created(record));
        }

        let existing = sqlx::query_as::<_, TaskRecord>(
            "SELECT * FROM task_records WHERE task_name = $1 AND args_signature = $2",
        )
        .bind(task_name)
        .bind(&signature)
        .fetch_one(&self.pool)
        .await
        .with_context(|| format!("failed to load duplicate task record for {}", task_name))?;

        Ok(LedgerInsert::Duplicate(existing))
    }

    async fn remove_task_record(&self, task_name: &str, args_signature: &str) -> Result<()> {
        sqlx::query("DELETE FROM task_records WHERE task_name = $1 AND args_signature = $2")
            .bind(task_name)
            .bind(args_signature)
            .execute(&self.pool)
            .await
            .with_context(|| format!("failed to remove task record for {}", task_name))?;
        Ok(())
    }
}

/// In-memory ledger for tests.
#[derive(Default)]
pub struct TestIdempotencyLedger {
    records: RwLock<HashMap<(String, String), TaskRecord>>,
    next_id: RwLock<i64>,
}

impl TestIdempotencyLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<TaskRecord> {
        self.records
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }

    pub fn record_count(&self) -> usize {
        self.records
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}

#[async_trait]
impl IdempotencyLedger for TestIdempotencyLedger {
    async fn create_task_record(
        &self,
        task_name: &str,
        task_args: &serde_json::Value,
        queue_task_id: &str,
    ) -> Result<LedgerInsert> {
        let signature = args_signature(task_args);
        let key = (task_name.to_string(), signature.clone());

        let mut records = self.records.write().unwrap_or_else(|e| e.into_inner());
        if let Some(existing) = records.get(&key) {
            return Ok(LedgerInsert::Duplicate(existing.clone()));
        }

        let id = {
            let mut next = self.next_id.write().unwrap_or_else(|e| e.into_inner());
            *next += 1;
            *next
        };

        let record = TaskRecord {
            id,
            task_name: task_name.to_string(),
            args_signature: signature,
            task_args: task_args.clone(),
            queue_task_id: queue_task_id.to_string(),
            created_at: Utc::now(),
        };
        records.insert(key, record.clone());
        Ok(LedgerInsert::Created(record))
    }

    async fn remove_task_record(&self, task_name: &str, args_signature: &str) -> Result<()> {
        self.records
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&(task_name.to_string(), args_signature.to_string()));
        Ok(())
    }
}
