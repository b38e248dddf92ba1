//! Pipeline definition and bounded retry execution.
//!
//! The stage chain is an explicit two-node dependency-ordered pipeline:
//! the embed stage only starts once the chunk stage's output exists.
//! Retries are a wrapper around stage execution with a bounded attempt
//! counter and a fixed backoff, not a property of any queue product.

use std::future::Future;
use std::time::Duration;

use anyhow::Result;
use tracing::warn;

use super::progress::WorkflowStep;

/// One node of the pipeline chain.
#[derive(Debug, Clone, Copy)]
pub struct StageDescriptor {
    /// Stable task name, used in the ledger and the submission ack.
    pub task_name: &'static str,
    pub step: WorkflowStep,
}

/// The ordered stage chain: chunk-and-store, then embed-and-index.
pub const PIPELINE: [StageDescriptor; 2] = [
    StageDescriptor {
        task_name: "ingest.chunk_and_store",
        step: WorkflowStep::Chunking,
    },
    StageDescriptor {
        task_name: "ingest.embed_and_index",
        step: WorkflowStep::Embedding,
    },
];

/// Ledger task name for the outer workflow submission.
pub const WORKFLOW_TASK_NAME: &str = "ingest.start_workflow";

/// Task names of the stage chain, in execution order.
pub fn pipeline_task_names() -> Vec<&'static str> {
    PIPELINE.iter().map(|s| s.task_name).collect()
}

/// Retry policy for a stage: up to `max_attempts` executions with a
/// fixed `backoff` between attempts.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// Policy with no backoff, for tests.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            backoff: Duration::ZERO,
        }
    }
}

/// Run a stage under the retry policy.
///
/// The closure receives the 1-based attempt number and is re-invoked
/// with identical inputs after each failure, so stage side effects must
/// be repeat-safe. The last error is returned once attempts are
/// exhausted.
pub async fn run_with_retry<T, F, Fut>(
    stage: &StageDescriptor,
    workflow_id: &str,
    policy: &RetryPolicy,
    mut run: F,
) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        match run(attempt).await {
            Ok(value) => return Ok(value),
            Err(error) if attempt < max_attempts => {
                warn!(
                    workflow_id,
                    task = stage.task_name,
                    attempt,
                    max_attempts,
                    error = %error,
                    backoff_secs = policy.backoff.as_secs(),
                    "stage failed, retrying"
                );
                tokio::time::sleep(policy.backoff).await;
                attempt += 1;
            }
            Err(error) => {
                return Err(error.context(format!(
                    "{} failed after {} attempt(s)",
                    stage.task_name, attempt
                )));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn succeeds_first_try() {
        let calls = AtomicU32::new(0);
        let result = run_with_retry(&PIPELINE[0], "wf-1", &RetryPolicy::immediate(3), |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok::<_, anyhow::Error>(42) }
        })
        .await
        .unwrap();

        assert_eq!(result, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retries_transient_failures() {
        let calls = AtomicU32::new(0);
        let result = run_with_retry(&PIPELINE[0], "wf-1", &RetryPolicy::immediate(3), |attempt| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt < 3 {
                    anyhow::bail!("transient")
                } else {
                    Ok("ok")
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(result, "ok");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausts_attempts_and_returns_last_error() {
        let calls = AtomicU32::new(0);
        let result: Result<()> =
            run_with_retry(&PIPELINE[1], "wf-1", &RetryPolicy::immediate(3), |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { anyhow::bail!("index write refused") }
            })
            .await;

        let error = result.unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(format!("{:#}", error).contains("index write refused"));
        assert!(format!("{:#}", error).contains("ingest.embed_and_index"));
    }

    #[test]
    fn pipeline_order_is_chunk_then_embed() {
        let names = pipeline_task_names();
        assert_eq!(names, vec!["ingest.chunk_and_store", "ingest.embed_and_index"]);
        assert_eq!(PIPELINE[0].step.number(), 1);
        assert_eq!(PIPELINE[1].step.number(), 2);
    }
}
