//! NATS publisher abstraction for progress notifications.
//!
//! Best-effort fan-out of progress updates to a low-latency bus,
//! independent of the durable store. A multi-instance deployment
//! subscribes each server's registry to these subjects; a single
//! instance can run without NATS entirely.

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::RwLock;

/// Subject for a project's progress updates.
pub fn progress_subject(project_id: i64) -> String {
    format!("workflow.progress.{}", project_id)
}

/// A published message.
#[derive(Debug, Clone)]
pub struct PublishedMessage {
    pub subject: String,
    pub payload: Bytes,
}

/// Trait for publish operations.
///
/// This allows swapping between real NATS and test mocks.
#[async_trait]
pub trait ProgressPublisher: Send + Sync {
    /// Publish a message to a subject.
    async fn publish(&self, subject: String, payload: Bytes) -> Result<()>;
}

/// Real NATS client publisher.
pub struct NatsProgressPublisher {
    client: async_nats::Client,
}

impl NatsProgressPublisher {
    pub fn new(client: async_nats::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ProgressPublisher for NatsProgressPublisher {
    async fn publish(&self, subject: String, payload: Bytes) -> Result<()> {
        self.client.publish(subject, payload).await?;
        Ok(())
    }
}

/// Mock publisher that records messages for inspection in tests.
#[derive(Default)]
pub struct TestPublisher {
    published: RwLock<Vec<PublishedMessage>>,
    fail_sends: RwLock<bool>,
}

impl TestPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every publish return an error, to exercise the best-effort
    /// path.
    pub fn set_fail_sends(&self, fail: bool) {
        *self.fail_sends.write().unwrap_or_else(|e| e.into_inner()) = fail;
    }

    pub fn published_messages(&self) -> Vec<PublishedMessage> {
        self.published
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn messages_for_subject(&self, subject: &str) -> Vec<PublishedMessage> {
        self.published
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|m| m.subject == subject)
            .cloned()
            .collect()
    }

    pub fn publish_count(&self) -> usize {
        self.published
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    pub fn was_published_to(&self, subject: &str) -> bool {
        self.published
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .any(|m| m.subject == subject)
    }

    pub fn clear(&self) {
        self.published
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    /// Deserialize a published payload as JSON.
    pub fn deserialize_message<T: serde::de::DeserializeOwned>(
        &self,
        msg: &PublishedMessage,
    ) -> std::result::Result<T, serde_json::Error> {
        serde_json::from_slice(&msg.payload)
    }
}

#[async_trait]
impl ProgressPublisher for TestPublisher {
    async fn publish(&self, subject: String, payload: Bytes) -> Result<()> {
        if *self.fail_sends.read().unwrap_or_else(|e| e.into_inner()) {
            anyhow::bail!("publisher unavailable");
        }
        self.published
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(PublishedMessage { subject, payload });
        Ok(())
    }
}
