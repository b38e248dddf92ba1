//! Live-connection registry for push-channel subscribers.
//!
//! Bookkeeping is process-local and owned exclusively by this registry:
//! no other component holds a channel handle. Connections can subscribe
//! to specific workflow ids, to all workflows of a project, or both; a
//! broadcast reaches each connection at most once.
//!
//! The registry writes into each connection's outbound mpsc channel;
//! the WebSocket task on the other end forwards frames to the socket.
//! A failed send means the task is gone, which disconnects that
//! connection from every index it participated in.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};

/// Outbound handle for one connection.
pub type ConnectionSender = mpsc::UnboundedSender<serde_json::Value>;

/// Bookkeeping for one live connection.
struct ConnectionInfo {
    sender: ConnectionSender,
    project_id: Option<i64>,
    workflow_ids: HashSet<String>,
    #[allow(dead_code)]
    connected_at: DateTime<Utc>,
}

#[derive(Default)]
struct RegistryInner {
    connections: HashMap<String, ConnectionInfo>,
    workflow_subscribers: HashMap<String, HashSet<String>>,
    project_subscribers: HashMap<i64, HashSet<String>>,
    connection_counter: u64,
}

impl RegistryInner {
    fn remove(&mut self, connection_id: &str) -> bool {
        let Some(info) = self.connections.remove(connection_id) else {
            return false;
        };

        if let Some(project_id) = info.project_id {
            if let Some(subscribers) = self.project_subscribers.get_mut(&project_id) {
                subscribers.remove(connection_id);
                if subscribers.is_empty() {
                    self.project_subscribers.remove(&project_id);
                }
            }
        }

        for workflow_id in &info.workflow_ids {
            if let Some(subscribers) = self.workflow_subscribers.get_mut(workflow_id) {
                subscribers.remove(connection_id);
                if subscribers.is_empty() {
                    self.workflow_subscribers.remove(workflow_id);
                }
            }
        }

        true
    }
}

/// Registry of live push-channel connections.
///
/// Thread-safe and clone-cheap behind `Arc`; constructed once per
/// serving process and dependency-injected, never ambient.
#[derive(Default)]
pub struct ConnectionRegistry {
    inner: RwLock<RegistryInner>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection whose handshake already succeeded and send
    /// the `connected` acknowledgment. Returns the connection id.
    pub async fn connect(
        &self,
        sender: ConnectionSender,
        project_id: Option<i64>,
        workflow_id: Option<String>,
    ) -> String {
        let connection_id = {
            let mut inner = self.inner.write().await;
            inner.connection_counter += 1;
            let connection_id = format!(
                "conn_{}_{}",
                inner.connection_counter,
                Utc::now().timestamp_millis()
            );

            let mut workflow_ids = HashSet::new();
            if let Some(ref workflow_id) = workflow_id {
                workflow_ids.insert(workflow_id.clone());
                inner
                    .workflow_subscribers
                    .entry(workflow_id.clone())
                    .or_default()
                    .insert(connection_id.clone());
            }
            if let Some(project_id) = project_id {
                inner
                    .project_subscribers
                    .entry(project_id)
                    .or_default()
                    .insert(connection_id.clone());
            }

            inner.connections.insert(
                connection_id.clone(),
                ConnectionInfo {
                    sender,
                    project_id,
                    workflow_ids,
                    connected_at: Utc::now(),
                },
            );
            connection_id
        };

        info!(
            connection_id = %connection_id,
            project_id = ?project_id,
            workflow_id = ?workflow_id,
            "push channel connected"
        );

        self.send_personal(
            &connection_id,
            serde_json::json!({
                "type": "connected",
                "connection_id": connection_id,
                "project_id": project_id,
                "workflow_id": workflow_id,
                "message": "Connected to progress updates",
            }),
        )
        .await;

        connection_id
    }

    /// Remove a connection from every index. Safe to call twice.
    pub async fn disconnect(&self, connection_id: &str) {
        let removed = self.inner.write().await.remove(connection_id);
        if removed {
            info!(connection_id, "push channel disconnected");
        }
    }

    /// Add a workflow subscription. No-op if the connection is gone.
    pub async fn subscribe_to_workflow(&self, connection_id: &str, workflow_id: &str) {
        let mut inner = self.inner.write().await;
        if !inner.connections.contains_key(connection_id) {
            return;
        }

        inner
            .workflow_subscribers
            .entry(workflow_id.to_string())
            .or_default()
            .insert(connection_id.to_string());
        if let Some(info) = inner.connections.get_mut(connection_id) {
            info.workflow_ids.insert(workflow_id.to_string());
        }

        debug!(connection_id, workflow_id, "subscribed to workflow");
    }

    /// Best-effort send to one connection; a transport error disconnects
    /// that connection only.
    pub async fn send_personal(&self, connection_id: &str, message: serde_json::Value) {
        let sender = {
            let inner = self.inner.read().await;
            inner
                .connections
                .get(connection_id)
                .map(|info| info.sender.clone())
        };

        let Some(sender) = sender else { return };
        if sender.send(message).is_err() {
            warn!(connection_id, "send failed, disconnecting");
            self.disconnect(connection_id).await;
        }
    }

    /// Fan a progress update out to the union of the workflow's
    /// subscribers and the project's subscribers; each connection gets
    /// the message at most once. Failed connections are collected and
    /// disconnected after the loop, never aborting the broadcast.
    pub async fn broadcast_workflow_progress(
        &self,
        workflow_id: &str,
        project_id: i64,
        message: serde_json::Value,
    ) {
        let targets = {
            let inner = self.inner.read().await;
            let mut connection_ids: HashSet<String> = HashSet::new();
            if let Some(subscribers) = inner.workflow_subscribers.get(workflow_id) {
                connection_ids.extend(subscribers.iter().cloned());
            }
            if let Some(subscribers) = inner.project_subscribers.get(&project_id) {
                connection_ids.extend(subscribers.iter().cloned());
            }

            connection_ids
                .into_iter()
                .filter_map(|id| {
                    inner
                        .connections
                        .get(&id)
                        .map(|info| (id, info.sender.clone()))
                })
                .collect::<Vec<_>>()
        };

        let mut disconnected = Vec::new();
        for (connection_id, sender) in targets {
            if sender.send(message.clone()).is_err() {
                warn!(connection_id = %connection_id, workflow_id, "broadcast send failed");
                disconnected.push(connection_id);
            }
        }

        for connection_id in disconnected {
            self.disconnect(&connection_id).await;
        }
    }

    /// Send a message to every connection subscribed to a project, with
    /// the same post-loop cleanup discipline.
    pub async fn broadcast_to_project(&self, project_id: i64, message: serde_json::Value) {
        let targets = {
            let inner = self.inner.read().await;
            let Some(subscribers) = inner.project_subscribers.get(&project_id) else {
                return;
            };
            subscribers
                .iter()
                .filter_map(|id| {
                    inner
                        .connections
                        .get(id)
                        .map(|info| (id.clone(), info.sender.clone()))
                })
                .collect::<Vec<_>>()
        };

        let mut disconnected = Vec::new();
        for (connection_id, sender) in targets {
            if sender.send(message.clone()).is_err() {
                warn!(connection_id = %connection_id, project_id, "broadcast send failed");
                disconnected.push(connection_id);
            }
        }

        for connection_id in disconnected {
            self.disconnect(&connection_id).await;
        }
    }

    /// Number of live connections.
    pub async fn active_connections(&self) -> usize {
        self.inner.read().await.connections.len()
    }

    /// Number of connections subscribed to a project.
    pub async fn project_connections(&self, project_id: i64) -> usize {
        self.inner
            .read()
            .await
            .project_subscribers
            .get(&project_id)
            .map(|s| s.len())
            .unwrap_or(0)
    }
}
