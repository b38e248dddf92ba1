//! WebSocket endpoint for real-time workflow progress updates.
//!
//! GET /ws/progress/:project_id?workflow_id=...
//!
//! Connecting subscribes to every workflow of the project; the optional
//! `workflow_id` query adds a per-workflow subscription. The socket task
//! owns both halves of the connection: unsolicited frames arrive from
//! the registry through an mpsc channel, and client actions (subscribe,
//! ping, get_status) are handled inline. Any transport error tears down
//! just this connection.

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Extension, Path, Query, WebSocketUpgrade,
    },
    response::Response,
    Json,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::kernel::workflow::ProgressUpdate;
use crate::server::app::AxumAppState;

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    pub workflow_id: Option<String>,
}

/// Message sent by a connected client.
#[derive(Debug, Deserialize)]
pub struct ClientAction {
    pub action: String,
    pub workflow_id: Option<String>,
}

/// GET /ws/progress/:project_id
pub async fn ws_progress_handler(
    Extension(state): Extension<AxumAppState>,
    Path(project_id): Path<i64>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(state, socket, project_id, query.workflow_id))
}

async fn handle_socket(
    state: AxumAppState,
    socket: WebSocket,
    project_id: i64,
    workflow_id: Option<String>,
) {
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel();
    let connection_id = state
        .registry
        .connect(outbound_tx, Some(project_id), workflow_id)
        .await;

    let (mut sink, mut stream) = socket.split();

    loop {
        tokio::select! {
            frame = outbound_rx.recv() => {
                match frame {
                    Some(value) => {
                        if sink.send(Message::Text(value.to_string())).await.is_err() {
                            break;
                        }
                    }
                    // Registry dropped the sender: we were disconnected.
                    None => break,
                }
            }
            incoming = stream.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        handle_client_message(&state, &connection_id, &text).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {} // binary / ping / pong ignored
                    Some(Err(error)) => {
                        warn!(connection_id = %connection_id, error = %error, "websocket error");
                        break;
                    }
                }
            }
        }
    }

    state.registry.disconnect(&connection_id).await;
}

async fn handle_client_message(state: &AxumAppState, connection_id: &str, text: &str) {
    let action: ClientAction = match serde_json::from_str(text) {
        Ok(action) => action,
        Err(error) => {
            debug!(connection_id = %connection_id, error = %error, "unparseable client message");
            return;
        }
    };

    match (action.action.as_str(), action.workflow_id) {
        ("subscribe", Some(workflow_id)) => {
            state
                .registry
                .subscribe_to_workflow(connection_id, &workflow_id)
                .await;
            state
                .registry
                .send_personal(
                    connection_id,
                    serde_json::json!({
                        "type": "subscribed",
                        "workflow_id": workflow_id,
                        "message": format!("Subscribed to workflow {}", workflow_id),
                    }),
                )
                .await;
        }
        ("ping", _) => {
            state
                .registry
                .send_personal(
                    connection_id,
                    serde_json::json!({
                        "type": "pong",
                        "message": "Connection alive",
                    }),
                )
                .await;
        }
        ("get_status", Some(workflow_id)) => {
            let reply = match state.progress.get_progress(&workflow_id).await {
                Ok(Some(progress)) => ProgressUpdate::from_progress(&progress).to_json(),
                Ok(None) => serde_json::json!({
                    "type": "error",
                    "message": format!("Workflow {} not found", workflow_id),
                }),
                Err(error) => {
                    warn!(workflow_id = %workflow_id, error = %error, "get_status read failed");
                    serde_json::json!({
                        "type": "error",
                        "message": "failed to read workflow status",
                    })
                }
            };
            state.registry.send_personal(connection_id, reply).await;
        }
        (other, _) => {
            debug!(connection_id = %connection_id, action = other, "unknown client action");
        }
    }
}

/// GET /ws/connections/status — connection statistics for monitoring.
pub async fn connections_status_handler(
    Extension(state): Extension<AxumAppState>,
) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "active_connections": state.registry.active_connections().await,
        "status": "healthy",
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_actions_parse() {
        let subscribe: ClientAction =
            serde_json::from_str(r#"{"action": "subscribe", "workflow_id": "wf-1"}"#).unwrap();
        assert_eq!(subscribe.action, "subscribe");
        assert_eq!(subscribe.workflow_id.as_deref(), Some("wf-1"));

        let ping: ClientAction = serde_json::from_str(r#"{"action": "ping"}"#).unwrap();
        assert_eq!(ping.action, "ping");
        assert!(ping.workflow_id.is_none());

        assert!(serde_json::from_str::<ClientAction>(r#"{"workflow_id": "wf-1"}"#).is_err());
    }
}
