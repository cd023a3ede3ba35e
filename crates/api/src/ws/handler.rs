use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use spheroseg_events::{OutboundMessage, RoomHub};

use crate::error::{AppError, AppResult};
use crate::state::AppState;

/// Query string of `GET /ws`.
#[derive(Debug, Deserialize)]
pub struct WsParams {
    /// Project room to join on connect. Clients without one still receive
    /// service status events.
    pub project_id: Option<String>,
}

/// Room commands a connected client may send as JSON text frames.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
enum ClientCommand {
    JoinProject {
        #[serde(rename = "projectId")]
        project_id: String,
    },
    LeaveProject {
        #[serde(rename = "projectId")]
        project_id: String,
    },
}

/// HTTP handler that upgrades the connection to WebSocket.
pub async fn ws_handler(
    Query(params): Query<WsParams>,
    State(state): State<AppState>,
    ws: WebSocketUpgrade,
) -> AppResult<impl IntoResponse> {
    let project_id = match params.project_id {
        Some(id) if id.trim().is_empty() => {
            return Err(AppError::BadRequest("project_id must not be empty".into()));
        }
        Some(id) => Some(id.trim().to_string()),
        None => None,
    };
    Ok(ws.on_upgrade(move |socket| handle_socket(socket, state.hub, project_id)))
}

/// Manage a single WebSocket connection after upgrade.
///
/// Splits the socket into a sink (outbound) and stream (inbound), then:
///   1. Registers the connection with the hub and joins the project room.
///   2. Spawns a sender task that forwards hub messages to the sink.
///   3. Processes inbound room commands on the current task.
///   4. Cleans up on disconnect.
async fn handle_socket(socket: WebSocket, hub: Arc<RoomHub>, project_id: Option<String>) {
    let conn_id = uuid::Uuid::new_v4().to_string();
    tracing::info!(conn_id = %conn_id, project_id = ?project_id, "WebSocket connected");

    let mut rx = hub.add(conn_id.clone()).await;
    if let Some(room) = &project_id {
        hub.join(&conn_id, room).await;
    }

    let (mut sink, mut stream) = socket.split();

    // Sender task: forward hub messages to the WebSocket sink.
    let sender_conn_id = conn_id.clone();
    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let closing = matches!(msg, OutboundMessage::Close);
            if sink.send(to_ws_message(msg)).await.is_err() {
                tracing::debug!(conn_id = %sender_conn_id, "WebSocket sink closed");
                break;
            }
            if closing {
                break;
            }
        }
    });

    // Receiver loop: process inbound messages.
    while let Some(result) = stream.next().await {
        match result {
            Ok(Message::Close(_)) => break,
            Ok(Message::Pong(_)) => {
                tracing::trace!(conn_id = %conn_id, "Pong received");
            }
            Ok(Message::Text(text)) => match serde_json::from_str::<ClientCommand>(text.as_str()) {
                Ok(ClientCommand::JoinProject { project_id }) => {
                    hub.join(&conn_id, &project_id).await;
                }
                Ok(ClientCommand::LeaveProject { project_id }) => {
                    hub.leave(&conn_id, &project_id).await;
                }
                Err(e) => {
                    tracing::debug!(conn_id = %conn_id, error = %e, "Ignoring unknown client message");
                }
            },
            Ok(_) => {}
            Err(e) => {
                tracing::debug!(conn_id = %conn_id, error = %e, "WebSocket receive error");
                break;
            }
        }
    }

    // Clean up: remove connection and abort sender task.
    hub.remove(&conn_id).await;
    send_task.abort();
    tracing::info!(conn_id = %conn_id, "WebSocket disconnected");
}

fn to_ws_message(msg: OutboundMessage) -> Message {
    match msg {
        OutboundMessage::Ping => Message::Ping(Default::default()),
        OutboundMessage::Close => Message::Close(None),
        event => Message::Text(event.to_text().unwrap_or_default().into()),
    }
}
