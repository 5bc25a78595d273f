//! services/api/src/web/status_ws.rs
//!
//! Push-based progress: a WebSocket that streams a document's status until
//! it reaches `completed` or `error`, then closes.

use crate::adapters::StatusEvent;
use crate::web::{protocol::ServerMessage, state::AppState};
use axum::{
    extract::{
        ws::{Message, WebSocket},
        Path, State, WebSocketUpgrade,
    },
    response::Response,
};
use futures::{
    stream::{SplitSink, StreamExt},
    SinkExt,
};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// The handler for upgrading HTTP requests to WebSocket connections.
pub async fn status_ws_handler(
    ws: WebSocketUpgrade,
    State(app_state): State<Arc<AppState>>,
    Path(document_id): Path<Uuid>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, app_state, document_id))
}

type Sender = SplitSink<WebSocket, Message>;

async fn send(sender: &mut Sender, message: &ServerMessage) -> bool {
    let json = match serde_json::to_string(message) {
        Ok(json) => json,
        Err(e) => {
            error!("Failed to encode server message: {}", e);
            return false;
        }
    };
    sender.send(Message::Text(json.into())).await.is_ok()
}

/// Sends the current snapshot. Returns `false` once the socket should close.
async fn send_snapshot(sender: &mut Sender, app_state: &AppState, document_id: Uuid) -> bool {
    match app_state.store.get_document(document_id).await {
        Ok(document) => {
            let terminal = document.status.is_terminal();
            let message = ServerMessage::from(StatusEvent::from(&document));
            send(sender, &message).await && !terminal
        }
        Err(e) => {
            warn!(document_id = %document_id, error = %e, "Status subscription for unreadable document.");
            let message = ServerMessage::Error {
                message: format!("Document {} not found", document_id),
            };
            send(sender, &message).await;
            false
        }
    }
}

async fn handle_socket(socket: WebSocket, app_state: Arc<AppState>, document_id: Uuid) {
    info!(document_id = %document_id, "Status subscription opened.");
    let (mut sender, mut receiver) = socket.split();

    // Subscribe before the snapshot so no write can slip between the two.
    let mut events = app_state.events.subscribe();

    if !send_snapshot(&mut sender, &app_state, document_id).await {
        let _ = sender.close().await;
        return;
    }

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) if event.document_id == document_id => {
                    let terminal = event.status.is_terminal();
                    if !send(&mut sender, &ServerMessage::from(event)).await || terminal {
                        break;
                    }
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    debug!(document_id = %document_id, skipped, "Subscriber lagged; resending snapshot.");
                    if !send_snapshot(&mut sender, &app_state, document_id).await {
                        break;
                    }
                }
                Err(RecvError::Closed) => break,
            },
            incoming = receiver.next() => match incoming {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => {
                    debug!(document_id = %document_id, "Client went away.");
                    break;
                }
                Some(Ok(_)) => {}
            },
        }
    }

    let _ = sender.close().await;
    info!(document_id = %document_id, "Status subscription closed.");
}
