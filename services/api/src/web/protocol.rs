//! services/api/src/web/protocol.rs
//!
//! Defines the WebSocket messages pushed to clients following a document run.
//! The channel is server-to-client only; anything the client sends apart from
//! a close frame is ignored.

use crate::adapters::StatusEvent;
use serde::Serialize;
use uuid::Uuid;

/// Represents the structured text messages the server can send to the client.
#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    /// A status snapshot. Sent once on connect and after every store write.
    Status {
        document_id: Uuid,
        status: String,
        progress: f64,
        #[serde(skip_serializing_if = "Option::is_none")]
        error_message: Option<String>,
    },

    /// Reports a problem with the subscription itself; the socket closes after it.
    Error { message: String },
}

impl From<StatusEvent> for ServerMessage {
    fn from(event: StatusEvent) -> Self {
        ServerMessage::Status {
            document_id: event.document_id,
            status: event.status.to_string(),
            progress: event.progress,
            error_message: event.error_message,
        }
    }
}
