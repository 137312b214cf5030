use serde::{Deserialize, Serialize};

use crate::models::ChatMessage;

/// Events sent from the server to clients over the WebSocket gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ServerEvent {
    /// Acknowledgment of a `Register` command. Sent only to the registering
    /// connection, never broadcast.
    RegisterAck {
        ok: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    /// Full message history, replayed to a connection on fresh registration.
    History(Vec<ChatMessage>),

    /// A single message, broadcast to all registered connections.
    Message(ChatMessage),

    /// Full presence list, replacing any prior list on the client.
    Clients(Vec<String>),
}

/// Commands sent from a client to the server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ClientCommand {
    /// Claim a display name. Acknowledged with `ServerEvent::RegisterAck`.
    Register { username: String },

    /// Post a text message. Not acknowledged; the broadcast is the echo.
    Message { text: String },
}
