use serde::{Deserialize, Serialize};

/// Metadata for a fully assembled upload, as served from `/media/{file_id}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileMeta {
    pub file_id: String,
    pub original_name: String,
    pub mime: String,
    pub size: u64,
    pub url: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Text,
    File,
}

/// A finalized timeline entry, broadcast to every connected client.
///
/// `client_msg_id` is set when the message originated from a local upload,
/// so the sending client can match it against its pending placeholder.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub msg_id: String,
    pub user: String,
    pub text: String,
    pub ts: String,
    pub kind: MessageKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<FileMeta>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_msg_id: Option<String>,
}

impl ChatMessage {
    pub fn text(msg_id: String, user: String, text: String, ts: String) -> Self {
        Self {
            msg_id,
            user,
            text,
            ts,
            kind: MessageKind::Text,
            file: None,
            client_msg_id: None,
        }
    }

    pub fn file(
        msg_id: String,
        user: String,
        ts: String,
        file: FileMeta,
        client_msg_id: Option<String>,
    ) -> Self {
        Self {
            msg_id,
            user,
            text: file.original_name.clone(),
            ts,
            kind: MessageKind::File,
            file: Some(file),
            client_msg_id,
        }
    }

    /// Server-assigned file id, if this is a file message.
    pub fn file_id(&self) -> Option<&str> {
        self.file.as_ref().map(|f| f.file_id.as_str())
    }
}
