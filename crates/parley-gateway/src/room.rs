use std::collections::HashMap;
use std::sync::Arc;

use chrono::Local;
use tokio::sync::{RwLock, broadcast};
use uuid::Uuid;

use parley_types::events::ServerEvent;
use parley_types::models::{ChatMessage, FileMeta};

/// Longest display name the room accepts.
const MAX_NAME_LEN: usize = 24;

/// Server-side record of one in-flight upload session, created by
/// `/api/upload/init` and consumed by `/api/upload/complete`.
#[derive(Debug, Clone)]
pub struct UploadSession {
    pub filename: String,
    pub size: u64,
    pub mime: String,
    pub client_msg_id: Option<String>,
    pub username: Option<String>,
}

/// All mutable room state, behind one lock so each gateway or upload event
/// observes and mutates it atomically.
#[derive(Default)]
struct RoomState {
    /// Full timeline. Memory only — gone when the process exits.
    messages: Vec<ChatMessage>,
    /// Connected display names in arrival order.
    clients: Vec<(Uuid, String)>,
    upload_sessions: HashMap<String, UploadSession>,
    uploaded_files: HashMap<String, FileMeta>,
}

struct RoomInner {
    broadcast_tx: broadcast::Sender<ServerEvent>,
    state: RwLock<RoomState>,
}

/// Shared handle to the single chat room. Cheap to clone.
#[derive(Clone)]
pub struct Room {
    inner: Arc<RoomInner>,
}

impl Room {
    pub fn new() -> Self {
        let (broadcast_tx, _) = broadcast::channel(1024);
        Self {
            inner: Arc::new(RoomInner {
                broadcast_tx,
                state: RwLock::new(RoomState::default()),
            }),
        }
    }

    /// Subscribe to room broadcasts.
    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.inner.broadcast_tx.subscribe()
    }

    fn broadcast(&self, event: ServerEvent) {
        // No receivers is fine (nobody registered yet).
        let _ = self.inner.broadcast_tx.send(event);
    }

    /// Register a connection under a display name. Re-registering an
    /// existing connection renames it in place. Returns the history
    /// snapshot to replay to this connection.
    pub async fn register_client(
        &self,
        conn_id: Uuid,
        username: &str,
    ) -> Result<Vec<ChatMessage>, String> {
        let username = username.trim();
        if username.is_empty() {
            return Err("display name must not be empty".into());
        }
        if username.chars().count() > MAX_NAME_LEN {
            return Err(format!("display name longer than {} characters", MAX_NAME_LEN));
        }

        let (history, names) = {
            let mut state = self.inner.state.write().await;
            match state.clients.iter_mut().find(|(id, _)| *id == conn_id) {
                Some((_, name)) => *name = username.to_string(),
                None => state.clients.push((conn_id, username.to_string())),
            }
            (state.messages.clone(), Self::names(&state))
        };

        self.broadcast(ServerEvent::Clients(names));
        Ok(history)
    }

    /// Drop a connection. Presence is re-broadcast only if it was registered.
    pub async fn remove_client(&self, conn_id: Uuid) {
        let names = {
            let mut state = self.inner.state.write().await;
            let before = state.clients.len();
            state.clients.retain(|(id, _)| *id != conn_id);
            if state.clients.len() == before {
                return;
            }
            Self::names(&state)
        };
        self.broadcast(ServerEvent::Clients(names));
    }

    pub async fn client_names(&self) -> Vec<String> {
        Self::names(&*self.inner.state.read().await)
    }

    fn names(state: &RoomState) -> Vec<String> {
        state.clients.iter().map(|(_, name)| name.clone()).collect()
    }

    /// Append a text message from a registered connection and broadcast it.
    /// Blank text is dropped without error, matching the wire contract.
    pub async fn post_text(&self, conn_id: Uuid, text: &str) {
        let text = text.trim();
        if text.is_empty() {
            return;
        }

        let msg = {
            let mut state = self.inner.state.write().await;
            let user = state
                .clients
                .iter()
                .find(|(id, _)| *id == conn_id)
                .map(|(_, name)| name.clone())
                .unwrap_or_else(|| "Anonymous".to_string());
            let msg = ChatMessage::text(
                format!("{}-{}", Local::now().timestamp_millis(), conn_id),
                user,
                text.to_string(),
                Local::now().format("%H:%M:%S").to_string(),
            );
            state.messages.push(msg.clone());
            msg
        };
        self.broadcast(ServerEvent::Message(msg));
    }

    /// Record a finalized upload: remember the file, append a file message
    /// carrying the uploader's `client_msg_id`, and broadcast it.
    pub async fn post_file(&self, session: UploadSession, meta: FileMeta) -> ChatMessage {
        let msg = {
            let mut state = self.inner.state.write().await;
            state.uploaded_files.insert(meta.file_id.clone(), meta.clone());
            let msg = ChatMessage::file(
                format!("{}-{}", Local::now().timestamp_millis(), meta.file_id),
                session.username.unwrap_or_else(|| "Anonymous".to_string()),
                Local::now().format("%H:%M:%S").to_string(),
                meta,
                session.client_msg_id,
            );
            state.messages.push(msg.clone());
            msg
        };
        self.broadcast(ServerEvent::Message(msg.clone()));
        msg
    }

    pub async fn create_upload_session(&self, upload_id: String, session: UploadSession) {
        self.inner
            .state
            .write()
            .await
            .upload_sessions
            .insert(upload_id, session);
    }

    pub async fn has_upload_session(&self, upload_id: &str) -> bool {
        self.inner
            .state
            .read()
            .await
            .upload_sessions
            .contains_key(upload_id)
    }

    /// Consume an upload session. A second `complete` for the same id finds
    /// nothing — finalize is single-shot by construction.
    pub async fn take_upload_session(&self, upload_id: &str) -> Option<UploadSession> {
        self.inner
            .state
            .write()
            .await
            .upload_sessions
            .remove(upload_id)
    }

    pub async fn lookup_file(&self, file_id: &str) -> Option<FileMeta> {
        self.inner
            .state
            .read()
            .await
            .uploaded_files
            .get(file_id)
            .cloned()
    }

    pub async fn message_count(&self) -> usize {
        self.inner.state.read().await.messages.len()
    }
}

impl Default for Room {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(file_id: &str) -> FileMeta {
        FileMeta {
            file_id: file_id.into(),
            original_name: "notes.txt".into(),
            mime: "text/plain".into(),
            size: 12,
            url: format!("/media/{}", file_id),
        }
    }

    #[tokio::test]
    async fn register_validates_name() {
        let room = Room::new();
        let conn = Uuid::new_v4();
        assert!(room.register_client(conn, "   ").await.is_err());
        assert!(room.register_client(conn, &"x".repeat(25)).await.is_err());
        assert!(room.register_client(conn, " alice ").await.is_ok());
        assert_eq!(room.client_names().await, vec!["alice".to_string()]);
    }

    #[tokio::test]
    async fn reregister_renames_in_place() {
        let room = Room::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        room.register_client(a, "alice").await.unwrap();
        room.register_client(b, "bob").await.unwrap();
        room.register_client(a, "alice2").await.unwrap();
        // Arrival order preserved after rename.
        assert_eq!(room.client_names().await, vec!["alice2", "bob"]);
    }

    #[tokio::test]
    async fn register_returns_history_snapshot() {
        let room = Room::new();
        let a = Uuid::new_v4();
        room.register_client(a, "alice").await.unwrap();
        room.post_text(a, "hello").await;
        room.post_text(a, "   ").await; // dropped
        let history = room.register_client(Uuid::new_v4(), "bob").await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].text, "hello");
        assert_eq!(history[0].user, "alice");
    }

    #[tokio::test]
    async fn remove_client_broadcasts_presence_once() {
        let room = Room::new();
        let a = Uuid::new_v4();
        room.register_client(a, "alice").await.unwrap();
        let mut rx = room.subscribe();
        room.remove_client(a).await;
        match rx.recv().await.unwrap() {
            ServerEvent::Clients(names) => assert!(names.is_empty()),
            other => panic!("unexpected event: {:?}", other),
        }
        // Removing an unknown connection is silent.
        room.remove_client(Uuid::new_v4()).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn upload_session_is_consumed_once() {
        let room = Room::new();
        let session = UploadSession {
            filename: "notes.txt".into(),
            size: 12,
            mime: "text/plain".into(),
            client_msg_id: Some("c1".into()),
            username: Some("alice".into()),
        };
        room.create_upload_session("u1".into(), session).await;
        assert!(room.has_upload_session("u1").await);
        assert!(room.take_upload_session("u1").await.is_some());
        assert!(room.take_upload_session("u1").await.is_none());
    }

    #[tokio::test]
    async fn post_file_carries_client_msg_id() {
        let room = Room::new();
        let session = UploadSession {
            filename: "notes.txt".into(),
            size: 12,
            mime: "text/plain".into(),
            client_msg_id: Some("c1".into()),
            username: None,
        };
        let msg = room.post_file(session, meta("f1")).await;
        assert_eq!(msg.client_msg_id.as_deref(), Some("c1"));
        assert_eq!(msg.user, "Anonymous");
        assert_eq!(msg.file_id(), Some("f1"));
        assert!(room.lookup_file("f1").await.is_some());
        assert_eq!(room.message_count().await, 1);
    }
}
