use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{info, warn};

use parley_types::events::{ClientCommand, ServerEvent};

use crate::connection::{ConnectionState, GatewayTransport};
use crate::registration::{Attempt, Registrar, RegistrationError};
use crate::timeline::{Timeline, TimelineUpdate};

/// Delay between reconnect attempts, doubling up to the cap.
const RECONNECT_BASE: Duration = Duration::from_secs(1);
const RECONNECT_CAP: Duration = Duration::from_secs(10);

/// Everything the view layer needs to react to, in order.
#[derive(Debug, Clone)]
pub enum SessionUpdate {
    Timeline(TimelineUpdate),
    /// Registration succeeded; the login mask can come down.
    Ready { username: String },
    /// Transport lost; show the blocking banner.
    ConnectionLost,
    /// Transport re-established (the banner clears on the next `Ready`).
    ConnectionRestored,
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("not registered")]
    NotRegistered,

    #[error("not connected")]
    NotConnected,

    #[error("connection closed")]
    ChannelClosed,
}

/// One client's chat session: registration state, cached identity, the
/// reconciliation timeline, and the current transport. The session is the
/// single writer of the timeline; every server event funnels through
/// [`ChatSession::handle_event`].
pub struct ChatSession {
    registrar: Registrar,
    timeline: Arc<Mutex<Timeline>>,
    /// Display name accepted by the server, kept across disconnects for
    /// automatic re-registration.
    identity: Mutex<Option<String>>,
    state: Mutex<ConnectionState>,
    cmd_tx: Mutex<Option<mpsc::UnboundedSender<ClientCommand>>>,
    updates_tx: mpsc::UnboundedSender<SessionUpdate>,
}

impl ChatSession {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<SessionUpdate>) {
        Self::with_registrar(Registrar::new())
    }

    pub fn with_registrar(
        registrar: Registrar,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<SessionUpdate>) {
        let (updates_tx, updates_rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                registrar,
                timeline: Arc::new(Mutex::new(Timeline::new())),
                identity: Mutex::new(None),
                state: Mutex::new(ConnectionState::Disconnected),
                cmd_tx: Mutex::new(None),
                updates_tx,
            }),
            updates_rx,
        )
    }

    /// Shared timeline handle, e.g. for the upload manager.
    pub fn timeline(&self) -> Arc<Mutex<Timeline>> {
        self.timeline.clone()
    }

    pub fn updates_sender(&self) -> mpsc::UnboundedSender<SessionUpdate> {
        self.updates_tx.clone()
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock().expect("session state lock poisoned")
    }

    fn set_state(&self, state: ConnectionState) {
        *self.state.lock().expect("session state lock poisoned") = state;
    }

    /// Cached identity from the last successful registration.
    pub fn identity(&self) -> Option<String> {
        self.identity.lock().expect("identity lock poisoned").clone()
    }

    /// Connect, auto-register if an identity is cached, and pump events
    /// until the process ends. Reconnects with backoff on transport loss.
    pub async fn run(self: Arc<Self>, url: String) {
        let mut backoff = RECONNECT_BASE;
        loop {
            self.set_state(ConnectionState::Connecting);
            let mut transport = match GatewayTransport::connect(&url).await {
                Ok(transport) => transport,
                Err(e) => {
                    warn!("connect to {} failed: {}", url, e);
                    self.set_state(ConnectionState::Disconnected);
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(RECONNECT_CAP);
                    continue;
                }
            };
            backoff = RECONNECT_BASE;

            self.clone().attach_transport(transport.sender());

            while let Some(event) = transport.next_event().await {
                self.handle_event(event);
            }

            self.transport_lost();
            tokio::time::sleep(backoff).await;
        }
    }

    /// Adopt a fresh transport. If an identity is cached, replay the
    /// registration automatically; its failure is logged, never surfaced.
    pub fn attach_transport(self: Arc<Self>, cmd_tx: mpsc::UnboundedSender<ClientCommand>) {
        *self.cmd_tx.lock().expect("command sender lock poisoned") = Some(cmd_tx);
        self.set_state(ConnectionState::Connected);
        let _ = self.updates_tx.send(SessionUpdate::ConnectionRestored);

        if let Some(username) = self.identity() {
            let session = Arc::clone(&self);
            tokio::spawn(async move {
                match session.register(&username, Attempt::Automatic).await {
                    Ok(()) => info!("re-registered as {}", username),
                    // A transient replay failure must not alarm the user.
                    Err(e) => warn!("automatic re-register as {} failed: {}", username, e),
                }
            });
        }
    }

    /// Transport died: drop registered state but keep the cached identity.
    pub fn transport_lost(&self) {
        *self.cmd_tx.lock().expect("command sender lock poisoned") = None;
        self.set_state(ConnectionState::Disconnected);
        self.registrar.abort_pending();
        let _ = self.updates_tx.send(SessionUpdate::ConnectionLost);
    }

    /// Route one server event. Each event mutates the timeline atomically
    /// under its lock; acks go to the registrar's outcome cell.
    pub fn handle_event(&self, event: ServerEvent) {
        match event {
            ServerEvent::RegisterAck { ok, error } => {
                self.registrar.deliver_ack(ok, error);
            }
            ServerEvent::History(msgs) => {
                let updates = {
                    let mut timeline = self.timeline.lock().expect("timeline lock poisoned");
                    timeline.apply_history(msgs)
                };
                for update in updates {
                    let _ = self.updates_tx.send(SessionUpdate::Timeline(update));
                }
            }
            ServerEvent::Message(msg) => {
                let update = {
                    let mut timeline = self.timeline.lock().expect("timeline lock poisoned");
                    timeline.apply_message(msg)
                };
                if let Some(update) = update {
                    let _ = self.updates_tx.send(SessionUpdate::Timeline(update));
                }
            }
            ServerEvent::Clients(names) => {
                let update = {
                    let mut timeline = self.timeline.lock().expect("timeline lock poisoned");
                    timeline.apply_clients(names)
                };
                let _ = self.updates_tx.send(SessionUpdate::Timeline(update));
            }
        }
    }

    /// User-initiated login.
    pub async fn login(&self, username: &str) -> Result<(), RegistrationError> {
        self.register(username, Attempt::Manual).await
    }

    async fn register(&self, username: &str, attempt: Attempt) -> Result<(), RegistrationError> {
        match self.state() {
            ConnectionState::Connected | ConnectionState::Registered => {}
            _ => return Err(RegistrationError::ChannelClosed),
        }

        let cmd_tx = self
            .cmd_tx
            .lock()
            .expect("command sender lock poisoned")
            .clone();
        let Some(cmd_tx) = cmd_tx else {
            return Err(RegistrationError::ChannelClosed);
        };

        let accepted = self
            .registrar
            .register(username, |name| {
                cmd_tx.send(ClientCommand::Register {
                    username: name.to_string(),
                })
            })
            .await?;

        *self.identity.lock().expect("identity lock poisoned") = Some(accepted.clone());
        self.set_state(ConnectionState::Registered);
        if attempt == Attempt::Automatic {
            info!("session restored as {}", accepted);
        }
        let _ = self.updates_tx.send(SessionUpdate::Ready { username: accepted });
        Ok(())
    }

    /// Post a text message. Fire-and-forget: the broadcast is the echo.
    pub fn send_text(&self, text: &str) -> Result<(), SessionError> {
        if self.state() != ConnectionState::Registered {
            return Err(SessionError::NotRegistered);
        }
        let cmd_tx = self
            .cmd_tx
            .lock()
            .expect("command sender lock poisoned")
            .clone()
            .ok_or(SessionError::NotConnected)?;
        cmd_tx
            .send(ClientCommand::Message {
                text: text.to_string(),
            })
            .map_err(|_| SessionError::ChannelClosed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_types::models::{ChatMessage, FileMeta};

    fn file_msg(msg_id: &str, file_id: &str, client_msg_id: Option<&str>) -> ChatMessage {
        ChatMessage::file(
            msg_id.into(),
            "alice".into(),
            "09:00:00".into(),
            FileMeta {
                file_id: file_id.into(),
                original_name: "a.bin".into(),
                mime: "application/octet-stream".into(),
                size: 1,
                url: format!("/media/{}", file_id),
            },
            client_msg_id.map(Into::into),
        )
    }

    /// Wire a session to fake channels, as the tests' stand-in transport.
    fn connected_session() -> (
        Arc<ChatSession>,
        mpsc::UnboundedReceiver<SessionUpdate>,
        mpsc::UnboundedReceiver<ClientCommand>,
    ) {
        let (session, updates_rx) = ChatSession::new();
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        session.clone().attach_transport(cmd_tx);
        (session, updates_rx, cmd_rx)
    }

    #[tokio::test]
    async fn login_roundtrip_emits_ready() {
        let (session, mut updates_rx, mut cmd_rx) = connected_session();

        let s = session.clone();
        let login = tokio::spawn(async move { s.login("alice").await });

        // The register command went out exactly once.
        let cmd = cmd_rx.recv().await.unwrap();
        assert!(matches!(cmd, ClientCommand::Register { username } if username == "alice"));

        session.handle_event(ServerEvent::RegisterAck { ok: true, error: None });
        login.await.unwrap().unwrap();

        assert_eq!(session.state(), ConnectionState::Registered);
        assert_eq!(session.identity().as_deref(), Some("alice"));

        // ConnectionRestored from attach, then Ready.
        assert!(matches!(
            updates_rx.recv().await,
            Some(SessionUpdate::ConnectionRestored)
        ));
        assert!(matches!(
            updates_rx.recv().await,
            Some(SessionUpdate::Ready { username }) if username == "alice"
        ));
    }

    #[tokio::test]
    async fn send_text_requires_registration() {
        let (session, _updates_rx, _cmd_rx) = connected_session();
        assert!(matches!(
            session.send_text("hi"),
            Err(SessionError::NotRegistered)
        ));
    }

    #[tokio::test]
    async fn events_flow_into_timeline_updates() {
        let (session, mut updates_rx, _cmd_rx) = connected_session();
        let _ = updates_rx.recv().await; // ConnectionRestored

        session.handle_event(ServerEvent::Message(file_msg("m1", "f1", None)));
        assert!(matches!(
            updates_rx.recv().await,
            Some(SessionUpdate::Timeline(TimelineUpdate::Appended(_)))
        ));

        // Duplicate delivery produces no update at all.
        session.handle_event(ServerEvent::Message(file_msg("m1", "f1", None)));
        session.handle_event(ServerEvent::Clients(vec!["alice".into()]));
        match updates_rx.recv().await {
            Some(SessionUpdate::Timeline(TimelineUpdate::Presence(names))) => {
                assert_eq!(names, ["alice"]);
            }
            other => panic!("expected presence update, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn transport_loss_clears_registration_keeps_identity() {
        let (session, _updates_rx, _cmd_rx) = connected_session();

        let s = session.clone();
        let login = tokio::spawn(async move { s.login("alice").await });
        while !matches!(session.state(), ConnectionState::Registered) {
            session.handle_event(ServerEvent::RegisterAck { ok: true, error: None });
            tokio::task::yield_now().await;
            if login.is_finished() {
                break;
            }
        }
        login.await.unwrap().ok();

        session.transport_lost();
        assert_eq!(session.state(), ConnectionState::Disconnected);
        assert_eq!(session.identity().as_deref(), Some("alice"));
        assert!(matches!(
            session.send_text("hi"),
            Err(SessionError::NotRegistered)
        ));
    }

    #[tokio::test]
    async fn reconnect_replays_registration_automatically() {
        let (session, _updates_rx, mut cmd_rx) = connected_session();

        // First (manual) registration.
        let s = session.clone();
        let login = tokio::spawn(async move { s.login("alice").await });
        let _ = cmd_rx.recv().await;
        session.handle_event(ServerEvent::RegisterAck { ok: true, error: None });
        login.await.unwrap().unwrap();

        session.transport_lost();

        // New transport: the session re-registers on its own.
        let (cmd_tx2, mut cmd_rx2) = mpsc::unbounded_channel();
        session.clone().attach_transport(cmd_tx2);
        let cmd = cmd_rx2.recv().await.unwrap();
        assert!(matches!(cmd, ClientCommand::Register { username } if username == "alice"));
    }
}
