use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

use parley_types::events::{ClientCommand, ServerEvent};

use crate::room::Room;

/// Heartbeat interval: server sends a Ping every 15 seconds.
/// If 2 consecutive Pongs are missed (~30s), the connection is dropped.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// Handle a single WebSocket connection for its whole lifetime.
///
/// The connection starts unregistered: broadcasts are withheld until a
/// `Register` command is acknowledged with `ok: true`. Registration replays
/// the full history to this connection and re-broadcasts the presence list
/// to everyone.
pub async fn handle_connection(socket: WebSocket, room: Room) {
    let conn_id = Uuid::new_v4();
    let (mut sender, mut receiver) = socket.split();

    info!("connection {} opened", conn_id);

    // Targeted events (acks, history replay) bypass the broadcast channel.
    let (conn_tx, mut conn_rx) = mpsc::unbounded_channel::<ServerEvent>();
    let mut broadcast_rx = room.subscribe();

    let registered = Arc::new(AtomicBool::new(false));
    let registered_send = registered.clone();

    let pong_received = Arc::new(AtomicBool::new(true));
    let pong_flag_send = pong_received.clone();
    let pong_flag_recv = pong_received.clone();

    // Forward broadcasts + targeted events -> client, with heartbeat.
    let mut send_task = tokio::spawn(async move {
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.tick().await;
        let mut missed_heartbeats: u8 = 0;

        loop {
            tokio::select! {
                result = broadcast_rx.recv() => {
                    let event = match result {
                        Ok(event) => event,
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            warn!("connection {} lagged by {} events", conn_id, n);
                            continue;
                        }
                        Err(_) => break,
                    };

                    // No session, no traffic.
                    if !registered_send.load(Ordering::Acquire) {
                        continue;
                    }

                    let text = serde_json::to_string(&event)
                        .expect("server event serialization cannot fail");
                    if sender.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                result = conn_rx.recv() => {
                    let event = match result {
                        Some(event) => event,
                        None => break,
                    };
                    let text = serde_json::to_string(&event)
                        .expect("server event serialization cannot fail");
                    if sender.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                _ = heartbeat.tick() => {
                    if pong_flag_send.swap(false, Ordering::Acquire) {
                        missed_heartbeats = 0;
                    } else {
                        missed_heartbeats += 1;
                        if missed_heartbeats >= 2 {
                            warn!(
                                "connection {} heartbeat timeout (missed {} pongs)",
                                conn_id, missed_heartbeats
                            );
                            break;
                        }
                    }
                    if sender.send(Message::Ping(vec![].into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    // Read commands from the client.
    let room_recv = room.clone();
    let registered_recv = registered.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => match serde_json::from_str::<ClientCommand>(&text) {
                    Ok(cmd) => {
                        handle_command(&room_recv, conn_id, cmd, &conn_tx, &registered_recv).await;
                    }
                    Err(e) => {
                        warn!(
                            "connection {} bad command: {} -- raw: {}",
                            conn_id,
                            e,
                            text.chars().take(200).collect::<String>()
                        );
                    }
                },
                Message::Pong(_) => {
                    pong_flag_recv.store(true, Ordering::Release);
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    room.remove_client(conn_id).await;
    info!("connection {} closed", conn_id);
}

async fn handle_command(
    room: &Room,
    conn_id: Uuid,
    cmd: ClientCommand,
    conn_tx: &mpsc::UnboundedSender<ServerEvent>,
    registered: &AtomicBool,
) {
    match cmd {
        ClientCommand::Register { username } => {
            match room.register_client(conn_id, &username).await {
                Ok(history) => {
                    info!("connection {} registered as {}", conn_id, username.trim());
                    let _ = conn_tx.send(ServerEvent::RegisterAck { ok: true, error: None });
                    // History goes only to this connection; the ack must
                    // arrive first so the client resets its view before
                    // the replay lands.
                    let _ = conn_tx.send(ServerEvent::History(history));
                    // The room's Clients broadcast raced the registered
                    // flag and may have been withheld; deliver a presence
                    // snapshot directly so this connection never starts
                    // with an empty list.
                    let _ = conn_tx.send(ServerEvent::Clients(room.client_names().await));
                    registered.store(true, Ordering::Release);
                }
                Err(error) => {
                    warn!("connection {} register rejected: {}", conn_id, error);
                    let _ = conn_tx.send(ServerEvent::RegisterAck {
                        ok: false,
                        error: Some(error),
                    });
                }
            }
        }

        ClientCommand::Message { text } => {
            if !registered.load(Ordering::Acquire) {
                warn!("connection {} sent message before registering", conn_id);
                return;
            }
            room.post_text(conn_id, &text).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn register(
        room: &Room,
        conn_id: Uuid,
        username: &str,
    ) -> (mpsc::UnboundedReceiver<ServerEvent>, Arc<AtomicBool>) {
        let (conn_tx, conn_rx) = mpsc::unbounded_channel();
        let registered = Arc::new(AtomicBool::new(false));
        handle_command(
            room,
            conn_id,
            ClientCommand::Register {
                username: username.to_string(),
            },
            &conn_tx,
            &registered,
        )
        .await;
        (conn_rx, registered)
    }

    #[tokio::test]
    async fn registration_delivers_ack_history_then_presence() {
        let room = Room::new();
        let (mut rx, registered) = register(&room, Uuid::new_v4(), "alice").await;

        assert!(matches!(
            rx.recv().await,
            Some(ServerEvent::RegisterAck { ok: true, .. })
        ));
        assert!(matches!(rx.recv().await, Some(ServerEvent::History(_))));
        // The presence snapshot arrives on the targeted channel: the room's
        // own Clients broadcast fires while this connection is still
        // withholding broadcasts, so without the snapshot the client would
        // sit on an empty list until the next join or leave.
        match rx.recv().await {
            Some(ServerEvent::Clients(names)) => assert_eq!(names, ["alice"]),
            other => panic!("expected presence snapshot, got {:?}", other),
        }
        assert!(registered.load(Ordering::Acquire));
    }

    #[tokio::test]
    async fn second_joiner_sees_everyone_already_present() {
        let room = Room::new();
        let _ = register(&room, Uuid::new_v4(), "alice").await;
        let (mut rx, _) = register(&room, Uuid::new_v4(), "bob").await;

        let _ = rx.recv().await; // ack
        let _ = rx.recv().await; // history
        match rx.recv().await {
            Some(ServerEvent::Clients(names)) => assert_eq!(names, ["alice", "bob"]),
            other => panic!("expected presence snapshot, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn rejected_registration_leaves_flag_unset() {
        let room = Room::new();
        let (mut rx, registered) = register(&room, Uuid::new_v4(), "   ").await;

        assert!(matches!(
            rx.recv().await,
            Some(ServerEvent::RegisterAck { ok: false, .. })
        ));
        assert!(rx.try_recv().is_err());
        assert!(!registered.load(Ordering::Acquire));
    }
}
