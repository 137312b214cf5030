use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

use parley_types::events::{ClientCommand, ServerEvent};

/// Lifecycle of the single logical channel to the server. Owned by the
/// client; destroyed and recreated on transport failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Registered,
}

#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error(transparent)]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("connection closed")]
    Closed,
}

/// One live WebSocket to the gateway: a command sender plus a decoded
/// event stream. When the transport dies both ends close; the owner
/// reconnects by building a fresh transport.
pub struct GatewayTransport {
    cmd_tx: mpsc::UnboundedSender<ClientCommand>,
    events_rx: mpsc::Receiver<ServerEvent>,
}

impl GatewayTransport {
    /// Dial the gateway and spawn the read/write pumps.
    pub async fn connect(url: &str) -> Result<Self, ConnectionError> {
        let (ws, _) = connect_async(url).await?;
        let (mut write, mut read) = ws.split();

        let (cmd_tx, mut cmd_rx) = mpsc::unbounded_channel::<ClientCommand>();
        let (event_tx, events_rx) = mpsc::channel::<ServerEvent>(64);

        tokio::spawn(async move {
            while let Some(cmd) = cmd_rx.recv().await {
                let text = serde_json::to_string(&cmd)
                    .expect("client command serialization cannot fail");
                if write.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
        });

        tokio::spawn(async move {
            while let Some(msg) = read.next().await {
                match msg {
                    Ok(Message::Text(text)) => {
                        match serde_json::from_str::<ServerEvent>(text.as_str()) {
                            Ok(event) => {
                                if event_tx.send(event).await.is_err() {
                                    break;
                                }
                            }
                            Err(e) => {
                                warn!(
                                    "bad server event: {} -- raw: {}",
                                    e,
                                    text.chars().take(200).collect::<String>()
                                );
                            }
                        }
                    }
                    // Pings are answered by the protocol layer.
                    Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {}
                    Ok(Message::Close(_)) => {
                        debug!("server closed the connection");
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!("transport error: {}", e);
                        break;
                    }
                }
            }
            // Dropping event_tx closes the event stream, which the session
            // observes as transport loss.
        });

        Ok(Self { cmd_tx, events_rx })
    }

    /// Handle for sending commands. Fails once the transport is gone.
    pub fn sender(&self) -> mpsc::UnboundedSender<ClientCommand> {
        self.cmd_tx.clone()
    }

    /// Next decoded server event; `None` means the transport is gone.
    pub async fn next_event(&mut self) -> Option<ServerEvent> {
        self.events_rx.recv().await
    }
}
