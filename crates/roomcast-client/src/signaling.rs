//! Client side of the signaling WebSocket.
//!
//! [`SignalingChannel::connect`] dials the server, waits for the
//! `session-bound` frame carrying our connection id, and splits the socket
//! into a writer task (fed by clone-able [`SignalSender`] handles) and a
//! reader task that decodes [`ServerEvent`]s into a channel.

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, warn};

use roomcast_common::{ClientEvent, Error, Result, ServerEvent};

/// Outbound frames buffered before backpressure hits the caller.
const OUTBOX_CAPACITY: usize = 128;
/// Inbound events buffered before the reader task stalls.
const INBOX_CAPACITY: usize = 256;

/// Clone-able handle for sending client events over the socket.
#[derive(Clone)]
pub struct SignalSender {
    tx: mpsc::Sender<Message>,
}

impl SignalSender {
    /// Sender wired to a bare channel instead of a socket, with the
    /// receiving end returned for inspection.
    #[cfg(test)]
    pub(crate) fn test_channel() -> (Self, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(OUTBOX_CAPACITY);
        (Self { tx }, rx)
    }

    pub async fn send(&self, event: &ClientEvent) -> Result<()> {
        let text = serde_json::to_string(event).map_err(Error::serialization)?;
        self.tx
            .send(Message::Text(text))
            .await
            .map_err(|_| Error::signaling("signaling connection closed"))
    }
}

/// An established signaling connection.
pub struct SignalingChannel {
    connection_id: String,
    sender: SignalSender,
    events: mpsc::Receiver<ServerEvent>,
}

impl SignalingChannel {
    /// Dial `url` (e.g. `ws://127.0.0.1:5000/ws`) and wait for the server to
    /// bind a connection id to this session.
    pub async fn connect(url: &str) -> Result<Self> {
        let (ws, _) = connect_async(url).await.map_err(Error::signaling)?;
        let (mut write, mut read) = ws.split();

        let (out_tx, mut out_rx) = mpsc::channel::<Message>(OUTBOX_CAPACITY);
        tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                if write.send(msg).await.is_err() {
                    break;
                }
            }
            let _ = write.close().await;
        });

        let (event_tx, mut events) = mpsc::channel::<ServerEvent>(INBOX_CAPACITY);
        tokio::spawn(async move {
            while let Some(frame) = read.next().await {
                let msg = match frame {
                    Ok(msg) => msg,
                    Err(err) => {
                        debug!("signaling read error: {}", err);
                        break;
                    }
                };
                let text = match msg {
                    Message::Text(text) => text,
                    Message::Close(_) => break,
                    _ => continue,
                };
                match serde_json::from_str::<ServerEvent>(&text) {
                    Ok(event) => {
                        if event_tx.send(event).await.is_err() {
                            break;
                        }
                    }
                    Err(err) => warn!("ignoring unparseable server frame: {}", err),
                }
            }
        });

        // The server binds the session before anything else can arrive.
        let connection_id = match events.recv().await {
            Some(ServerEvent::SessionBound { connection_id }) => connection_id,
            Some(other) => {
                return Err(Error::signaling(format!(
                    "expected session-bound, got {other:?}"
                )))
            }
            None => return Err(Error::signaling("connection closed during handshake")),
        };
        debug!("session bound as {}", connection_id);

        Ok(Self {
            connection_id,
            sender: SignalSender { tx: out_tx },
            events,
        })
    }

    /// The server-assigned id identifying us in rosters and relayed frames.
    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    pub fn sender(&self) -> SignalSender {
        self.sender.clone()
    }

    /// Next decoded server event; `None` once the connection is gone.
    pub async fn recv(&mut self) -> Option<ServerEvent> {
        self.events.recv().await
    }
}
