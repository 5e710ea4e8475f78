//! WebSocket signaling: one ordered channel per client connection.
//!
//! Each socket gets a bounded outbox task; inbound events mutate the room
//! registry and the resulting broadcasts are fanned out best-effort with
//! `try_send`. Directed WebRTC envelopes are routed to `target_id` only,
//! with `sender_id` forced to the sending connection's real id; a client's
//! self-declared identity is never trusted.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use roomcast_common::{ClientEvent, ServerEvent};

use crate::registry::{ConnectionId, DepartureReason, DepartureUpdate, RoomRegistry, RosterUpdate};
use crate::AppState;

/// Default per-connection outbox depth; overridable via the server args.
pub const DEFAULT_OUTBOX_CAPACITY: usize = 128;
const WS_MAX_TEXT_BYTES: usize = 64 * 1024;
const WS_MAX_MESSAGES_PER_MINUTE: u32 = 600;

/// Live connections by id; the value is the connection's outbox.
pub type ConnectionMap = Arc<RwLock<HashMap<ConnectionId, mpsc::Sender<Message>>>>;

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.max_message_size(WS_MAX_TEXT_BYTES)
        .max_frame_size(WS_MAX_TEXT_BYTES)
        .on_upgrade(move |socket| {
            handle_socket(
                socket,
                state.registry,
                state.connections,
                state.outbox_capacity,
            )
        })
}

async fn handle_socket(
    stream: WebSocket,
    registry: Arc<RoomRegistry>,
    connections: ConnectionMap,
    outbox_capacity: usize,
) {
    let conn_id: ConnectionId = Uuid::new_v4().to_string();
    info!("client connected: {}", conn_id);

    let (mut sender, mut receiver) = stream.split();
    let (tx, mut rx) = mpsc::channel::<Message>(outbox_capacity);
    let (disconnect_tx, mut disconnect_rx) = mpsc::channel::<()>(1);

    tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if sender.send(msg).await.is_err() {
                break;
            }
        }
        let _ = disconnect_tx.try_send(());
    });

    connections.write().await.insert(conn_id.clone(), tx.clone());

    // The browser protocol relied on socket.io handing each client its id;
    // here it is an explicit first event.
    let _ = send_event(
        &tx,
        &ServerEvent::SessionBound {
            connection_id: conn_id.clone(),
        },
    )
    .await;

    let mut message_window_start = Instant::now();
    let mut message_count: u32 = 0;

    loop {
        tokio::select! {
            _ = disconnect_rx.recv() => {
                break;
            }
            msg = receiver.next() => {
                let Some(msg) = msg else { break; };
                let Ok(msg) = msg else { break; };

                let now = Instant::now();
                if now.duration_since(message_window_start) >= Duration::from_secs(60) {
                    message_window_start = now;
                    message_count = 0;
                }
                message_count = message_count.saturating_add(1);
                if message_count > WS_MAX_MESSAGES_PER_MINUTE {
                    warn!("rate limit exceeded for {}", conn_id);
                    break;
                }

                let text = match msg {
                    Message::Text(text) => text,
                    Message::Close(_) => break,
                    Message::Ping(_) | Message::Pong(_) => continue,
                    Message::Binary(_) => {
                        warn!("dropping binary frame from {}", conn_id);
                        continue;
                    }
                };

                if text.len() > WS_MAX_TEXT_BYTES {
                    warn!("dropping oversized frame from {}", conn_id);
                    continue;
                }

                let event: ClientEvent = match serde_json::from_str(&text) {
                    Ok(event) => event,
                    Err(err) => {
                        warn!("invalid event from {}: {}", conn_id, err);
                        continue;
                    }
                };

                dispatch(event, &conn_id, &registry, &connections).await;
            }
        }
    }

    connections.write().await.remove(&conn_id);
    info!("client disconnected: {}", conn_id);

    // Transport loss is handled exactly like an explicit leave from every
    // room this connection joined.
    for update in registry.disconnect(&conn_id).await {
        fan_out_departure(&connections, update).await;
    }
}

async fn dispatch(
    event: ClientEvent,
    conn_id: &str,
    registry: &RoomRegistry,
    connections: &ConnectionMap,
) {
    match event {
        ClientEvent::JoinRoom { room_id, user_name } => {
            let update = registry.join(&room_id, conn_id, &user_name).await;
            info!("{} joined room {}", user_name, room_id);
            fan_out_roster(connections, update).await;
        }

        ClientEvent::StartPresenting { room_id, user_name } => {
            let Some(update) = registry
                .set_presenting(&room_id, conn_id, &user_name, true)
                .await
            else {
                return;
            };
            let members = update.members.clone();
            fan_out_roster(connections, update).await;
            broadcast_except(
                connections,
                &members,
                conn_id,
                &ServerEvent::PresenterStarted {
                    presenter_id: conn_id.to_string(),
                    presenter_name: user_name,
                },
            )
            .await;
        }

        ClientEvent::StopPresenting { room_id, user_name } => {
            let Some(update) = registry
                .set_presenting(&room_id, conn_id, &user_name, false)
                .await
            else {
                return;
            };
            let members = update.members.clone();
            fan_out_roster(connections, update).await;
            broadcast_except(
                connections,
                &members,
                conn_id,
                &ServerEvent::PresenterStopped {
                    presenter_id: conn_id.to_string(),
                },
            )
            .await;
        }

        ClientEvent::SendMessage {
            room_id,
            message,
            user_name,
            user_id: _,
        } => {
            // Sender id is the real connection id, never the claimed one.
            let Some((members, message)) = registry
                .append_message(&room_id, conn_id, &user_name, &message)
                .await
            else {
                return;
            };
            broadcast(connections, &members, &ServerEvent::NewMessage(message)).await;
        }

        ClientEvent::WebrtcOffer {
            offer, target_id, ..
        } => {
            relay_to(
                connections,
                &target_id,
                &ServerEvent::WebrtcOffer {
                    offer,
                    sender_id: conn_id.to_string(),
                },
            )
            .await;
        }

        ClientEvent::WebrtcAnswer {
            answer, target_id, ..
        } => {
            relay_to(
                connections,
                &target_id,
                &ServerEvent::WebrtcAnswer {
                    answer,
                    sender_id: conn_id.to_string(),
                },
            )
            .await;
        }

        ClientEvent::WebrtcIceCandidate {
            candidate,
            target_id,
            ..
        } => {
            relay_to(
                connections,
                &target_id,
                &ServerEvent::WebrtcIceCandidate {
                    candidate,
                    sender_id: conn_id.to_string(),
                },
            )
            .await;
        }

        ClientEvent::LeaveRoom { room_id, .. } => {
            if let Some(update) = registry
                .leave_room(&room_id, conn_id, DepartureReason::Left)
                .await
            {
                fan_out_departure(connections, update).await;
            }
        }

        ClientEvent::ConnectionStatusUpdate { room_id, status } => {
            if let Some(update) = registry
                .set_connection_status(&room_id, conn_id, status)
                .await
            {
                fan_out_roster(connections, update).await;
            }
        }

        ClientEvent::RequestStreamRefresh {
            room_id,
            requester_id,
        } => {
            let Some(presenter) = registry.find_presenter(&room_id).await else {
                debug!("stream refresh requested but no presenter in {}", room_id);
                return;
            };
            relay_to(
                connections,
                &presenter,
                &ServerEvent::RefreshStreamForViewer {
                    viewer_id: requester_id,
                    room_id,
                },
            )
            .await;
        }
    }
}

fn to_ws_message(event: &ServerEvent) -> Option<Message> {
    serde_json::to_string(event).ok().map(Message::Text)
}

async fn send_event(tx: &mpsc::Sender<Message>, event: &ServerEvent) -> bool {
    let Some(message) = to_ws_message(event) else {
        return false;
    };
    tx.send(message).await.is_ok()
}

/// Best-effort fan-out to a set of connections. A full outbox drops the
/// frame for that member rather than stalling the room.
async fn broadcast(connections: &ConnectionMap, members: &[ConnectionId], event: &ServerEvent) {
    let Some(message) = to_ws_message(event) else {
        return;
    };
    let guard = connections.read().await;
    for member in members {
        if let Some(tx) = guard.get(member) {
            if tx.try_send(message.clone()).is_err() {
                warn!("failed to queue event for {}", member);
            }
        }
    }
}

async fn broadcast_except(
    connections: &ConnectionMap,
    members: &[ConnectionId],
    skip: &str,
    event: &ServerEvent,
) {
    let targets: Vec<ConnectionId> = members.iter().filter(|m| *m != skip).cloned().collect();
    broadcast(connections, &targets, event).await;
}

/// Deliver a directed envelope to exactly one connection.
async fn relay_to(connections: &ConnectionMap, target_id: &str, event: &ServerEvent) {
    let tx = {
        let guard = connections.read().await;
        guard.get(target_id).cloned()
    };
    match tx {
        Some(tx) => {
            if !send_event(&tx, event).await {
                warn!("failed to queue signaling envelope for {}", target_id);
            }
        }
        None => debug!("signaling target not connected: {}", target_id),
    }
}

async fn fan_out_roster(connections: &ConnectionMap, update: RosterUpdate) {
    broadcast(
        connections,
        &update.members,
        &ServerEvent::ParticipantsUpdated(update.roster),
    )
    .await;
    if let Some(message) = update.message {
        broadcast(
            connections,
            &update.members,
            &ServerEvent::NewMessage(message),
        )
        .await;
    }
}

async fn fan_out_departure(connections: &ConnectionMap, update: DepartureUpdate) {
    broadcast(
        connections,
        &update.members,
        &ServerEvent::ParticipantsUpdated(update.roster),
    )
    .await;
    broadcast(
        connections,
        &update.members,
        &ServerEvent::NewMessage(update.message),
    )
    .await;
    if let Some(presenter_id) = update.stopped_presenter {
        broadcast(
            connections,
            &update.members,
            &ServerEvent::PresenterStopped { presenter_id },
        )
        .await;
    }
}
