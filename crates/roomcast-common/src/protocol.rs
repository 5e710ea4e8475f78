//! Wire protocol for the Roomcast signaling channel.
//!
//! Every frame is a JSON object `{"event": ..., "data": ...}`. Payload field
//! names are camelCase on the wire to stay compatible with the browser
//! clients. Offer/answer/candidate payloads are deliberately opaque
//! [`serde_json::Value`]s: the relay routes them by `targetId` and never
//! interprets their contents.

use serde::{Deserialize, Serialize};

/// Sender id used for server-generated chat messages.
pub const SYSTEM_USER_ID: &str = "system";
/// Display name used for server-generated chat messages.
pub const SYSTEM_USER_NAME: &str = "System";

/// Current time in milliseconds since the Unix epoch, as carried on the wire.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Per-participant connection health, surfaced to the UI only.
///
/// Purely informational: the protocol makes no routing decisions on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Failed,
    Offline,
}

/// A participant as broadcast in roster updates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    /// Connection id assigned by the server at socket upgrade.
    pub id: String,
    /// Caller-supplied display name. Not unique, not validated.
    pub name: String,
    pub is_presenting: bool,
    /// Join time, milliseconds since epoch.
    pub joined_at: i64,
    pub connection_status: ConnectionStatus,
}

/// A chat message, immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    /// Server-assigned per-room sequence number. Monotonic, dedupe-exact.
    pub seq: u64,
    /// Display id, `"{seq}-{roomId}"`.
    pub id: String,
    /// Sender connection id, or [`SYSTEM_USER_ID`].
    pub user_id: String,
    pub user_name: String,
    pub text: String,
    /// Milliseconds since epoch.
    pub timestamp: i64,
}

impl ChatMessage {
    /// Build a server-generated system message.
    pub fn system(seq: u64, room_id: &str, text: impl Into<String>) -> Self {
        Self {
            seq,
            id: format!("{seq}-{room_id}"),
            user_id: SYSTEM_USER_ID.to_string(),
            user_name: SYSTEM_USER_NAME.to_string(),
            text: text.into(),
            timestamp: now_millis(),
        }
    }
}

/// Events a client sends to the signaling server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ClientEvent {
    #[serde(rename_all = "camelCase")]
    JoinRoom { room_id: String, user_name: String },

    #[serde(rename_all = "camelCase")]
    StartPresenting { room_id: String, user_name: String },

    #[serde(rename_all = "camelCase")]
    StopPresenting { room_id: String, user_name: String },

    #[serde(rename_all = "camelCase")]
    SendMessage {
        room_id: String,
        message: String,
        user_name: String,
        /// Client-declared sender id; the relay ignores it in favour of the
        /// real connection id.
        #[serde(default)]
        user_id: Option<String>,
    },

    #[serde(rename_all = "camelCase")]
    WebrtcOffer {
        room_id: String,
        offer: serde_json::Value,
        target_id: String,
    },

    #[serde(rename_all = "camelCase")]
    WebrtcAnswer {
        room_id: String,
        answer: serde_json::Value,
        target_id: String,
    },

    #[serde(rename_all = "camelCase")]
    WebrtcIceCandidate {
        room_id: String,
        candidate: serde_json::Value,
        target_id: String,
    },

    #[serde(rename_all = "camelCase")]
    LeaveRoom { room_id: String, user_name: String },

    #[serde(rename_all = "camelCase")]
    ConnectionStatusUpdate {
        room_id: String,
        status: ConnectionStatus,
    },

    /// Black-screen recovery: ask the server to poke the room's presenter
    /// into re-offering to this viewer.
    #[serde(rename_all = "camelCase")]
    RequestStreamRefresh {
        room_id: String,
        requester_id: String,
    },
}

/// Events the signaling server sends to a client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ServerEvent {
    /// Sent once immediately after the socket upgrade so the client learns
    /// its own connection id.
    #[serde(rename_all = "camelCase")]
    SessionBound { connection_id: String },

    ParticipantsUpdated(Vec<Participant>),

    NewMessage(ChatMessage),

    /// Directed at every room member except the presenter itself.
    #[serde(rename_all = "camelCase")]
    PresenterStarted {
        presenter_id: String,
        presenter_name: String,
    },

    #[serde(rename_all = "camelCase")]
    PresenterStopped { presenter_id: String },

    /// `sender_id` is always the relaying connection's real id.
    #[serde(rename_all = "camelCase")]
    WebrtcOffer {
        offer: serde_json::Value,
        sender_id: String,
    },

    #[serde(rename_all = "camelCase")]
    WebrtcAnswer {
        answer: serde_json::Value,
        sender_id: String,
    },

    #[serde(rename_all = "camelCase")]
    WebrtcIceCandidate {
        candidate: serde_json::Value,
        sender_id: String,
    },

    /// Directed at the current presenter only.
    #[serde(rename_all = "camelCase")]
    RefreshStreamForViewer { viewer_id: String, room_id: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_event_wire_names_match_protocol() {
        let json = serde_json::to_value(ClientEvent::JoinRoom {
            room_id: "R1".into(),
            user_name: "Alice".into(),
        })
        .unwrap();
        assert_eq!(json["event"], "join-room");
        assert_eq!(json["data"]["roomId"], "R1");
        assert_eq!(json["data"]["userName"], "Alice");
    }

    #[test]
    fn offer_payload_stays_opaque() {
        let frame = r#"{"event":"webrtc-offer","data":{"roomId":"R1","offer":{"type":"offer","sdp":"v=0"},"targetId":"abc"}}"#;
        let event: ClientEvent = serde_json::from_str(frame).unwrap();
        match event {
            ClientEvent::WebrtcOffer {
                offer, target_id, ..
            } => {
                assert_eq!(target_id, "abc");
                assert_eq!(offer["sdp"], "v=0");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn roster_serializes_as_bare_array() {
        let json = serde_json::to_value(ServerEvent::ParticipantsUpdated(vec![Participant {
            id: "c1".into(),
            name: "Bob".into(),
            is_presenting: false,
            joined_at: 1_700_000_000_000,
            connection_status: ConnectionStatus::Connected,
        }]))
        .unwrap();
        assert_eq!(json["event"], "participants-updated");
        assert_eq!(json["data"][0]["connectionStatus"], "connected");
        assert_eq!(json["data"][0]["isPresenting"], false);
    }

    #[test]
    fn system_message_uses_sentinel_sender() {
        let msg = ChatMessage::system(7, "R1", "Bob joined the room");
        assert_eq!(msg.user_id, SYSTEM_USER_ID);
        assert_eq!(msg.id, "7-R1");
        assert!(msg.timestamp > 0);
    }
}
