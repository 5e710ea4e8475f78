//! In-memory room/participant registry.
//!
//! The registry owns all room state behind a single `RwLock` with short
//! critical sections. Mutations never perform I/O: each one returns an
//! outcome value describing what the relay layer should broadcast, which
//! keeps every operation synchronously testable.
//!
//! All operations are idempotent no-ops when the referenced room or
//! participant is already gone; disconnect races must never surface errors.

use std::collections::{HashMap, VecDeque};

use tokio::sync::RwLock;

use roomcast_common::{now_millis, ChatMessage, ConnectionStatus, Participant};

/// Opaque connection id assigned by the transport at socket upgrade.
pub type ConnectionId = String;

/// Why a participant left a room; only the system message text differs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DepartureReason {
    /// Explicit `leave-room` event.
    Left,
    /// Transport-level disconnect.
    Disconnected,
}

/// Outcome of a mutation that changed a room's roster.
#[derive(Debug)]
pub struct RosterUpdate {
    pub room_id: String,
    /// Every current member of the room, for fan-out.
    pub members: Vec<ConnectionId>,
    pub roster: Vec<Participant>,
    /// System message to append alongside the roster broadcast, if any.
    pub message: Option<ChatMessage>,
}

/// Outcome of a participant leaving (explicitly or by disconnect).
#[derive(Debug)]
pub struct DepartureUpdate {
    pub room_id: String,
    /// Members remaining after the departure.
    pub members: Vec<ConnectionId>,
    pub roster: Vec<Participant>,
    pub message: ChatMessage,
    /// Set when the departing participant had `is_presenting`; viewers must
    /// observe `presenter-stopped` and release their peer links.
    pub stopped_presenter: Option<ConnectionId>,
}

struct Room {
    participants: HashMap<ConnectionId, Participant>,
    messages: VecDeque<ChatMessage>,
    next_seq: u64,
}

impl Room {
    fn new() -> Self {
        Self {
            participants: HashMap::new(),
            messages: VecDeque::new(),
            next_seq: 1,
        }
    }

    /// Roster in join order for display.
    fn roster(&self) -> Vec<Participant> {
        let mut list: Vec<Participant> = self.participants.values().cloned().collect();
        list.sort_by(|a, b| a.joined_at.cmp(&b.joined_at).then(a.id.cmp(&b.id)));
        list
    }

    fn members(&self) -> Vec<ConnectionId> {
        self.participants.keys().cloned().collect()
    }

    fn next_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    fn push_message(&mut self, message: ChatMessage, cap: usize) {
        self.messages.push_back(message);
        while self.messages.len() > cap {
            self.messages.pop_front();
        }
    }
}

/// Owner of all room state. Never exposes the raw map.
pub struct RoomRegistry {
    rooms: RwLock<HashMap<String, Room>>,
    message_cap: usize,
}

impl RoomRegistry {
    pub fn new(message_cap: usize) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            message_cap: message_cap.max(1),
        }
    }

    /// Admit a connection into a room, creating the room on first join.
    pub async fn join(&self, room_id: &str, conn_id: &str, name: &str) -> RosterUpdate {
        let mut rooms = self.rooms.write().await;
        let room = rooms.entry(room_id.to_string()).or_insert_with(Room::new);

        room.participants.insert(
            conn_id.to_string(),
            Participant {
                id: conn_id.to_string(),
                name: name.to_string(),
                is_presenting: false,
                joined_at: now_millis(),
                connection_status: ConnectionStatus::Connected,
            },
        );

        let seq = room.next_seq();
        let message = ChatMessage::system(seq, room_id, format!("{name} joined the room"));
        room.push_message(message.clone(), self.message_cap);

        RosterUpdate {
            room_id: room_id.to_string(),
            members: room.members(),
            roster: room.roster(),
            message: Some(message),
        }
    }

    /// Remove a connection from one room. Deletes the room once empty.
    pub async fn leave_room(
        &self,
        room_id: &str,
        conn_id: &str,
        reason: DepartureReason,
    ) -> Option<DepartureUpdate> {
        let mut rooms = self.rooms.write().await;
        let room = rooms.get_mut(room_id)?;
        let update = Self::remove_participant(room, room_id, conn_id, reason, self.message_cap)?;
        if room.participants.is_empty() {
            rooms.remove(room_id);
        }
        Some(update)
    }

    /// Remove a connection from every room it joined (transport disconnect).
    pub async fn disconnect(&self, conn_id: &str) -> Vec<DepartureUpdate> {
        let mut rooms = self.rooms.write().await;
        let mut updates = Vec::new();
        let mut emptied = Vec::new();

        for (room_id, room) in rooms.iter_mut() {
            if let Some(update) = Self::remove_participant(
                room,
                room_id,
                conn_id,
                DepartureReason::Disconnected,
                self.message_cap,
            ) {
                if room.participants.is_empty() {
                    emptied.push(room_id.clone());
                }
                updates.push(update);
            }
        }
        for room_id in emptied {
            rooms.remove(&room_id);
        }
        updates
    }

    /// Flip a participant's presenting flag.
    pub async fn set_presenting(
        &self,
        room_id: &str,
        conn_id: &str,
        name: &str,
        presenting: bool,
    ) -> Option<RosterUpdate> {
        let mut rooms = self.rooms.write().await;
        let room = rooms.get_mut(room_id)?;
        let participant = room.participants.get_mut(conn_id)?;
        participant.is_presenting = presenting;

        let verb = if presenting { "started" } else { "stopped" };
        let seq = room.next_seq();
        let message = ChatMessage::system(seq, room_id, format!("{name} {verb} screen sharing"));
        room.push_message(message.clone(), self.message_cap);

        Some(RosterUpdate {
            room_id: room_id.to_string(),
            members: room.members(),
            roster: room.roster(),
            message: Some(message),
        })
    }

    /// Update a participant's informational connection status.
    pub async fn set_connection_status(
        &self,
        room_id: &str,
        conn_id: &str,
        status: ConnectionStatus,
    ) -> Option<RosterUpdate> {
        let mut rooms = self.rooms.write().await;
        let room = rooms.get_mut(room_id)?;
        let participant = room.participants.get_mut(conn_id)?;
        participant.connection_status = status;

        Some(RosterUpdate {
            room_id: room_id.to_string(),
            members: room.members(),
            roster: room.roster(),
            message: None,
        })
    }

    /// Append a chat message with a server-assigned sequence number.
    pub async fn append_message(
        &self,
        room_id: &str,
        sender_id: &str,
        name: &str,
        text: &str,
    ) -> Option<(Vec<ConnectionId>, ChatMessage)> {
        let mut rooms = self.rooms.write().await;
        let room = rooms.get_mut(room_id)?;

        let seq = room.next_seq();
        let message = ChatMessage {
            seq,
            id: format!("{seq}-{room_id}"),
            user_id: sender_id.to_string(),
            user_name: name.to_string(),
            text: text.to_string(),
            timestamp: now_millis(),
        };
        room.push_message(message.clone(), self.message_cap);

        Some((room.members(), message))
    }

    /// Current presenter of a room, if any. Used to route stream-refresh
    /// requests; picks the earliest joiner when several are presenting.
    pub async fn find_presenter(&self, room_id: &str) -> Option<ConnectionId> {
        let rooms = self.rooms.read().await;
        rooms
            .get(room_id)?
            .roster()
            .into_iter()
            .find(|p| p.is_presenting)
            .map(|p| p.id)
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    /// Roster snapshot, mainly for tests and the liveness probe.
    pub async fn roster(&self, room_id: &str) -> Option<Vec<Participant>> {
        let rooms = self.rooms.read().await;
        Some(rooms.get(room_id)?.roster())
    }

    /// Number of retained messages in a room.
    pub async fn message_count(&self, room_id: &str) -> usize {
        let rooms = self.rooms.read().await;
        rooms.get(room_id).map_or(0, |room| room.messages.len())
    }

    fn remove_participant(
        room: &mut Room,
        room_id: &str,
        conn_id: &str,
        reason: DepartureReason,
        cap: usize,
    ) -> Option<DepartureUpdate> {
        let participant = room.participants.remove(conn_id)?;
        let text = match reason {
            DepartureReason::Left => format!("{} left the room", participant.name),
            DepartureReason::Disconnected => format!("{} disconnected", participant.name),
        };
        let seq = room.next_seq();
        let message = ChatMessage::system(seq, room_id, text);
        room.push_message(message.clone(), cap);

        Some(DepartureUpdate {
            room_id: room_id.to_string(),
            members: room.members(),
            roster: room.roster(),
            message,
            stopped_presenter: participant.is_presenting.then(|| participant.id),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn roster_tracks_joins_and_leaves_without_ghosts() {
        let registry = RoomRegistry::new(500);

        let update = registry.join("r1", "a", "Alice").await;
        assert_eq!(update.roster.len(), 1);

        let update = registry.join("r1", "b", "Bob").await;
        assert_eq!(update.members.len(), 2);
        let names: Vec<_> = update.roster.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["Alice", "Bob"]);

        let update = registry
            .leave_room("r1", "a", DepartureReason::Left)
            .await
            .expect("leave should report an update");
        assert_eq!(update.roster.len(), 1);
        assert_eq!(update.roster[0].id, "b");
        assert!(update.message.text.contains("left the room"));
    }

    #[tokio::test]
    async fn room_deleted_only_when_empty_and_rejoin_is_fresh() {
        let registry = RoomRegistry::new(500);
        registry.join("r1", "a", "Alice").await;
        registry.join("r1", "b", "Bob").await;

        registry.leave_room("r1", "a", DepartureReason::Left).await;
        assert_eq!(registry.room_count().await, 1);

        registry.leave_room("r1", "b", DepartureReason::Left).await;
        assert_eq!(registry.room_count().await, 0);

        // Re-creating the room must not resurrect the old message log.
        let update = registry.join("r1", "c", "Cara").await;
        assert_eq!(update.message.as_ref().map(|m| m.seq), Some(1));
        assert_eq!(registry.message_count("r1").await, 1);
    }

    #[tokio::test]
    async fn disconnect_removes_from_every_room_and_flags_presenter() {
        let registry = RoomRegistry::new(500);
        registry.join("r1", "a", "Alice").await;
        registry.join("r2", "a", "Alice").await;
        registry.join("r1", "b", "Bob").await;
        registry.set_presenting("r1", "a", "Alice", true).await;

        let updates = registry.disconnect("a").await;
        assert_eq!(updates.len(), 2);

        let r1 = updates
            .iter()
            .find(|u| u.room_id == "r1")
            .expect("r1 update");
        assert_eq!(r1.stopped_presenter.as_deref(), Some("a"));
        assert!(r1.message.text.contains("disconnected"));

        // r2 only held Alice, so it must be gone entirely.
        assert_eq!(registry.room_count().await, 1);
        assert!(registry.roster("r2").await.is_none());
    }

    #[tokio::test]
    async fn operations_on_missing_rooms_are_noops() {
        let registry = RoomRegistry::new(500);
        assert!(registry
            .leave_room("nope", "a", DepartureReason::Left)
            .await
            .is_none());
        assert!(registry.set_presenting("nope", "a", "Alice", true).await.is_none());
        assert!(registry
            .set_connection_status("nope", "a", ConnectionStatus::Failed)
            .await
            .is_none());
        assert!(registry.append_message("nope", "a", "Alice", "hi").await.is_none());
        assert!(registry.disconnect("a").await.is_empty());
    }

    #[tokio::test]
    async fn message_sequence_is_monotonic_per_room() {
        let registry = RoomRegistry::new(500);
        registry.join("r1", "a", "Alice").await; // seq 1 (system)

        let (_, first) = registry
            .append_message("r1", "a", "Alice", "hi")
            .await
            .expect("append");
        let (_, second) = registry
            .append_message("r1", "a", "Alice", "again")
            .await
            .expect("append");
        assert_eq!(first.seq, 2);
        assert_eq!(second.seq, 3);
        assert_eq!(second.id, "3-r1");
    }

    #[tokio::test]
    async fn message_log_is_capped() {
        let registry = RoomRegistry::new(3);
        registry.join("r1", "a", "Alice").await;
        for i in 0..10 {
            registry
                .append_message("r1", "a", "Alice", &format!("msg {i}"))
                .await;
        }
        assert_eq!(registry.message_count("r1").await, 3);
    }

    #[tokio::test]
    async fn multiple_presenters_are_tolerated() {
        let registry = RoomRegistry::new(500);
        registry.join("r1", "a", "Alice").await;
        registry.join("r1", "b", "Bob").await;
        registry.set_presenting("r1", "a", "Alice", true).await;
        registry.set_presenting("r1", "b", "Bob", true).await;

        let roster = registry.roster("r1").await.expect("roster");
        assert!(roster.iter().all(|p| p.is_presenting));
        // Earliest joiner wins refresh routing.
        assert_eq!(registry.find_presenter("r1").await.as_deref(), Some("a"));
    }
}
