//! Connection registry with room membership.

use std::collections::{HashMap, HashSet};

use spheroseg_core::types::Timestamp;
use tokio::sync::{mpsc, RwLock};

use crate::messages::OutboundMessage;

/// Channel sender half for pushing messages to one connection.
pub type ConnectionSender = mpsc::UnboundedSender<OutboundMessage>;

struct Connection {
    sender: ConnectionSender,
    rooms: HashSet<String>,
    connected_at: Timestamp,
}

#[derive(Default)]
struct HubState {
    connections: HashMap<String, Connection>,
    /// Room name -> member connection ids.
    rooms: HashMap<String, HashSet<String>>,
}

/// All live connections and the rooms they joined.
///
/// Thread-safe via an interior `RwLock`; share it behind `Arc`.
#[derive(Default)]
pub struct RoomHub {
    state: RwLock<HubState>,
}

impl RoomHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection and return the receiver of its outbound
    /// messages.
    pub async fn add(&self, conn_id: impl Into<String>) -> mpsc::UnboundedReceiver<OutboundMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        let conn = Connection {
            sender: tx,
            rooms: HashSet::new(),
            connected_at: chrono::Utc::now(),
        };
        self.state.write().await.connections.insert(conn_id.into(), conn);
        rx
    }

    /// Drop a connection and its room memberships.
    pub async fn remove(&self, conn_id: &str) {
        let mut state = self.state.write().await;
        let Some(conn) = state.connections.remove(conn_id) else {
            return;
        };
        for room in conn.rooms {
            leave_room(&mut state.rooms, &room, conn_id);
        }
    }

    /// Add a connection to a room. Returns `false` for unknown connections.
    pub async fn join(&self, conn_id: &str, room: &str) -> bool {
        let mut state = self.state.write().await;
        let Some(conn) = state.connections.get_mut(conn_id) else {
            return false;
        };
        conn.rooms.insert(room.to_string());
        state
            .rooms
            .entry(room.to_string())
            .or_default()
            .insert(conn_id.to_string());
        tracing::debug!(conn_id, room, "Connection joined room");
        true
    }

    /// Remove a connection from a room. Returns whether it was a member.
    pub async fn leave(&self, conn_id: &str, room: &str) -> bool {
        let mut state = self.state.write().await;
        let was_member = state
            .connections
            .get_mut(conn_id)
            .is_some_and(|conn| conn.rooms.remove(room));
        if was_member {
            leave_room(&mut state.rooms, room, conn_id);
        }
        was_member
    }

    /// Send to every member of `room`. Returns the number of recipients.
    ///
    /// Connections whose channels are closed are skipped; they are removed
    /// when their socket loop ends.
    pub async fn emit_to_room(&self, room: &str, message: OutboundMessage) -> usize {
        let state = self.state.read().await;
        let Some(members) = state.rooms.get(room) else {
            return 0;
        };
        members
            .iter()
            .filter_map(|id| state.connections.get(id))
            .filter(|conn| conn.sender.send(message.clone()).is_ok())
            .count()
    }

    /// Send to every connection. Returns the number of recipients.
    pub async fn emit_all(&self, message: OutboundMessage) -> usize {
        let state = self.state.read().await;
        state
            .connections
            .values()
            .filter(|conn| conn.sender.send(message.clone()).is_ok())
            .count()
    }

    pub async fn connection_count(&self) -> usize {
        self.state.read().await.connections.len()
    }

    pub async fn room_size(&self, room: &str) -> usize {
        self.state
            .read()
            .await
            .rooms
            .get(room)
            .map_or(0, HashSet::len)
    }

    /// When a connection was registered.
    pub async fn connected_at(&self, conn_id: &str) -> Option<Timestamp> {
        self.state
            .read()
            .await
            .connections
            .get(conn_id)
            .map(|c| c.connected_at)
    }

    pub async fn ping_all(&self) {
        self.emit_all(OutboundMessage::Ping).await;
    }

    /// Send a close to every connection, then forget them all.
    pub async fn shutdown_all(&self) {
        let mut state = self.state.write().await;
        let count = state.connections.len();
        for conn in state.connections.values() {
            let _ = conn.sender.send(OutboundMessage::Close);
        }
        state.connections.clear();
        state.rooms.clear();
        tracing::info!(count, "Closed all connections");
    }
}

fn leave_room(rooms: &mut HashMap<String, HashSet<String>>, room: &str, conn_id: &str) {
    if let Some(members) = rooms.get_mut(room) {
        members.remove(conn_id);
        if members.is_empty() {
            rooms.remove(room);
        }
    }
}
