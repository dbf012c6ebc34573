//! Subscriber groups
//!
//! A room is the set of connections currently receiving one session's events.
//! It is created by its first join and removed with its last member. Delivery
//! uses `try_send`, so a slow connection loses events instead of stalling the
//! rest of the room.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, warn};
use uuid::Uuid;

/// Identifies one client connection
pub type ConnectionId = Uuid;

/// Default capacity of a connection's event channel
pub const DEFAULT_CONNECTION_CAPACITY: usize = 256;

const SESSION_ROOM_PREFIX: &str = "session:";

/// Room that a session's events are published to
pub fn session_room(session_id: &str) -> String {
    format!("{}{}", SESSION_ROOM_PREFIX, session_id)
}

/// Session id of a session room
pub fn room_session(room: &str) -> Option<&str> {
    room.strip_prefix(SESSION_ROOM_PREFIX)
        .filter(|session_id| !session_id.is_empty())
}

/// Event delivered to every member of a room
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BridgeEvent {
    Output {
        session_id: String,
        data: String,
        timestamp: DateTime<Utc>,
    },
    Ended {
        session_id: String,
        exit_code: Option<i32>,
        timestamp: DateTime<Utc>,
    },
    Error {
        session_id: String,
        message: String,
        timestamp: DateTime<Utc>,
    },
    /// The forwarder fell behind the session and `skipped` events were lost
    Overflow {
        session_id: String,
        skipped: u64,
        timestamp: DateTime<Utc>,
    },
}

struct Member {
    tx: mpsc::Sender<BridgeEvent>,
    dropped: u64,
}

/// All rooms and their members
#[derive(Default)]
pub struct RoomRegistry {
    rooms: RwLock<HashMap<String, HashMap<ConnectionId, Member>>>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a connection to a room. Returns `false` if it was already a member.
    pub async fn join(
        &self,
        room: &str,
        connection: ConnectionId,
        tx: mpsc::Sender<BridgeEvent>,
    ) -> bool {
        let mut rooms = self.rooms.write().await;
        let members = rooms.entry(room.to_string()).or_default();
        let joined = !members.contains_key(&connection);
        members.insert(connection, Member { tx, dropped: 0 });
        debug!(room = %room, connection = %connection, "Joined room");
        joined
    }

    /// Remove a connection from a room, dropping the room once empty
    pub async fn leave(&self, room: &str, connection: ConnectionId) -> bool {
        let mut rooms = self.rooms.write().await;
        let Some(members) = rooms.get_mut(room) else {
            return false;
        };
        let left = members.remove(&connection).is_some();
        if members.is_empty() {
            rooms.remove(room);
        }
        left
    }

    /// Remove a connection from every room; returns the rooms it was in
    pub async fn leave_all(&self, connection: ConnectionId) -> Vec<String> {
        let mut rooms = self.rooms.write().await;
        let mut left = Vec::new();
        rooms.retain(|room, members| {
            if members.remove(&connection).is_some() {
                left.push(room.clone());
            }
            !members.is_empty()
        });
        left
    }

    /// Deliver an event to every member; returns how many received it.
    ///
    /// Members whose connection has closed are removed.
    pub async fn broadcast(&self, room: &str, event: &BridgeEvent) -> usize {
        let mut rooms = self.rooms.write().await;
        let Some(members) = rooms.get_mut(room) else {
            return 0;
        };

        let mut delivered = 0;
        let mut closed = Vec::new();
        for (connection, member) in members.iter_mut() {
            match member.tx.try_send(event.clone()) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    member.dropped += 1;
                    warn!(
                        room = %room,
                        connection = %connection,
                        dropped = member.dropped,
                        "Connection is backpressured, dropping event"
                    );
                }
                Err(mpsc::error::TrySendError::Closed(_)) => closed.push(*connection),
            }
        }

        for connection in closed {
            members.remove(&connection);
            debug!(room = %room, connection = %connection, "Removed closed connection");
        }
        if members.is_empty() {
            rooms.remove(room);
        }
        delivered
    }
}

#[cfg(test)]
impl RoomRegistry {
    pub async fn member_count(&self, room: &str) -> usize {
        self.rooms.read().await.get(room).map_or(0, HashMap::len)
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn rooms_of(&self, connection: ConnectionId) -> Vec<String> {
        self.rooms
            .read()
            .await
            .iter()
            .filter(|(_, members)| members.contains_key(&connection))
            .map(|(room, _)| room.clone())
            .collect()
    }
}
