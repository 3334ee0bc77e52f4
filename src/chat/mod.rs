//! Room chat: membership, live fan-out, and bounded history.
//!
//! Each connection owns one unbounded inbox. A room maps connection ids to
//! inbox senders. Sends to one room are serialized so history order matches
//! delivery order; different rooms never contend.

pub mod history;
#[cfg(feature = "redis-history")]
pub mod redis;

pub use history::{HistoryError, HistoryReader, HistoryStore, RingHistory};

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::engine::ErrorKind;
use crate::limits::*;
use crate::observability;

pub type ConnId = u64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub sender_email: String,
    pub payload: String,
}

/// A message as it lands in a member's inbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomMessage {
    pub room: String,
    pub message: ChatMessage,
}

/// Outcome of one send. `persisted` is false when history rejected the
/// append; live delivery happened regardless.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Delivery {
    pub delivered: usize,
    pub persisted: bool,
}

#[derive(Debug)]
pub enum ChatError {
    InvalidRoom(&'static str),
    InvalidMessage(&'static str),
    UnknownConnection(ConnId),
}

impl ChatError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ChatError::InvalidRoom(_) | ChatError::InvalidMessage(_) => ErrorKind::Validation,
            ChatError::UnknownConnection(_) => ErrorKind::NotFound,
        }
    }
}

impl std::fmt::Display for ChatError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChatError::InvalidRoom(msg) => write!(f, "invalid room: {msg}"),
            ChatError::InvalidMessage(msg) => write!(f, "invalid message: {msg}"),
            ChatError::UnknownConnection(id) => write!(f, "unknown connection: {id}"),
        }
    }
}

impl std::error::Error for ChatError {}

pub(crate) fn validate_room(room: &str) -> Result<(), &'static str> {
    if room.is_empty() {
        return Err("room name is required");
    }
    if room.len() > MAX_ROOM_NAME_LEN {
        return Err("room name too long");
    }
    Ok(())
}

type Inbox = mpsc::UnboundedSender<RoomMessage>;

#[derive(Default)]
struct Room {
    members: Mutex<HashMap<ConnId, Inbox>>,
    /// Held across fan-out and history append.
    send_order: tokio::sync::Mutex<()>,
}

impl Room {
    fn members(&self) -> std::sync::MutexGuard<'_, HashMap<ConnId, Inbox>> {
        self.members.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

struct Connection {
    inbox: Inbox,
    rooms: HashSet<String>,
}

pub struct ChatHub {
    rooms: DashMap<String, Arc<Room>>,
    connections: DashMap<ConnId, Connection>,
    history: Arc<dyn HistoryStore>,
    next_id: AtomicU64,
}

impl ChatHub {
    pub fn new(history: Arc<dyn HistoryStore>) -> Self {
        Self {
            rooms: DashMap::new(),
            connections: DashMap::new(),
            history,
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a connection and hand back its inbox.
    pub fn connect(&self) -> (ConnId, mpsc::UnboundedReceiver<RoomMessage>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (inbox, rx) = mpsc::unbounded_channel();
        self.connections.insert(
            id,
            Connection {
                inbox,
                rooms: HashSet::new(),
            },
        );
        (id, rx)
    }

    /// Add `conn` to `room`. Joining twice is a no-op. No backlog is replayed.
    pub fn join_room(&self, conn: ConnId, room: &str) -> Result<(), ChatError> {
        validate_room(room).map_err(ChatError::InvalidRoom)?;
        let mut connection = self
            .connections
            .get_mut(&conn)
            .ok_or(ChatError::UnknownConnection(conn))?;
        if !connection.rooms.insert(room.to_string()) {
            return Ok(());
        }
        // Insert under the map entry so a concurrent leave cannot drop the room in between.
        self.rooms
            .entry(room.to_string())
            .or_default()
            .members()
            .insert(conn, connection.inbox.clone());
        drop(connection);

        metrics::gauge!(observability::ROOMS_ACTIVE).set(self.rooms.len() as f64);
        debug!("connection {conn} joined room {room}");
        Ok(())
    }

    /// Deliver to every current member of `room` except `conn`, then append
    /// to the room's history.
    pub async fn send_message(
        &self,
        conn: ConnId,
        room: &str,
        sender_email: &str,
        payload: &str,
    ) -> Result<Delivery, ChatError> {
        validate_room(room).map_err(ChatError::InvalidRoom)?;
        if sender_email.len() > MAX_EMAIL_LEN {
            return Err(ChatError::InvalidMessage("sender email too long"));
        }
        if payload.len() > MAX_PAYLOAD_LEN {
            return Err(ChatError::InvalidMessage("payload too long"));
        }
        let message = ChatMessage {
            sender_email: sender_email.to_string(),
            payload: payload.to_string(),
        };
        metrics::counter!(observability::CHAT_MESSAGES_TOTAL).increment(1);

        let mut current = self.current_room(room);
        loop {
            let Some(shared) = current else {
                let persisted = self.persist(room, &message).await;
                return Ok(Delivery {
                    delivered: 0,
                    persisted,
                });
            };
            let _order = shared.send_order.lock().await;
            // A leave may have dropped the room, and a join recreated it, while we waited.
            current = self.current_room(room);
            if !current.as_ref().is_some_and(|now| Arc::ptr_eq(now, &shared)) {
                continue;
            }

            let mut delivered = 0;
            for (member, inbox) in shared.members().iter() {
                if *member == conn {
                    continue;
                }
                let sent = inbox.send(RoomMessage {
                    room: room.to_string(),
                    message: message.clone(),
                });
                if sent.is_ok() {
                    delivered += 1;
                }
            }
            metrics::counter!(observability::CHAT_DELIVERIES_TOTAL).increment(delivered as u64);

            let persisted = self.persist(room, &message).await;
            return Ok(Delivery {
                delivered,
                persisted,
            });
        }
    }

    fn current_room(&self, room: &str) -> Option<Arc<Room>> {
        self.rooms.get(room).map(|r| r.value().clone())
    }

    async fn persist(&self, room: &str, message: &ChatMessage) -> bool {
        match self.history.append(room, message).await {
            Ok(()) => true,
            Err(e) => {
                warn!("history append for room {room} failed: {e}");
                metrics::counter!(observability::HISTORY_FAILURES_TOTAL).increment(1);
                false
            }
        }
    }

    /// Drop `conn` from every room it joined. Empty rooms are removed.
    pub fn leave(&self, conn: ConnId) {
        let Some((_, connection)) = self.connections.remove(&conn) else {
            return;
        };
        for room in &connection.rooms {
            self.rooms.remove_if(room, |_, r| {
                let mut members = r.members();
                members.remove(&conn);
                members.is_empty()
            });
        }
        metrics::gauge!(observability::ROOMS_ACTIVE).set(self.rooms.len() as f64);
        debug!("connection {conn} left {} rooms", connection.rooms.len());
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    pub fn members(&self, room: &str) -> usize {
        self.rooms.get(room).map_or(0, |r| r.members().len())
    }
}
