use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use moka::future::Cache;
use moka::policy::EvictionPolicy;

use crate::engine::ErrorKind;
use crate::limits::{DEFAULT_HISTORY_MAX_ROOMS, HISTORY_IDLE_SECS};
use crate::model::Listing;

use super::{ChatMessage, validate_room};

#[derive(Debug)]
pub enum HistoryError {
    InvalidRoom(&'static str),
    /// The backing store failed; the message says how.
    Backend(String),
}

impl HistoryError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            HistoryError::InvalidRoom(_) => ErrorKind::Validation,
            HistoryError::Backend(_) => ErrorKind::Store,
        }
    }
}

impl std::fmt::Display for HistoryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HistoryError::InvalidRoom(msg) => write!(f, "invalid room: {msg}"),
            HistoryError::Backend(e) => write!(f, "history backend error: {e}"),
        }
    }
}

impl std::error::Error for HistoryError {}

/// Append-only per-room message lists, bounded by the implementation.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    async fn append(&self, room: &str, message: &ChatMessage) -> Result<(), HistoryError>;

    /// Everything retained for `room`, oldest first.
    async fn range(&self, room: &str) -> Result<Vec<ChatMessage>, HistoryError>;
}

type Ring = Arc<Mutex<VecDeque<ChatMessage>>>;

/// In-process history keeping the most recent `capacity` messages per room.
///
/// The set of rooms is bounded too: past `max_rooms` the least recently used
/// room is dropped, and so is any room left idle for `idle`.
pub struct RingHistory {
    capacity: usize,
    rooms: Cache<String, Ring>,
}

impl RingHistory {
    pub fn new(capacity: usize) -> Self {
        Self::with_limits(
            capacity,
            DEFAULT_HISTORY_MAX_ROOMS,
            Duration::from_secs(HISTORY_IDLE_SECS),
        )
    }

    pub fn with_limits(capacity: usize, max_rooms: u64, idle: Duration) -> Self {
        let rooms = Cache::builder()
            .max_capacity(max_rooms.max(1))
            .eviction_policy(EvictionPolicy::lru())
            .time_to_idle(idle)
            .build();
        Self {
            capacity: capacity.max(1),
            rooms,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Rooms currently holding history, after pending evictions are applied.
    pub async fn room_count(&self) -> u64 {
        self.rooms.run_pending_tasks().await;
        self.rooms.entry_count()
    }
}

fn lock(ring: &Ring) -> std::sync::MutexGuard<'_, VecDeque<ChatMessage>> {
    ring.lock().unwrap_or_else(PoisonError::into_inner)
}

#[async_trait]
impl HistoryStore for RingHistory {
    async fn append(&self, room: &str, message: &ChatMessage) -> Result<(), HistoryError> {
        let ring = self
            .rooms
            .get_with(room.to_string(), async { Ring::default() })
            .await;
        let mut ring = lock(&ring);
        if ring.len() == self.capacity {
            ring.pop_front();
        }
        ring.push_back(message.clone());
        Ok(())
    }

    async fn range(&self, room: &str) -> Result<Vec<ChatMessage>, HistoryError> {
        Ok(match self.rooms.get(room).await {
            Some(ring) => lock(&ring).iter().cloned().collect(),
            None => Vec::new(),
        })
    }
}

/// Serves a room's backlog to late joiners.
#[derive(Clone)]
pub struct HistoryReader {
    store: Arc<dyn HistoryStore>,
}

impl HistoryReader {
    pub fn new(store: Arc<dyn HistoryStore>) -> Self {
        Self { store }
    }

    pub async fn read(&self, room: &str) -> Result<Listing<ChatMessage>, HistoryError> {
        validate_room(room).map_err(HistoryError::InvalidRoom)?;
        Ok(Listing::from_vec(self.store.range(room).await?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(n: usize) -> ChatMessage {
        ChatMessage {
            sender_email: "a@example.com".into(),
            payload: format!("m{n}"),
        }
    }

    #[tokio::test]
    async fn ring_keeps_most_recent_in_order() {
        let ring = RingHistory::new(3);
        for n in 0..5 {
            ring.append("r", &msg(n)).await.unwrap();
        }
        let kept: Vec<String> = ring
            .range("r")
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.payload)
            .collect();
        assert_eq!(kept, vec!["m2", "m3", "m4"]);
        assert!(ring.range("other").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn reader_returns_sentinel_for_empty_room() {
        let ring = Arc::new(RingHistory::new(10));
        let reader = HistoryReader::new(ring.clone());
        assert_eq!(reader.read("empty").await.unwrap(), Listing::NoDataYet);

        ring.append("full", &msg(1)).await.unwrap();
        ring.append("full", &msg(2)).await.unwrap();
        assert_eq!(
            reader.read("full").await.unwrap(),
            Listing::Items(vec![msg(1), msg(2)])
        );
    }

    #[tokio::test]
    async fn reader_rejects_bad_room() {
        let reader = HistoryReader::new(Arc::new(RingHistory::new(10)));
        let err = reader.read("").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[tokio::test]
    async fn least_recent_room_is_dropped_past_room_limit() {
        let ring = RingHistory::with_limits(10, 2, Duration::from_secs(3600));
        for room in ["a", "b", "c"] {
            ring.append(room, &msg(1)).await.unwrap();
            ring.room_count().await;
        }

        assert_eq!(ring.room_count().await, 2);
        assert!(ring.range("a").await.unwrap().is_empty());
        assert_eq!(ring.range("c").await.unwrap(), vec![msg(1)]);
    }

    // The ring never touches the runtime, so a bare executor is enough.
    #[test]
    fn zero_capacity_still_keeps_last() {
        let ring = RingHistory::new(0);
        assert_eq!(ring.capacity(), 1);
        tokio_test::block_on(async {
            tokio_test::assert_ok!(ring.append("r", &msg(1)).await);
            tokio_test::assert_ok!(ring.append("r", &msg(2)).await);
            assert_eq!(ring.range("r").await.unwrap(), vec![msg(2)]);
        });
    }
}
