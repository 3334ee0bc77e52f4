//! Redis-backed history: one list per room under `chat:{room}`, trimmed to
//! the most recent `capacity` entries on every push.

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Client};

use super::ChatMessage;
use super::history::{HistoryError, HistoryStore};

fn backend(context: &str, e: impl std::fmt::Display) -> HistoryError {
    HistoryError::Backend(format!("{context}: {e}"))
}

fn key(room: &str) -> String {
    format!("chat:{room}")
}

pub struct RedisHistory {
    connection: MultiplexedConnection,
    capacity: usize,
}

impl std::fmt::Debug for RedisHistory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisHistory")
            .field("capacity", &self.capacity)
            .finish_non_exhaustive()
    }
}

impl RedisHistory {
    pub async fn connect(redis_url: &str, capacity: usize) -> Result<Self, HistoryError> {
        let client = Client::open(redis_url).map_err(|e| backend("invalid redis url", e))?;
        let connection = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| backend("failed to connect to redis", e))?;
        Ok(Self {
            connection,
            capacity: capacity.max(1),
        })
    }
}

#[async_trait]
impl HistoryStore for RedisHistory {
    async fn append(&self, room: &str, message: &ChatMessage) -> Result<(), HistoryError> {
        let json = serde_json::to_string(message).map_err(|e| backend("encode", e))?;
        let key = key(room);
        let mut conn = self.connection.clone();
        let _: () = redis::pipe()
            .atomic()
            .rpush(&key, json)
            .ignore()
            .ltrim(&key, -(self.capacity as isize), -1)
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(|e| backend("RPUSH", e))?;
        Ok(())
    }

    async fn range(&self, room: &str) -> Result<Vec<ChatMessage>, HistoryError> {
        let mut conn = self.connection.clone();
        let raw: Vec<String> = conn
            .lrange(key(room), 0, -1)
            .await
            .map_err(|e| backend("LRANGE", e))?;
        raw.iter()
            .map(|s| serde_json::from_str(s).map_err(|e| backend("decode", e)))
            .collect()
    }
}
