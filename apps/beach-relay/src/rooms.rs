//! Rooms: ids created once in a TTL store and checked before a peer may join.

use std::{collections::HashMap, time::Duration};

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use thiserror::Error;
use tokio::{sync::Mutex, time::Instant};
use tracing::{debug, info};

const MAX_ROOM_ID_LEN: usize = 64;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("store error: {0}")]
    Store(String),
}

#[derive(Debug, Error)]
pub enum RoomError {
    #[error("room already exists")]
    AlreadyExists,
    #[error("room not found")]
    RoomNotFound,
    #[error("invalid room id: {0:?}")]
    InvalidRoomId(String),
    #[error("room store unavailable: {0}")]
    StoreUnavailable(#[from] StoreError),
}

/// Key/value store with per-key expiry, as needed by [`RoomGate`].
///
/// `set_if_absent` must be atomic: of two concurrent calls for the same key
/// exactly one may report `true`.
#[async_trait]
pub trait RoomStore: Send + Sync {
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration)
        -> Result<bool, StoreError>;

    async fn exists(&self, key: &str) -> Result<bool, StoreError>;

    /// Connectivity probe used at startup.
    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

/// The room operations the relay needs, independent of the backing store.
#[async_trait]
pub trait RoomRepository: Send + Sync {
    async fn create_room(&self, room_id: &str) -> Result<(), RoomError>;

    /// `false` both for rooms never created and for expired ones.
    async fn room_exists(&self, room_id: &str) -> Result<bool, RoomError>;

    /// Validates that `room_id` is live. No membership is recorded.
    async fn add_peer_to_room(&self, room_id: &str, peer_id: &str) -> Result<(), RoomError>;
}

pub struct RoomGate<S> {
    store: S,
    ttl: Duration,
}

impl<S: RoomStore> RoomGate<S> {
    pub fn new(store: S, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn store(&self) -> &S {
        &self.store
    }
}

#[async_trait]
impl<S: RoomStore> RoomRepository for RoomGate<S> {
    async fn create_room(&self, room_id: &str) -> Result<(), RoomError> {
        validate_room_id(room_id)?;
        let created_at = chrono::Utc::now().to_rfc3339();
        let created = self
            .store
            .set_if_absent(&room_key(room_id), &created_at, self.ttl)
            .await?;
        if !created {
            return Err(RoomError::AlreadyExists);
        }
        info!(room_id = %room_id, ttl_secs = self.ttl.as_secs(), "room created");
        Ok(())
    }

    async fn room_exists(&self, room_id: &str) -> Result<bool, RoomError> {
        validate_room_id(room_id)?;
        Ok(self.store.exists(&room_key(room_id)).await?)
    }

    async fn add_peer_to_room(&self, room_id: &str, peer_id: &str) -> Result<(), RoomError> {
        if !self.room_exists(room_id).await? {
            return Err(RoomError::RoomNotFound);
        }
        // TODO: enforce a per-room peer cap once membership is tracked.
        debug!(room_id = %room_id, %peer_id, "peer admitted to room");
        Ok(())
    }
}

pub fn validate_room_id(room_id: &str) -> Result<(), RoomError> {
    let valid = !room_id.is_empty()
        && room_id.len() <= MAX_ROOM_ID_LEN
        && room_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(RoomError::InvalidRoomId(room_id.to_string()))
    }
}

fn room_key(room_id: &str) -> String {
    format!("room:{}", room_id)
}

#[derive(Clone)]
pub struct RedisRoomStore {
    redis: ConnectionManager,
}

impl RedisRoomStore {
    pub async fn connect(redis_url: &str) -> Result<Self, StoreError> {
        let client = Client::open(redis_url)?;
        let redis = ConnectionManager::new(client).await?;
        Ok(Self { redis })
    }
}

#[async_trait]
impl RoomStore for RedisRoomStore {
    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let mut conn = self.redis.clone();
        // SET NX EX replies OK when written and nil when the key exists.
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        let mut conn = self.redis.clone();
        let exists: bool = conn.exists(key).await?;
        Ok(exists)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.redis.clone();
        let pong: String = redis::cmd("PING").query_async(&mut conn).await?;
        if pong != "PONG" {
            return Err(StoreError::Store(format!("unexpected ping reply: {pong}")));
        }
        Ok(())
    }
}

/// Process-local store for tests and single-node deployments without redis.
/// Expiry follows the Tokio clock, so paused-time tests can fast-forward it.
#[derive(Default)]
pub struct MemoryRoomStore {
    entries: Mutex<HashMap<String, MemoryEntry>>,
}

struct MemoryEntry {
    value: String,
    expires_at: Instant,
}

impl MemoryRoomStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stored value for an unexpired key.
    pub async fn value(&self, key: &str) -> Option<String> {
        let now = Instant::now();
        let entries = self.entries.lock().await;
        entries
            .get(key)
            .filter(|entry| entry.expires_at > now)
            .map(|entry| entry.value.clone())
    }
}

#[async_trait]
impl RoomStore for MemoryRoomStore {
    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        entries.retain(|_, entry| entry.expires_at > now);
        if entries.contains_key(key) {
            return Ok(false);
        }
        entries.insert(
            key.to_string(),
            MemoryEntry {
                value: value.to_string(),
                expires_at: now + ttl,
            },
        );
        Ok(true)
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        let now = Instant::now();
        let entries = self.entries.lock().await;
        Ok(entries
            .get(key)
            .map(|entry| entry.expires_at > now)
            .unwrap_or(false))
    }
}
