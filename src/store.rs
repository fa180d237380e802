//! Persistence collaborator seam
//!
//! The hub core treats persistence as an external collaborator behind the
//! [`ChatStore`] trait: persist a chat/file message, answer a durable
//! membership check, and run the private-room rendezvous. [`MemoryStore`]
//! is the in-process implementation backing the binary and the tests; a
//! SQL-backed implementation would slot in behind the same trait.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::StoreError;
use crate::rendezvous::PairLocks;
use crate::types::{MessageId, RoomId, UserId};

/// Room name used when the counterparty's display name is unavailable
const PRIVATE_ROOM_FALLBACK_NAME: &str = "Private Chat";

/// Durable room kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomKind {
    /// Unique 1:1 room between two users
    Private,
    /// Many-member room
    Group,
}

/// A durable room row
#[derive(Debug, Clone)]
pub struct Room {
    pub id: RoomId,
    pub name: String,
    pub kind: RoomKind,
    pub created_by: UserId,
    pub created_at: DateTime<Utc>,
}

/// Persisted message kind, mirroring the wire `type` tag
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Text,
    File,
}

/// File descriptor attached to a file message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileMeta {
    pub url: String,
    pub name: String,
    pub size: i64,
}

/// A message as handed to the store, before id/timestamp assignment
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub room_id: RoomId,
    pub sender_id: UserId,
    pub kind: MessageKind,
    pub content: String,
    pub file: Option<FileMeta>,
}

/// Outcome of persisting a message: the assigned id and server timestamp
#[derive(Debug, Clone, Copy)]
pub struct StoredMessage {
    pub id: MessageId,
    pub timestamp: DateTime<Utc>,
}

/// The collaborator interface the hub core consumes
#[async_trait]
pub trait ChatStore: Send + Sync {
    /// Persist a chat/file message and assign its server timestamp.
    ///
    /// Must succeed before the envelope is fanned out; on error the
    /// envelope is dropped.
    async fn persist_message(&self, message: NewMessage) -> Result<StoredMessage, StoreError>;

    /// Durable membership check for (room, user)
    async fn is_member(&self, room_id: RoomId, user_id: UserId) -> Result<bool, StoreError>;

    /// Find the unique private room between two users, creating it if
    /// absent. Safe under concurrent invocation for the same pair in
    /// either argument order: exactly one room results.
    async fn find_or_create_private_room(
        &self,
        user_id: UserId,
        peer_id: UserId,
        peer_name: Option<&str>,
    ) -> Result<Room, StoreError>;
}

/// A message row in the in-memory store
#[derive(Debug, Clone)]
pub struct MessageRecord {
    pub id: MessageId,
    pub sender_id: UserId,
    pub kind: MessageKind,
    pub content: String,
    pub file: Option<FileMeta>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug)]
struct RoomRecord {
    room: Room,
    members: HashSet<UserId>,
}

#[derive(Debug, Default)]
struct Inner {
    rooms: HashMap<RoomId, RoomRecord>,
    messages: HashMap<RoomId, Vec<MessageRecord>>,
}

/// In-process [`ChatStore`] implementation
///
/// One coarse mutex over the tables; it is never held across an await.
/// The rendezvous critical section is guarded by the per-pair lock
/// registry so unrelated room creations do not contend.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    pair_locks: PairLocks,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a room row (provisioning surface used by the binary and tests;
    /// the real system drives this from its REST layer)
    pub fn create_room(&self, name: &str, kind: RoomKind, created_by: UserId) -> Room {
        let room = Room {
            id: RoomId::new(),
            name: name.to_string(),
            kind,
            created_by,
            created_at: Utc::now(),
        };
        let mut inner = self.lock();
        inner.rooms.insert(
            room.id,
            RoomRecord {
                room: room.clone(),
                members: HashSet::from([created_by]),
            },
        );
        room
    }

    /// Add a durable member to a room
    pub fn add_member(&self, room_id: RoomId, user_id: UserId) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let record = inner
            .rooms
            .get_mut(&room_id)
            .ok_or(StoreError::RoomNotFound(room_id))?;
        record.members.insert(user_id);
        Ok(())
    }

    /// Number of messages persisted for a room
    pub fn message_count(&self, room_id: RoomId) -> usize {
        self.lock().messages.get(&room_id).map_or(0, Vec::len)
    }

    /// Snapshot of a room's persisted messages in storage order
    pub fn messages(&self, room_id: RoomId) -> Vec<MessageRecord> {
        self.lock().messages.get(&room_id).cloned().unwrap_or_default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("store mutex poisoned")
    }

    fn find_private_room(inner: &Inner, a: UserId, b: UserId) -> Option<Room> {
        inner
            .rooms
            .values()
            .find(|record| {
                record.room.kind == RoomKind::Private
                    && record.members.contains(&a)
                    && record.members.contains(&b)
            })
            .map(|record| record.room.clone())
    }
}

#[async_trait]
impl ChatStore for MemoryStore {
    async fn persist_message(&self, message: NewMessage) -> Result<StoredMessage, StoreError> {
        let mut inner = self.lock();
        if !inner.rooms.contains_key(&message.room_id) {
            return Err(StoreError::RoomNotFound(message.room_id));
        }

        // Timestamps are assigned here, at hand-off, and clamped so that
        // storage order per room is monotonically non-decreasing.
        let rows = inner.messages.entry(message.room_id).or_default();
        let mut timestamp = Utc::now();
        if let Some(last) = rows.last() {
            timestamp = timestamp.max(last.timestamp);
        }

        let stored = StoredMessage {
            id: MessageId::new(),
            timestamp,
        };
        rows.push(MessageRecord {
            id: stored.id,
            sender_id: message.sender_id,
            kind: message.kind,
            content: message.content,
            file: message.file,
            timestamp,
        });
        Ok(stored)
    }

    async fn is_member(&self, room_id: RoomId, user_id: UserId) -> Result<bool, StoreError> {
        let inner = self.lock();
        Ok(inner
            .rooms
            .get(&room_id)
            .is_some_and(|record| record.members.contains(&user_id)))
    }

    async fn find_or_create_private_room(
        &self,
        user_id: UserId,
        peer_id: UserId,
        peer_name: Option<&str>,
    ) -> Result<Room, StoreError> {
        // Serializes only requests for this exact pair; released on drop
        // at the end of the critical section.
        let _guard = self.pair_locks.acquire(user_id, peer_id).await;

        let mut inner = self.lock();

        // Double-check: a concurrent request for the same pair may have
        // created the room between the caller's first check and lock
        // acquisition.
        if let Some(room) = Self::find_private_room(&inner, user_id, peer_id) {
            return Ok(room);
        }

        let name = match peer_name {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => PRIVATE_ROOM_FALLBACK_NAME.to_string(),
        };
        let room = Room {
            id: RoomId::new(),
            name,
            kind: RoomKind::Private,
            created_by: user_id,
            created_at: Utc::now(),
        };
        inner.rooms.insert(
            room.id,
            RoomRecord {
                room: room.clone(),
                members: HashSet::from([user_id, peer_id]),
            },
        );
        Ok(room)
    }
}
