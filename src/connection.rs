//! Connection handle definition
//!
//! The hub-side view of one live WebSocket connection: verified identity,
//! bounded outbound queue and the set of rooms it subscribes to.

use std::collections::HashSet;

use tokio::sync::mpsc;

use crate::types::{Identity, RoomId, UserId};

/// Capacity of each connection's outbound queue.
///
/// A subscriber that falls this many frames behind is treated as dead
/// and force-disconnected rather than blocking the hub.
pub const OUTBOUND_QUEUE_CAPACITY: usize = 256;

/// Result of a non-blocking enqueue onto a connection's outbound queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Frame accepted onto the queue
    Enqueued,
    /// Queue full or already closed; the subscriber is considered dead
    Dropped,
}

/// One live connection as the hub sees it
///
/// The read/write pumps own the transport and the queue's receiving half;
/// the hub owns this handle and only ever touches the connection through
/// its queue. Dropping the handle closes the queue, which ends the
/// write pump.
#[derive(Debug)]
pub struct Connection {
    /// Authenticated user behind this connection
    pub user_id: UserId,
    /// Display name stamped onto outbound envelopes
    pub username: String,
    /// Hub → write-pump queue (bounded)
    outbound: mpsc::Sender<String>,
    /// Rooms this connection currently subscribes to.
    /// Mutated only by the hub; kept symmetric with the hub's room map.
    pub(crate) rooms: HashSet<RoomId>,
}

impl Connection {
    /// Create a connection handle plus the receiver its write pump drains
    pub fn channel(identity: &Identity) -> (Self, mpsc::Receiver<String>) {
        Self::with_capacity(identity, OUTBOUND_QUEUE_CAPACITY)
    }

    /// Like [`Connection::channel`] with an explicit queue capacity
    pub fn with_capacity(identity: &Identity, capacity: usize) -> (Self, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(capacity);
        (
            Self {
                user_id: identity.user_id,
                username: identity.username.clone(),
                outbound: tx,
                rooms: HashSet::new(),
            },
            rx,
        )
    }

    /// Enqueue a serialized frame without blocking.
    ///
    /// Returns [`SendOutcome::Dropped`] when the queue is full (stalled
    /// consumer) or closed (pump already gone); never panics on either.
    pub fn send(&self, frame: String) -> SendOutcome {
        match self.outbound.try_send(frame) {
            Ok(()) => SendOutcome::Enqueued,
            Err(mpsc::error::TrySendError::Full(_))
            | Err(mpsc::error::TrySendError::Closed(_)) => SendOutcome::Dropped,
        }
    }

    /// Whether this connection currently subscribes to the room
    pub fn is_subscribed(&self, room_id: RoomId) -> bool {
        self.rooms.contains(&room_id)
    }
}
