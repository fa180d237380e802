//! Error types for the chat hub
//!
//! Splits fatal connection errors from collaborator (store) errors.
//! Uses thiserror for ergonomic error definitions.

use thiserror::Error;

use crate::types::{RoomId, UserId};

/// Application-level errors
///
/// Everything here is fatal to the connection it occurs on:
/// the handler tears the transport down and unregisters.
#[derive(Debug, Error)]
pub enum AppError {
    /// WebSocket protocol error (fatal)
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// JSON serialization/deserialization error
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO error (fatal)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Hub intake channel closed (hub task gone)
    #[error("hub channel closed")]
    HubClosed,

    /// Upgrade request carried no usable identity or room target
    #[error("bad upgrade request: {0}")]
    BadRequest(String),

    /// Membership check failed for (user, room)
    #[error("user {user} is not a member of room {room}")]
    NotAMember { user: UserId, room: RoomId },

    /// Collaborator (persistence) failure
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Errors surfaced by the persistence collaborator
#[derive(Debug, Error)]
pub enum StoreError {
    /// Room does not exist
    #[error("room not found: {0}")]
    RoomNotFound(RoomId),

    /// Backend rejected or lost the operation
    #[error("storage backend error: {0}")]
    Backend(String),
}
