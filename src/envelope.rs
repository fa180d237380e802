//! Wire protocol definitions
//!
//! JSON-based bidirectional protocol using Serde's tagged enums
//! for type-safe serialization/deserialization.
//!
//! Outbound traffic is the [`Envelope`] sum type fanned out by the hub;
//! inbound traffic is the smaller [`ClientFrame`] set a client may send.
//! Identity and timestamp fields are always stamped server-side.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{RoomId, UserId};

/// Maximum accepted textual body, enforced at the application layer
/// on top of any transport-level frame-size cap.
pub const MAX_CONTENT_BYTES: usize = 10_000;

/// Hub → Client envelope
///
/// The unit of real-time data exchanged through the hub. Message and
/// File envelopes are persisted before fan-out; Typing, Join and Leave
/// are ephemeral.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Envelope {
    /// Persisted text message
    Message {
        room_id: RoomId,
        sender_id: UserId,
        username: String,
        content: String,
        timestamp: DateTime<Utc>,
    },
    /// Persisted file message (upload itself happens out of band)
    File {
        room_id: RoomId,
        sender_id: UserId,
        username: String,
        content: String,
        file_url: String,
        file_name: String,
        file_size: i64,
        timestamp: DateTime<Utc>,
    },
    /// Ephemeral typing indicator
    Typing {
        room_id: RoomId,
        sender_id: UserId,
        username: String,
        is_typing: bool,
    },
    /// Ephemeral room-join notification
    Join {
        room_id: RoomId,
        sender_id: UserId,
        username: String,
        content: String,
        timestamp: DateTime<Utc>,
    },
    /// Ephemeral room-leave notification
    Leave {
        room_id: RoomId,
        sender_id: UserId,
        username: String,
        content: String,
        timestamp: DateTime<Utc>,
    },
}

impl Envelope {
    /// Room this envelope targets
    pub fn room_id(&self) -> RoomId {
        match self {
            Envelope::Message { room_id, .. }
            | Envelope::File { room_id, .. }
            | Envelope::Typing { room_id, .. }
            | Envelope::Join { room_id, .. }
            | Envelope::Leave { room_id, .. } => *room_id,
        }
    }

    /// Originating user
    pub fn sender_id(&self) -> UserId {
        match self {
            Envelope::Message { sender_id, .. }
            | Envelope::File { sender_id, .. }
            | Envelope::Typing { sender_id, .. }
            | Envelope::Join { sender_id, .. }
            | Envelope::Leave { sender_id, .. } => *sender_id,
        }
    }

    /// Whether fan-out must skip the originating connection.
    ///
    /// Only typing indicators are hidden from their own sender.
    pub fn excludes_sender(&self) -> bool {
        matches!(self, Envelope::Typing { .. })
    }

    /// Build the join notification emitted when a connection subscribes
    pub fn join(room_id: RoomId, sender_id: UserId, username: &str) -> Self {
        Envelope::Join {
            room_id,
            sender_id,
            username: username.to_string(),
            content: format!("{} joined the room", username),
            timestamp: Utc::now(),
        }
    }

    /// Build the leave notification emitted when a connection vacates a room
    pub fn leave(room_id: RoomId, sender_id: UserId, username: &str) -> Self {
        Envelope::Leave {
            room_id,
            sender_id,
            username: username.to_string(),
            content: format!("{} left the room", username),
            timestamp: Utc::now(),
        }
    }
}

/// Client → Server frame
///
/// Clients may only originate messages, file notices and typing
/// indicators. Any `sender_id`/`username`/`timestamp`/`room_id` a client
/// includes is ignored; the server stamps those fields itself.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// Text message
    Message {
        #[serde(default)]
        content: String,
    },
    /// File message referencing an already-uploaded file
    File {
        #[serde(default)]
        content: String,
        #[serde(default)]
        file_url: String,
        #[serde(default)]
        file_name: String,
        #[serde(default)]
        file_size: i64,
    },
    /// Typing indicator; see [`typing_state`] for the content convention
    Typing {
        #[serde(default)]
        content: String,
    },
}

/// Map a typing frame's content to the indicator state.
///
/// "stop" means the user stopped typing; any other value, including an
/// empty string, means typing. Existing clients rely on this default.
pub fn typing_state(content: &str) -> bool {
    content != "stop"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_frame_deserialize_message() {
        let json = r#"{"type": "message", "content": "hi"}"#;
        let frame: ClientFrame = serde_json::from_str(json).unwrap();
        match frame {
            ClientFrame::Message { content } => assert_eq!(content, "hi"),
            _ => panic!("Wrong variant"),
        }
    }

    #[test]
    fn test_client_frame_ignores_spoofed_identity() {
        // sender_id/username/timestamp from the client are dropped on the floor
        let json = r#"{
            "type": "message",
            "content": "hi",
            "sender_id": "7c9e6679-7425-40de-944b-e07fc1f90ae7",
            "username": "mallory",
            "timestamp": "2020-01-01T00:00:00Z"
        }"#;
        let frame: ClientFrame = serde_json::from_str(json).unwrap();
        assert!(matches!(frame, ClientFrame::Message { .. }));
    }

    #[test]
    fn test_client_frame_file_defaults() {
        let json = r#"{"type": "file", "file_url": "/uploads/a.png", "file_name": "a.png"}"#;
        let frame: ClientFrame = serde_json::from_str(json).unwrap();
        match frame {
            ClientFrame::File {
                content,
                file_url,
                file_name,
                file_size,
            } => {
                assert_eq!(content, "");
                assert_eq!(file_url, "/uploads/a.png");
                assert_eq!(file_name, "a.png");
                assert_eq!(file_size, 0);
            }
            _ => panic!("Wrong variant"),
        }
    }

    #[test]
    fn test_client_frame_rejects_server_only_kinds() {
        assert!(serde_json::from_str::<ClientFrame>(r#"{"type": "join"}"#).is_err());
        assert!(serde_json::from_str::<ClientFrame>(r#"{"type": "leave"}"#).is_err());
    }

    #[test]
    fn test_envelope_serialize_tag() {
        let env = Envelope::Message {
            room_id: RoomId::new(),
            sender_id: UserId::new(),
            username: "alice".to_string(),
            content: "hi".to_string(),
            timestamp: Utc::now(),
        };
        let json = serde_json::to_string(&env).unwrap();
        assert!(json.contains("\"type\":\"message\""));
        assert!(json.contains("\"content\":\"hi\""));
        assert!(json.contains("\"timestamp\""));
    }

    #[test]
    fn test_typing_envelope_excludes_sender() {
        let typing = Envelope::Typing {
            room_id: RoomId::new(),
            sender_id: UserId::new(),
            username: "alice".to_string(),
            is_typing: true,
        };
        assert!(typing.excludes_sender());

        let join = Envelope::join(RoomId::new(), UserId::new(), "alice");
        assert!(!join.excludes_sender());
    }

    #[test]
    fn test_typing_state_stop_sentinel() {
        assert!(!typing_state("stop"));
        assert!(typing_state(""));
        assert!(typing_state("anything"));
        assert!(typing_state("Stop")); // sentinel is case-sensitive
    }
}
