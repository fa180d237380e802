//! Real-time chat fan-out hub
//!
//! The core of a chat backend: a WebSocket connection layer feeding a
//! single hub actor that owns all live-connection state and fans messages
//! out to room subscribers. Built with tokio-tungstenite using the Actor
//! pattern for state management.
//!
//! # Features
//! - WebSocket connection handling with heartbeat and read deadline
//! - Room-scoped fan-out of persisted chat/file messages
//! - Ephemeral typing, join and leave notifications
//! - Backpressure disconnect of stalled subscribers
//! - Race-free find-or-create of private rooms (rendezvous protocol)
//! - Persistence, auth and membership behind collaborator seams
//!
//! # Architecture
//! Uses the Actor pattern with `mpsc` channels:
//! - `Hub` is the central actor and sole owner of the registry
//! - Each connection runs a read pump and a write pump
//! - No locks in the hot path - all registry access goes through
//!   message passing, so transitions are totally ordered
//!
//! # Example
//! ```ignore
//! use std::sync::Arc;
//! use tokio::net::TcpListener;
//! use chat_hub::{handle_connection, Hub, MemoryStore};
//!
//! #[tokio::main]
//! async fn main() {
//!     let listener = TcpListener::bind("127.0.0.1:8080").await.unwrap();
//!     let (hub, actor) = Hub::channel();
//!     tokio::spawn(actor.run());
//!     let store = Arc::new(MemoryStore::new());
//!
//!     while let Ok((stream, _)) = listener.accept().await {
//!         let hub = hub.clone();
//!         let store = store.clone();
//!         tokio::spawn(handle_connection(stream, hub, store));
//!     }
//! }
//! ```

pub mod config;
pub mod connection;
pub mod envelope;
pub mod error;
pub mod handler;
pub mod hub;
pub mod rendezvous;
pub mod store;
pub mod types;

// Re-export main types for convenience
pub use config::Config;
pub use connection::{Connection, SendOutcome};
pub use envelope::{ClientFrame, Envelope};
pub use error::{AppError, StoreError};
pub use handler::{handle_connection, SubscribeTarget};
pub use hub::{Hub, HubCommand, HubHandle};
pub use store::{ChatStore, MemoryStore, Room, RoomKind};
pub use types::{Identity, MessageId, RoomId, UserId};
