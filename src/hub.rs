//! Fan-out hub actor implementation
//!
//! The central actor that owns all live-connection state: the client
//! registry and the per-room subscriber sets. Uses the Actor pattern with
//! an mpsc command channel; the hub task is the sole mutator, so every
//! registry transition is totally ordered by command arrival and no locks
//! are needed.

use std::collections::{HashMap, HashSet};

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::connection::{Connection, SendOutcome};
use crate::envelope::Envelope;
use crate::error::AppError;
use crate::types::{Identity, RoomId, UserId};

/// Capacity of the hub's intake channel.
///
/// Bounded so a stalled hub applies backpressure to connection tasks
/// instead of buffering without limit.
pub const INTAKE_QUEUE_CAPACITY: usize = 256;

/// Commands sent from connection tasks to the Hub actor
#[derive(Debug)]
pub enum HubCommand {
    /// New connection established
    Register { connection: Connection },
    /// Connection gone (read pump exited, or forced)
    Unregister { user_id: UserId },
    /// Subscribe a live connection to a room.
    /// The caller must have passed the external membership check.
    Subscribe { user_id: UserId, room_id: RoomId },
    /// Fan an envelope out to its room's subscribers
    Broadcast { envelope: Envelope },
}

/// Cloneable submission side of the hub
///
/// All hub interaction goes through here; sends await on the bounded
/// intake channel and fail only when the hub task itself is gone.
#[derive(Debug, Clone)]
pub struct HubHandle {
    sender: mpsc::Sender<HubCommand>,
}

impl HubHandle {
    /// Add a connection to the live set
    pub async fn register(&self, connection: Connection) -> Result<(), AppError> {
        self.send(HubCommand::Register { connection }).await
    }

    /// Remove a connection and every subscription it holds
    pub async fn unregister(&self, user_id: UserId) -> Result<(), AppError> {
        self.send(HubCommand::Unregister { user_id }).await
    }

    /// Subscribe a registered connection to a room.
    ///
    /// Authorization is the caller's job: the hub trusts that the
    /// external membership check already succeeded for (user, room).
    pub async fn subscribe(&self, user_id: UserId, room_id: RoomId) -> Result<(), AppError> {
        self.send(HubCommand::Subscribe { user_id, room_id }).await
    }

    /// Submit an envelope for fan-out
    pub async fn submit(&self, envelope: Envelope) -> Result<(), AppError> {
        self.send(HubCommand::Broadcast { envelope }).await
    }

    /// Convenience path for typing indicators
    pub async fn typing(
        &self,
        room_id: RoomId,
        identity: &Identity,
        is_typing: bool,
    ) -> Result<(), AppError> {
        self.submit(Envelope::Typing {
            room_id,
            sender_id: identity.user_id,
            username: identity.username.clone(),
            is_typing,
        })
        .await
    }

    async fn send(&self, cmd: HubCommand) -> Result<(), AppError> {
        self.sender.send(cmd).await.map_err(|_| AppError::HubClosed)
    }
}

/// The fan-out hub actor
///
/// Owns the registry and processes commands from connection tasks.
/// HashMaps give O(1) lookups on clients and room subscriber sets.
pub struct Hub {
    /// All live connections: UserId -> Connection
    clients: HashMap<UserId, Connection>,
    /// Room subscriber sets: RoomId -> subscribed UserIds.
    /// In-memory only; distinct from durable room membership.
    rooms: HashMap<RoomId, HashSet<UserId>>,
    /// Command receiver channel
    receiver: mpsc::Receiver<HubCommand>,
}

impl Hub {
    /// Create a hub actor plus the handle used to drive it
    pub fn channel() -> (HubHandle, Self) {
        let (tx, rx) = mpsc::channel(INTAKE_QUEUE_CAPACITY);
        (HubHandle { sender: tx }, Self::new(rx))
    }

    /// Create a hub reading commands from the given receiver
    pub fn new(receiver: mpsc::Receiver<HubCommand>) -> Self {
        Self {
            clients: HashMap::new(),
            rooms: HashMap::new(),
            receiver,
        }
    }

    /// Run the hub event loop
    ///
    /// Continuously receives and processes commands until all handles
    /// are dropped.
    pub async fn run(mut self) {
        info!("hub started");

        while let Some(cmd) = self.receiver.recv().await {
            self.handle_command(cmd);
        }

        info!("hub shutting down");
    }

    /// Process a single command.
    ///
    /// Every handler is synchronous and non-blocking, so commands are
    /// applied strictly in arrival order.
    fn handle_command(&mut self, cmd: HubCommand) {
        match cmd {
            HubCommand::Register { connection } => self.handle_register(connection),
            HubCommand::Unregister { user_id } => self.handle_unregister(user_id),
            HubCommand::Subscribe { user_id, room_id } => self.handle_subscribe(user_id, room_id),
            HubCommand::Broadcast { envelope } => self.fan_out(&envelope),
        }
    }

    /// Handle connection registration.
    ///
    /// Idempotent per user id: a re-register replaces the stale handle
    /// (closing its queue) but carries the existing subscriptions over,
    /// so room sets stay symmetric and no duplicate join is emitted.
    fn handle_register(&mut self, mut connection: Connection) {
        if let Some(stale) = self.clients.remove(&connection.user_id) {
            debug!("replacing stale connection for {}", connection.user_id);
            connection.rooms = stale.rooms;
        }
        info!(
            "client registered: {} ({})",
            connection.username, connection.user_id
        );
        self.clients.insert(connection.user_id, connection);
        debug!(
            "total clients: {}, total rooms: {}",
            self.clients.len(),
            self.rooms.len()
        );
    }

    /// Handle connection teardown. Idempotent: unknown ids are ignored.
    fn handle_unregister(&mut self, user_id: UserId) {
        let Some(connection) = self.clients.remove(&user_id) else {
            return;
        };

        for room_id in &connection.rooms {
            self.vacate_room(*room_id, user_id, &connection.username);
        }

        // Dropping the handle here closes the outbound queue, exactly once.
        info!(
            "client unregistered: {} ({})",
            connection.username, user_id
        );
        debug!(
            "total clients: {}, total rooms: {}",
            self.clients.len(),
            self.rooms.len()
        );
    }

    /// Handle room subscription
    fn handle_subscribe(&mut self, user_id: UserId, room_id: RoomId) {
        let Some(connection) = self.clients.get_mut(&user_id) else {
            warn!("subscribe for unregistered client {}", user_id);
            return;
        };

        // Already subscribed: keep the operation idempotent, no second join
        if !connection.rooms.insert(room_id) {
            return;
        }

        let username = connection.username.clone();
        self.rooms.entry(room_id).or_default().insert(user_id);

        info!("client {} joined room {}", username, room_id);

        // Join notification goes to the whole room, joiner included
        self.fan_out(&Envelope::join(room_id, user_id, &username));
    }

    /// Fan an envelope out to its room's current subscribers.
    ///
    /// The envelope is serialized once; each subscriber gets a copy via a
    /// non-blocking enqueue. Typing indicators skip their originator.
    /// Subscribers whose queue is full are treated as dead and forcibly
    /// unregistered after the loop; everyone else still gets the frame.
    fn fan_out(&mut self, envelope: &Envelope) {
        let room_id = envelope.room_id();
        let Some(subscribers) = self.rooms.get(&room_id) else {
            return;
        };

        let frame = match serde_json::to_string(envelope) {
            Ok(frame) => frame,
            Err(e) => {
                error!("failed to serialize envelope: {}", e);
                return;
            }
        };

        let skip = envelope
            .excludes_sender()
            .then(|| envelope.sender_id());

        let mut dead = Vec::new();
        for &user_id in subscribers {
            if skip == Some(user_id) {
                continue;
            }
            let Some(connection) = self.clients.get(&user_id) else {
                continue;
            };
            if connection.send(frame.clone()) == SendOutcome::Dropped {
                dead.push(user_id);
            }
        }

        for user_id in dead {
            warn!("outbound queue saturated, force-disconnecting {}", user_id);
            self.handle_unregister(user_id);
        }
    }

    /// Remove a user from one room's subscriber set, pruning the entry
    /// when it empties and notifying the remaining subscribers otherwise.
    fn vacate_room(&mut self, room_id: RoomId, user_id: UserId, username: &str) {
        let Some(subscribers) = self.rooms.get_mut(&room_id) else {
            return;
        };
        subscribers.remove(&user_id);

        if subscribers.is_empty() {
            self.rooms.remove(&room_id);
            debug!("room {} pruned (no live subscribers)", room_id);
        } else {
            info!("client {} left room {}", username, room_id);
            self.fan_out(&Envelope::leave(room_id, user_id, username));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::Value;

    fn test_hub() -> (mpsc::Sender<HubCommand>, Hub) {
        let (tx, rx) = mpsc::channel(INTAKE_QUEUE_CAPACITY);
        (tx, Hub::new(rx))
    }

    fn register(hub: &mut Hub, name: &str) -> (Identity, mpsc::Receiver<String>) {
        register_with_capacity(hub, name, crate::connection::OUTBOUND_QUEUE_CAPACITY)
    }

    fn register_with_capacity(
        hub: &mut Hub,
        name: &str,
        capacity: usize,
    ) -> (Identity, mpsc::Receiver<String>) {
        let identity = Identity::new(UserId::new(), name);
        let (conn, rx) = Connection::with_capacity(&identity, capacity);
        hub.handle_command(HubCommand::Register { connection: conn });
        (identity, rx)
    }

    fn chat(room_id: RoomId, identity: &Identity, content: &str) -> Envelope {
        Envelope::Message {
            room_id,
            sender_id: identity.user_id,
            username: identity.username.clone(),
            content: content.to_string(),
            timestamp: Utc::now(),
        }
    }

    /// Drain every frame currently queued for a connection
    fn drain(rx: &mut mpsc::Receiver<String>) -> Vec<Value> {
        let mut frames = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            frames.push(serde_json::from_str(&frame).unwrap());
        }
        frames
    }

    /// The symmetry invariant: user in rooms[r] iff r in clients[user].rooms
    fn assert_symmetric(hub: &Hub) {
        for (room_id, subscribers) in &hub.rooms {
            assert!(!subscribers.is_empty(), "empty room entry not pruned");
            for user_id in subscribers {
                let conn = hub.clients.get(user_id).expect("subscriber not registered");
                assert!(conn.rooms.contains(room_id), "room set missing from client");
            }
        }
        for (user_id, conn) in &hub.clients {
            for room_id in &conn.rooms {
                assert!(
                    hub.rooms.get(room_id).is_some_and(|s| s.contains(user_id)),
                    "client room not reflected in subscriber set"
                );
            }
        }
    }

    #[tokio::test]
    async fn test_register_subscribe_unregister_symmetry() {
        let (_tx, mut hub) = test_hub();
        let room = RoomId::new();

        let (a, _rx_a) = register(&mut hub, "alice");
        let (b, _rx_b) = register(&mut hub, "bob");
        assert_symmetric(&hub);

        hub.handle_command(HubCommand::Subscribe { user_id: a.user_id, room_id: room });
        hub.handle_command(HubCommand::Subscribe { user_id: b.user_id, room_id: room });
        assert_symmetric(&hub);
        assert_eq!(hub.rooms[&room].len(), 2);

        hub.handle_command(HubCommand::Unregister { user_id: a.user_id });
        assert_symmetric(&hub);
        assert_eq!(hub.rooms[&room].len(), 1);

        hub.handle_command(HubCommand::Unregister { user_id: b.user_id });
        assert_symmetric(&hub);
        assert!(hub.rooms.is_empty());
        assert!(hub.clients.is_empty());
    }

    #[tokio::test]
    async fn test_unregister_prunes_and_resubscribe_recreates() {
        let (_tx, mut hub) = test_hub();
        let room = RoomId::new();

        let (a, _rx_a) = register(&mut hub, "alice");
        hub.handle_command(HubCommand::Subscribe { user_id: a.user_id, room_id: room });
        assert!(hub.rooms.contains_key(&room));

        hub.handle_command(HubCommand::Unregister { user_id: a.user_id });
        assert!(!hub.rooms.contains_key(&room));

        // Re-subscribing a fresh connection re-creates the entry from empty
        let (b, _rx_b) = register(&mut hub, "bob");
        hub.handle_command(HubCommand::Subscribe { user_id: b.user_id, room_id: room });
        assert_eq!(hub.rooms[&room].len(), 1);
        assert_symmetric(&hub);
    }

    #[tokio::test]
    async fn test_unregister_is_idempotent() {
        let (_tx, mut hub) = test_hub();
        let (a, _rx_a) = register(&mut hub, "alice");

        hub.handle_command(HubCommand::Unregister { user_id: a.user_id });
        // Second unregister must be a no-op, not a panic
        hub.handle_command(HubCommand::Unregister { user_id: a.user_id });
        assert!(hub.clients.is_empty());
    }

    #[tokio::test]
    async fn test_reregister_keeps_subscriptions_without_duplicate_join() {
        let (_tx, mut hub) = test_hub();
        let room = RoomId::new();

        let (a, _stale_rx) = register(&mut hub, "alice");
        hub.handle_command(HubCommand::Subscribe { user_id: a.user_id, room_id: room });

        // Same user reconnects with a fresh queue
        let (conn, mut rx) = Connection::channel(&a);
        hub.handle_command(HubCommand::Register { connection: conn });
        assert_symmetric(&hub);
        assert!(hub.clients[&a.user_id].is_subscribed(room));

        // Subscribing again is a no-op: no second join envelope
        hub.handle_command(HubCommand::Subscribe { user_id: a.user_id, room_id: room });
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_chat_reaches_room_subscribers_only() {
        let (_tx, mut hub) = test_hub();
        let room = RoomId::new();
        let other_room = RoomId::new();

        let (a, mut rx_a) = register(&mut hub, "alice");
        let (b, mut rx_b) = register(&mut hub, "bob");
        let (c, mut rx_c) = register(&mut hub, "carol");

        hub.handle_command(HubCommand::Subscribe { user_id: a.user_id, room_id: room });
        hub.handle_command(HubCommand::Subscribe { user_id: b.user_id, room_id: room });
        hub.handle_command(HubCommand::Subscribe { user_id: c.user_id, room_id: other_room });

        drain(&mut rx_a);
        drain(&mut rx_b);
        drain(&mut rx_c);

        hub.handle_command(HubCommand::Broadcast { envelope: chat(room, &a, "hi") });

        for rx in [&mut rx_a, &mut rx_b] {
            let frames = drain(rx);
            assert_eq!(frames.len(), 1);
            assert_eq!(frames[0]["type"], "message");
            assert_eq!(frames[0]["content"], "hi");
            assert_eq!(frames[0]["sender_id"], a.user_id.to_string());
            assert_eq!(frames[0]["username"], "alice");
        }

        // Subscriber of an unrelated room sees nothing
        assert!(drain(&mut rx_c).is_empty());
    }

    #[tokio::test]
    async fn test_typing_excludes_originator() {
        let (_tx, mut hub) = test_hub();
        let room = RoomId::new();

        let (a, mut rx_a) = register(&mut hub, "alice");
        let (b, mut rx_b) = register(&mut hub, "bob");
        let (c, mut rx_c) = register(&mut hub, "carol");
        for id in [a.user_id, b.user_id, c.user_id] {
            hub.handle_command(HubCommand::Subscribe { user_id: id, room_id: room });
        }
        drain(&mut rx_a);
        drain(&mut rx_b);
        drain(&mut rx_c);

        hub.handle_command(HubCommand::Broadcast {
            envelope: Envelope::Typing {
                room_id: room,
                sender_id: a.user_id,
                username: "alice".to_string(),
                is_typing: true,
            },
        });

        assert!(drain(&mut rx_a).is_empty(), "typer must not see own indicator");
        for rx in [&mut rx_b, &mut rx_c] {
            let frames = drain(rx);
            assert_eq!(frames.len(), 1);
            assert_eq!(frames[0]["type"], "typing");
            assert_eq!(frames[0]["is_typing"], true);
        }
    }

    #[tokio::test]
    async fn test_join_notification_includes_joiner() {
        let (_tx, mut hub) = test_hub();
        let room = RoomId::new();

        let (a, mut rx_a) = register(&mut hub, "alice");
        hub.handle_command(HubCommand::Subscribe { user_id: a.user_id, room_id: room });

        let frames = drain(&mut rx_a);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0]["type"], "join");
        assert_eq!(frames[0]["content"], "alice joined the room");
    }

    #[tokio::test]
    async fn test_leave_notification_on_unregister() {
        let (_tx, mut hub) = test_hub();
        let room = RoomId::new();

        let (a, _rx_a) = register(&mut hub, "alice");
        let (b, mut rx_b) = register(&mut hub, "bob");
        hub.handle_command(HubCommand::Subscribe { user_id: a.user_id, room_id: room });
        hub.handle_command(HubCommand::Subscribe { user_id: b.user_id, room_id: room });
        drain(&mut rx_b);

        hub.handle_command(HubCommand::Unregister { user_id: a.user_id });

        let frames = drain(&mut rx_b);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0]["type"], "leave");
        assert_eq!(frames[0]["content"], "alice left the room");
    }

    #[tokio::test]
    async fn test_saturated_subscriber_is_disconnected_others_delivered() {
        let (_tx, mut hub) = test_hub();
        let room = RoomId::new();

        let (a, mut rx_a) = register(&mut hub, "alice");
        let (c, mut rx_c) = register(&mut hub, "carol");
        // bob's queue holds a single frame: his own join notice fills it up
        let (b, _rx_b) = register_with_capacity(&mut hub, "bob", 1);
        for id in [a.user_id, c.user_id, b.user_id] {
            hub.handle_command(HubCommand::Subscribe { user_id: id, room_id: room });
        }
        drain(&mut rx_a);
        drain(&mut rx_c);

        hub.handle_command(HubCommand::Broadcast { envelope: chat(room, &a, "hi") });

        // bob is gone, everyone else got the message
        assert!(!hub.clients.contains_key(&b.user_id));
        assert_symmetric(&hub);

        let frames_a = drain(&mut rx_a);
        assert_eq!(frames_a[0]["content"], "hi");
        // carol sees the chat plus bob's forced leave
        let frames_c = drain(&mut rx_c);
        assert_eq!(frames_c[0]["content"], "hi");
        assert_eq!(frames_c[1]["type"], "leave");
        assert_eq!(frames_c[1]["username"], "bob");
    }

    #[tokio::test]
    async fn test_broadcast_to_unknown_room_is_noop() {
        let (_tx, mut hub) = test_hub();
        let (a, mut rx_a) = register(&mut hub, "alice");

        hub.handle_command(HubCommand::Broadcast { envelope: chat(RoomId::new(), &a, "hi") });
        assert!(drain(&mut rx_a).is_empty());
    }

    #[tokio::test]
    async fn test_end_to_end_chat_scenario_through_handle() {
        let (handle, hub) = Hub::channel();
        tokio::spawn(hub.run());

        let room = RoomId::new();
        let c1 = Identity::new(UserId::new(), "alice");
        let c2 = Identity::new(UserId::new(), "bob");
        let (conn1, mut rx1) = Connection::channel(&c1);
        let (conn2, mut rx2) = Connection::channel(&c2);

        let submitted_at = Utc::now();

        handle.register(conn1).await.unwrap();
        handle.subscribe(c1.user_id, room).await.unwrap();
        handle.register(conn2).await.unwrap();
        handle.subscribe(c2.user_id, room).await.unwrap();

        handle
            .submit(Envelope::Message {
                room_id: room,
                sender_id: c1.user_id,
                username: c1.username.clone(),
                content: "hi".to_string(),
                timestamp: Utc::now(),
            })
            .await
            .unwrap();

        // c1 sees own join, c2's join, then the message
        let mut last = Value::Null;
        for _ in 0..3 {
            last = serde_json::from_str(&rx1.recv().await.unwrap()).unwrap();
        }
        assert_eq!(last["type"], "message");
        assert_eq!(last["sender_id"], c1.user_id.to_string());
        assert_eq!(last["content"], "hi");
        let ts: chrono::DateTime<Utc> =
            last["timestamp"].as_str().unwrap().parse().unwrap();
        assert!(ts >= submitted_at);

        // c2 sees own join then the message, never c1's earlier join
        let first: Value = serde_json::from_str(&rx2.recv().await.unwrap()).unwrap();
        assert_eq!(first["type"], "join");
        assert_eq!(first["username"], "bob");
        let second: Value = serde_json::from_str(&rx2.recv().await.unwrap()).unwrap();
        assert_eq!(second["type"], "message");

        handle.unregister(c1.user_id).await.unwrap();
        handle.unregister(c2.user_id).await.unwrap();
    }

    #[tokio::test]
    async fn test_typing_convenience_through_handle() {
        let (handle, hub) = Hub::channel();
        tokio::spawn(hub.run());

        let room = RoomId::new();
        let a = Identity::new(UserId::new(), "alice");
        let b = Identity::new(UserId::new(), "bob");
        let (conn_a, _rx_a) = Connection::channel(&a);
        let (conn_b, mut rx_b) = Connection::channel(&b);

        handle.register(conn_a).await.unwrap();
        handle.register(conn_b).await.unwrap();
        handle.subscribe(a.user_id, room).await.unwrap();
        handle.subscribe(b.user_id, room).await.unwrap();

        // skip bob's own join notice
        rx_b.recv().await.unwrap();

        handle.typing(room, &a, false).await.unwrap();
        let frame: Value = serde_json::from_str(&rx_b.recv().await.unwrap()).unwrap();
        assert_eq!(frame["type"], "typing");
        assert_eq!(frame["is_typing"], false);
        assert_eq!(frame["sender_id"], a.user_id.to_string());
    }
}
