//! WebSocket connection handler
//!
//! Handles individual client connections: WebSocket upgrade with the
//! identity/target hook, the read pump (decode, validate, stamp, persist,
//! submit) and the write pump (drain outbound queue, heartbeat). Either
//! pump exiting guarantees hub unregistration and transport teardown.

use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{interval_at, timeout, Instant};
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::http::Uri;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, warn};

use crate::connection::Connection;
use crate::envelope::{typing_state, ClientFrame, Envelope, MAX_CONTENT_BYTES};
use crate::error::AppError;
use crate::hub::HubHandle;
use crate::store::{ChatStore, FileMeta, MessageKind, NewMessage};
use crate::types::{Identity, RoomId, UserId};

/// A connection that produces no frame within this window is dead
pub const READ_DEADLINE: Duration = Duration::from_secs(60);

/// Heartbeat interval: 9/10 of the read deadline, so the peer is pinged
/// before its own deadline expires
pub const HEARTBEAT_PERIOD: Duration = Duration::from_secs(54);

/// Initial subscription target carried by the upgrade request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscribeTarget {
    /// Subscribe to an existing room after a membership check
    Room(RoomId),
    /// Run the private-room rendezvous against a counterparty
    Peer {
        peer_id: UserId,
        peer_name: Option<String>,
    },
}

/// Handle a new TCP connection end to end
///
/// Performs the WebSocket upgrade, extracts the verified identity and
/// subscription target from the request, registers with the hub and runs
/// both pumps until the connection dies.
pub async fn handle_connection(
    stream: TcpStream,
    hub: HubHandle,
    store: Arc<dyn ChatStore>,
) -> Result<(), AppError> {
    let peer_addr = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "unknown".to_string());

    debug!("new TCP connection from {}", peer_addr);

    // Capture the request URI during the handshake; it carries the
    // already-verified identity and the subscription target.
    let mut uri = None;
    let mut ws_stream =
        tokio_tungstenite::accept_hdr_async(stream, |req: &Request, resp: Response| {
            uri = Some(req.uri().clone());
            Ok(resp)
        })
        .await?;

    let upgrade = uri
        .ok_or_else(|| AppError::BadRequest("upgrade request missing".to_string()))
        .and_then(|uri| parse_upgrade_request(&uri));
    let (identity, target) = match upgrade {
        Ok(parsed) => parsed,
        Err(e) => {
            let _ = ws_stream.close(None).await;
            return Err(e);
        }
    };

    // Membership check / rendezvous happens before any hub registration;
    // a rejection closes the transport without touching the registry.
    let room_id = match resolve_subscription(&identity, target, store.as_ref()).await {
        Ok(room_id) => room_id,
        Err(e) => {
            warn!("subscription rejected for {}: {}", identity.user_id, e);
            let _ = ws_stream.close(None).await;
            return Err(e);
        }
    };

    info!(
        "client {} ({}) connected from {}, room {}",
        identity.username, identity.user_id, peer_addr, room_id
    );

    let (ws_sender, ws_receiver) = ws_stream.split();
    let (connection, outbound_rx) = Connection::channel(&identity);

    hub.register(connection).await?;
    hub.subscribe(identity.user_id, room_id).await?;

    // Write path runs on its own task; the read path runs here so that
    // its exit (error, close frame, deadline) drives the teardown.
    let write_task = tokio::spawn(write_pump(ws_sender, outbound_rx));

    read_pump(ws_receiver, &identity, room_id, &hub, store.as_ref()).await;

    // Unconditionally unregister; the hub drops the outbound sender,
    // which ends the write pump with a close frame.
    let _ = hub.unregister(identity.user_id).await;
    let _ = write_task.await;

    info!("client {} disconnected", identity.user_id);

    Ok(())
}

/// Extract the verified identity and subscription target from the
/// upgrade URI.
///
/// Query parameters: `user` (UUID, required), `name` (display name),
/// and either `room` (UUID of an existing room) or `peer` (UUID of the
/// private-chat counterparty, with optional `peer_name`). This is the
/// seam where the external auth collaborator plugs in.
pub fn parse_upgrade_request(uri: &Uri) -> Result<(Identity, SubscribeTarget), AppError> {
    let query = uri
        .query()
        .ok_or_else(|| AppError::BadRequest("missing query string".to_string()))?;
    let params: std::collections::HashMap<&str, &str> = query
        .split('&')
        .filter_map(|kv| kv.split_once('='))
        .collect();

    let user_id = params
        .get("user")
        .ok_or_else(|| AppError::BadRequest("missing user".to_string()))
        .and_then(|raw| {
            UserId::parse(raw).map_err(|_| AppError::BadRequest("invalid user id".to_string()))
        })?;
    let username = params.get("name").copied().unwrap_or("Unknown");
    let identity = Identity::new(user_id, username);

    let target = if let Some(raw) = params.get("room") {
        let room_id = RoomId::parse(raw)
            .map_err(|_| AppError::BadRequest("invalid room id".to_string()))?;
        SubscribeTarget::Room(room_id)
    } else if let Some(raw) = params.get("peer") {
        let peer_id = UserId::parse(raw)
            .map_err(|_| AppError::BadRequest("invalid peer id".to_string()))?;
        SubscribeTarget::Peer {
            peer_id,
            peer_name: params.get("peer_name").map(|s| s.to_string()),
        }
    } else {
        return Err(AppError::BadRequest("missing room or peer".to_string()));
    };

    Ok((identity, target))
}

/// Turn the subscription target into a room the caller may subscribe to.
///
/// Existing rooms require a durable membership check; a peer target runs
/// the rendezvous protocol, whose result implies membership.
pub async fn resolve_subscription(
    identity: &Identity,
    target: SubscribeTarget,
    store: &dyn ChatStore,
) -> Result<RoomId, AppError> {
    match target {
        SubscribeTarget::Room(room_id) => {
            if store.is_member(room_id, identity.user_id).await? {
                Ok(room_id)
            } else {
                Err(AppError::NotAMember {
                    user: identity.user_id,
                    room: room_id,
                })
            }
        }
        SubscribeTarget::Peer { peer_id, peer_name } => {
            let room = store
                .find_or_create_private_room(identity.user_id, peer_id, peer_name.as_deref())
                .await?;
            Ok(room.id)
        }
    }
}

/// Read pump: inbound frames to hub commands.
///
/// Exits on transport error, close frame or deadline expiry; the caller
/// handles unregistration.
async fn read_pump(
    mut ws_receiver: SplitStream<WebSocketStream<TcpStream>>,
    identity: &Identity,
    room_id: RoomId,
    hub: &HubHandle,
    store: &dyn ChatStore,
) {
    loop {
        // Any received frame (including pongs) restarts the deadline.
        let frame = match timeout(READ_DEADLINE, ws_receiver.next()).await {
            Err(_) => {
                warn!("read deadline expired for {}", identity.user_id);
                break;
            }
            Ok(None) => break,
            Ok(Some(Err(e))) => {
                debug!("WebSocket error for {}: {}", identity.user_id, e);
                break;
            }
            Ok(Some(Ok(frame))) => frame,
        };

        match frame {
            Message::Text(text) => {
                if process_frame(&text, identity, room_id, hub, store)
                    .await
                    .is_err()
                {
                    debug!("hub closed, ending read pump for {}", identity.user_id);
                    break;
                }
            }
            Message::Close(_) => {
                debug!("client {} sent close frame", identity.user_id);
                break;
            }
            Message::Ping(_) | Message::Pong(_) => {
                // Pong replies are handled by tungstenite; receipt alone
                // already reset the deadline above.
            }
            _ => {
                // Binary or other frame types are ignored
            }
        }
    }
    debug!("read pump ended for {}", identity.user_id);
}

/// Process one inbound text frame.
///
/// Decode and validation failures keep the connection alive: the frame is
/// logged and discarded. Chat/file frames are persisted first and only
/// broadcast when persistence succeeds; the store's timestamp is the one
/// fanned out. Returns an error only when the hub itself is gone.
pub async fn process_frame(
    text: &str,
    identity: &Identity,
    room_id: RoomId,
    hub: &HubHandle,
    store: &dyn ChatStore,
) -> Result<(), AppError> {
    let frame = match serde_json::from_str::<ClientFrame>(text) {
        Ok(frame) => frame,
        Err(e) => {
            warn!("invalid frame from {}: {}", identity.user_id, e);
            return Ok(());
        }
    };

    match frame {
        ClientFrame::Message { content } => {
            if !validate_content(&content, identity) {
                return Ok(());
            }
            let stored = match store
                .persist_message(NewMessage {
                    room_id,
                    sender_id: identity.user_id,
                    kind: MessageKind::Text,
                    content: content.clone(),
                    file: None,
                })
                .await
            {
                Ok(stored) => stored,
                Err(e) => {
                    // Silent drop: the sender gets no error envelope.
                    error!("failed to persist message from {}: {}", identity.user_id, e);
                    return Ok(());
                }
            };
            hub.submit(Envelope::Message {
                room_id,
                sender_id: identity.user_id,
                username: identity.username.clone(),
                content,
                timestamp: stored.timestamp,
            })
            .await
        }
        ClientFrame::File {
            content,
            file_url,
            file_name,
            file_size,
        } => {
            if !validate_content(&content, identity) {
                return Ok(());
            }
            let stored = match store
                .persist_message(NewMessage {
                    room_id,
                    sender_id: identity.user_id,
                    kind: MessageKind::File,
                    content: content.clone(),
                    file: Some(FileMeta {
                        url: file_url.clone(),
                        name: file_name.clone(),
                        size: file_size,
                    }),
                })
                .await
            {
                Ok(stored) => stored,
                Err(e) => {
                    error!("failed to persist file message from {}: {}", identity.user_id, e);
                    return Ok(());
                }
            };
            hub.submit(Envelope::File {
                room_id,
                sender_id: identity.user_id,
                username: identity.username.clone(),
                content,
                file_url,
                file_name,
                file_size,
                timestamp: stored.timestamp,
            })
            .await
        }
        ClientFrame::Typing { content } => {
            hub.typing(room_id, identity, typing_state(&content)).await
        }
    }
}

/// Empty and oversized bodies are discarded without persistence
fn validate_content(content: &str, identity: &Identity) -> bool {
    if content.is_empty() {
        debug!("empty message from {} discarded", identity.user_id);
        return false;
    }
    if content.len() > MAX_CONTENT_BYTES {
        warn!(
            "oversized message from {} discarded ({} bytes)",
            identity.user_id,
            content.len()
        );
        return false;
    }
    true
}

/// Write pump: outbound queue to the transport, plus heartbeat pings.
///
/// Exits on any write error or when the hub closes the queue; queue
/// closure sends a close frame first.
async fn write_pump(
    mut ws_sender: SplitSink<WebSocketStream<TcpStream>, Message>,
    mut outbound_rx: mpsc::Receiver<String>,
) {
    let start = Instant::now() + HEARTBEAT_PERIOD;
    let mut heartbeat = interval_at(start, HEARTBEAT_PERIOD);

    loop {
        tokio::select! {
            maybe_frame = outbound_rx.recv() => match maybe_frame {
                Some(frame) => {
                    if ws_sender.send(Message::Text(frame.into())).await.is_err() {
                        debug!("WebSocket send failed, ending write pump");
                        break;
                    }
                }
                None => {
                    // Hub dropped the sender: orderly shutdown
                    let _ = ws_sender.close().await;
                    break;
                }
            },
            _ = heartbeat.tick() => {
                if ws_sender.send(Message::Ping(Vec::new())).await.is_err() {
                    debug!("heartbeat failed, ending write pump");
                    break;
                }
            }
        }
    }
    debug!("write pump ended");
}
