//! WebSocket handler for the Axum Snapdash server.
//!
//! Each connection follows this lifecycle:
//!
//! 1. The upgrade carries `?room=CODE` (and optionally `reconnectId`).
//! 2. The connection registers an outbound channel with the room; a write
//!    task drains it into text frames and honours close requests.
//! 3. Inbound frames are parsed and dispatched under the room lock.
//! 4. On close a joined player enters the disconnect grace flow; unjoined
//!    connections just unregister.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use snapdash_core::protocol::{
    ClientMessage, ErrorCode, PlayerId, ServerMessage, validate_room_code,
};
use tokio::sync::Mutex;
use tokio::sync::mpsc;

use crate::room::{Outbound, OutboundRx, Room, RoomManager};
use crate::state::ConnectionId;
use crate::timers::unix_millis;
use crate::{broadcast, engine, players};

/// Drive a single WebSocket connection.
///
/// Called after the Axum upgrade; `socket` is the full-duplex WebSocket.
pub async fn handle_socket(
    socket: WebSocket,
    manager: Arc<RoomManager>,
    room_code: String,
    reconnect_id: Option<String>,
) {
    let (mut ws_sink, mut ws_stream) = socket.split();

    if let Err(reason) = validate_room_code(&room_code) {
        let err = ServerMessage::Error {
            code: ErrorCode::RoomNotFound,
            message: reason,
        };
        if let Ok(json) = serde_json::to_string(&err) {
            let _ = ws_sink.send(Message::Text(json.into())).await;
        }
        let _ = ws_sink.send(Message::Close(None)).await;
        return;
    }

    let connection = manager.next_connection_id();
    let (tx, rx) = mpsc::unbounded_channel();
    // Room creation and sender registration are one atomic step, so a
    // fresh room code never splits simultaneous joiners across two rooms.
    let room_arc = manager.attach_connection(&room_code, connection, tx).await;
    tracing::debug!(room = %room_code, connection, "Connection opened");

    let write_handle = tokio::spawn(write_loop(ws_sink, rx));

    // Reconnection via query parameter happens before any inbound frame.
    if let Some(id) = reconnect_id {
        let mut room = room_arc.lock().await;
        players::handle_reconnect(&mut room, connection, PlayerId(id));
    }

    // Read loop: deserialize, dispatch under the room lock.
    while let Some(frame) = ws_stream.next().await {
        match frame {
            Ok(Message::Text(text)) => dispatch(&room_arc, connection, &text).await,
            Ok(Message::Close(_)) | Err(_) => break,
            _ => {}
        }
    }

    // ── Cleanup ──────────────────────────────────────────────────────────
    {
        let mut room = room_arc.lock().await;
        players::handle_socket_closed(&mut room, &room_arc, connection);
    }
    write_handle.abort();
    manager.remove_if_dead(&room_code).await;
    tracing::debug!(room = %room_code, connection, "Connection closed");
}

/// Forward queued outbound items as WebSocket frames until the channel or
/// the socket goes away.
async fn write_loop(mut sink: SplitSink<WebSocket, Message>, mut rx: OutboundRx) {
    while let Some(outbound) = rx.recv().await {
        match outbound {
            Outbound::Message(msg) => {
                let Ok(json) = serde_json::to_string(&msg) else {
                    continue;
                };
                if sink.send(Message::Text(json.into())).await.is_err() {
                    break;
                }
            }
            Outbound::Close => {
                let _ = sink.send(Message::Close(None)).await;
                break;
            }
        }
    }
}

/// Parse one inbound frame and route it to the owning service.
async fn dispatch(room_arc: &Arc<Mutex<Room>>, connection: ConnectionId, text: &str) {
    let msg: ClientMessage = match serde_json::from_str(text) {
        Ok(m) => m,
        Err(e) => {
            // Malformed frames are logged and dropped; no error reply.
            tracing::debug!(connection, error = %e, "Unparseable message");
            return;
        }
    };

    let mut room = room_arc.lock().await;
    match msg {
        ClientMessage::Join { player_name } => {
            players::handle_join(&mut room, room_arc, connection, &player_name);
        }
        ClientMessage::Reconnect { player_id } => {
            players::handle_reconnect(&mut room, connection, player_id);
        }
        ClientMessage::SetConfig { config } => {
            engine::handle_set_config(&mut room, connection, config);
        }
        ClientMessage::StartGame { config } => {
            engine::handle_start_game(&mut room, room_arc, connection, config);
        }
        ClientMessage::MatchAttempt {
            symbol_id,
            client_timestamp,
        } => {
            engine::handle_match_attempt(&mut room, room_arc, connection, symbol_id, client_timestamp);
        }
        ClientMessage::Leave {} => {
            players::handle_leave(&mut room, room_arc, connection);
        }
        ClientMessage::KickPlayer { player_id } => {
            players::handle_kick(&mut room, room_arc, connection, player_id);
        }
        ClientMessage::Ping { timestamp } => {
            broadcast::send_to_connection(
                &room.senders,
                connection,
                ServerMessage::Pong {
                    server_timestamp: unix_millis(),
                    client_timestamp: timestamp,
                },
            );
        }
        ClientMessage::PlayAgain {} => {
            engine::handle_play_again(&mut room, room_arc, connection);
        }
    }
}
