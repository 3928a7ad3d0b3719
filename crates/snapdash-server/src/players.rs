//! Player lifecycle: join, disconnect, reconnect, leave, kick, removal,
//! and host reassignment.
//!
//! Identity is the player ID, minted here on first join; the connection ID
//! is a transport artifact that reconnection simply rebinds. A dropped
//! connection starts a grace timer instead of removing the player, so a
//! flaky network never costs anyone their hand.

use std::sync::Arc;

use rand::RngExt;
use snapdash_core::protocol::{
    ErrorCode, Phase, PlayerId, PlayerStatus, ServerMessage, sanitize_player_name,
};
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::broadcast;
use crate::engine;
use crate::room::Room;
use crate::state::{ConnectionId, DisconnectedInfo, Player};

/// Mint an unguessable player ID. It doubles as the reconnect credential,
/// so 128 bits of entropy, hex-encoded.
fn mint_player_id() -> PlayerId {
    let bytes: [u8; 16] = rand::rng().random();
    PlayerId(bytes.iter().map(|b| format!("{b:02x}")).collect())
}

// ── Join ─────────────────────────────────────────────────────────────────

pub fn handle_join(
    room: &mut Room,
    room_arc: &Arc<Mutex<Room>>,
    connection: ConnectionId,
    raw_name: &str,
) {
    let now = Instant::now();

    // A join from an already-bound connection is a snapshot refresh, not a
    // second player.
    if let Some(player_id) = room.state.player_id_by_connection(connection) {
        broadcast::send_snapshot(&room.state, &room.senders, &player_id);
        return;
    }

    if room.state.is_room_full() {
        broadcast::send_error(
            &room.senders,
            connection,
            ErrorCode::RoomFull,
            "the room is full",
        );
        return;
    }
    match room.state.phase {
        Phase::Waiting => {}
        Phase::GameOver
            if !room.state.is_rejoin_window_active(now) || room.state.players.is_empty() =>
        {
            engine::full_reset_for_new_game(room);
        }
        _ => {
            broadcast::send_error(
                &room.senders,
                connection,
                ErrorCode::GameInProgress,
                "a game is already running",
            );
            return;
        }
    }

    let name = room.state.unique_name(sanitize_player_name(raw_name));
    let player_id = mint_player_id();
    let first = room.state.players.is_empty();
    room.state.players.insert(
        player_id.clone(),
        Player {
            id: player_id.clone(),
            connection_id: Some(connection),
            name: name.clone(),
            status: PlayerStatus::Connected,
            card_stack: Vec::new(),
            is_host: first,
            joined_at: now,
            last_seen: now,
        },
    );
    room.state.join_order.push(player_id.clone());
    room.state.connection_to_player.insert(connection, player_id.clone());
    if first {
        room.state.host_id = Some(player_id.clone());
        engine::arm_room_timeout(room, room_arc);
    }
    tracing::info!(room = %room.code, player = %player_id, name = %name, "Player joined");

    // Everyone already here learns about the newcomer; the newcomer gets a
    // full snapshot instead.
    if let Some(player) = room.state.players.get(&player_id) {
        let joined = broadcast::player_view(player, false);
        broadcast::broadcast_personalised_except(
            &room.state,
            &room.senders,
            &player_id,
            move |_, recipient| {
                let mut view = joined.clone();
                view.is_you = recipient.id == view.id;
                ServerMessage::PlayerJoined { player: view }
            },
        );
    }
    broadcast::send_snapshot(&room.state, &room.senders, &player_id);
    if first {
        broadcast::send_to_player(
            &room.state,
            &room.senders,
            &player_id,
            ServerMessage::YouAreHost {},
        );
    }
}

// ── Reconnect ────────────────────────────────────────────────────────────

pub fn handle_reconnect(room: &mut Room, connection: ConnectionId, player_id: PlayerId) {
    let now = Instant::now();
    if !room.state.players.contains_key(&player_id) {
        // Leave the connection open so the client can fall back to a
        // fresh join.
        broadcast::send_error(
            &room.senders,
            connection,
            ErrorCode::PlayerNotFound,
            "unknown player id",
        );
        return;
    }

    if room.state.disconnected_players.remove(&player_id).is_some() {
        room.timers.cancel_grace(&player_id);
        room.state.connection_to_player.insert(connection, player_id.clone());
        if let Some(player) = room.state.players.get_mut(&player_id) {
            player.connection_id = Some(connection);
            player.status = PlayerStatus::Connected;
            player.last_seen = now;
            player.is_host = room.state.host_id.as_ref() == Some(&player_id);
        }
        tracing::info!(room = %room.code, player = %player_id, "Player reconnected");
        broadcast::broadcast_to_all(
            &room.state,
            &room.senders,
            ServerMessage::PlayerReconnected {
                player_id: player_id.clone(),
            },
        );
        broadcast::send_snapshot(&room.state, &room.senders, &player_id);
        return;
    }

    // Still marked connected: a duplicated session. The newest connection
    // wins; nothing is broadcast.
    let old = room
        .state
        .players
        .get(&player_id)
        .and_then(|p| p.connection_id);
    if old == Some(connection) {
        broadcast::send_snapshot(&room.state, &room.senders, &player_id);
        return;
    }
    if let Some(old_connection) = old {
        room.state.connection_to_player.remove(&old_connection);
        broadcast::close_connection(&room.senders, old_connection);
    }
    room.state.connection_to_player.insert(connection, player_id.clone());
    if let Some(player) = room.state.players.get_mut(&player_id) {
        player.connection_id = Some(connection);
        player.last_seen = now;
    }
    tracing::info!(room = %room.code, player = %player_id, "Session rebound");
    broadcast::send_snapshot(&room.state, &room.senders, &player_id);
}

// ── Disconnect ───────────────────────────────────────────────────────────

/// The socket for `connection` is gone. Joined players go into the grace
/// flow; unjoined connections just vanish.
pub fn handle_socket_closed(
    room: &mut Room,
    room_arc: &Arc<Mutex<Room>>,
    connection: ConnectionId,
) {
    room.senders.remove(&connection);
    let Some(player_id) = room.state.connection_to_player.remove(&connection) else {
        return;
    };
    let now = Instant::now();
    let Some(player) = room.state.players.get_mut(&player_id) else {
        return;
    };
    player.connection_id = None;
    player.status = PlayerStatus::Disconnected;
    player.last_seen = now;
    room.state.disconnected_players.insert(
        player_id.clone(),
        DisconnectedInfo {
            disconnected_at: now,
        },
    );
    tracing::info!(room = %room.code, player = %player_id, "Player disconnected");
    broadcast::broadcast_to_all(
        &room.state,
        &room.senders,
        ServerMessage::PlayerDisconnected {
            player_id: player_id.clone(),
        },
    );
    arm_grace(room, room_arc, player_id);
}

/// Hosts and lobby idlers get a long leash; mid-game dropouts a short one.
fn arm_grace(room: &mut Room, room_arc: &Arc<Mutex<Room>>, player_id: PlayerId) {
    let grace = if room.state.host_id.as_ref() == Some(&player_id) {
        room.timings.host_reconnect_grace
    } else if room.state.phase == Phase::Waiting {
        room.timings.waiting_grace
    } else {
        room.timings.reconnect_grace
    };
    let handle = tokio::spawn({
        let room_arc = Arc::clone(room_arc);
        let player_id = player_id.clone();
        async move {
            tokio::time::sleep(grace).await;
            let mut room = room_arc.lock().await;
            grace_expired(&mut room, &room_arc, player_id);
        }
    });
    room.timers.set_grace(player_id, handle);
}

fn grace_expired(room: &mut Room, room_arc: &Arc<Mutex<Room>>, player_id: PlayerId) {
    // Reconnected in the meantime?
    if !room.state.disconnected_players.contains_key(&player_id) {
        return;
    }
    tracing::info!(room = %room.code, player = %player_id, "Grace period expired");
    remove_player(room, room_arc, &player_id);
}

// ── Leave / kick / removal ───────────────────────────────────────────────

pub fn handle_leave(room: &mut Room, room_arc: &Arc<Mutex<Room>>, connection: ConnectionId) {
    let Some(player_id) = room.state.player_id_by_connection(connection) else {
        return;
    };
    remove_player(room, room_arc, &player_id);
}

pub fn handle_kick(
    room: &mut Room,
    room_arc: &Arc<Mutex<Room>>,
    connection: ConnectionId,
    target: PlayerId,
) {
    let Some(requester) = room.state.player_id_by_connection(connection) else {
        broadcast::send_error(
            &room.senders,
            connection,
            ErrorCode::PlayerNotFound,
            "join the room first",
        );
        return;
    };
    if room.state.host_id.as_ref() != Some(&requester) {
        broadcast::send_error(
            &room.senders,
            connection,
            ErrorCode::NotHost,
            "only the host can kick players",
        );
        return;
    }
    if requester == target {
        broadcast::send_error(
            &room.senders,
            connection,
            ErrorCode::InvalidState,
            "cannot kick yourself",
        );
        return;
    }
    if !room.state.players.contains_key(&target) {
        broadcast::send_error(
            &room.senders,
            connection,
            ErrorCode::PlayerNotFound,
            "no such player",
        );
        return;
    }
    tracing::info!(room = %room.code, player = %target, by = %requester, "Player kicked");
    remove_player(room, room_arc, &target);
}

/// Delete the player from every structure, hand the host role on, and let
/// the engine react to the new headcount.
pub fn remove_player(room: &mut Room, room_arc: &Arc<Mutex<Room>>, player_id: &PlayerId) {
    room.timers.cancel_grace(player_id);
    let Some(player) = room.state.players.remove(player_id) else {
        return;
    };
    room.state.join_order.retain(|p| p != player_id);
    room.state.disconnected_players.remove(player_id);
    room.state.players_want_rematch.remove(player_id);
    room.state.penalties.remove(player_id);
    if let Some(connection) = player.connection_id {
        room.state.connection_to_player.remove(&connection);
        broadcast::close_connection(&room.senders, connection);
    }
    tracing::info!(room = %room.code, player = %player_id, "Player removed");
    broadcast::broadcast_to_all(
        &room.state,
        &room.senders,
        ServerMessage::PlayerLeft {
            player_id: player_id.clone(),
        },
    );

    if player.is_host {
        // Deterministic handover: first remaining player by join order.
        if let Some(new_host) = room.state.join_order.first().cloned() {
            if let Some(p) = room.state.players.get_mut(&new_host) {
                p.is_host = true;
            }
            room.state.host_id = Some(new_host.clone());
            tracing::info!(room = %room.code, host = %new_host, "Host reassigned");
            broadcast::send_to_player(
                &room.state,
                &room.senders,
                &new_host,
                ServerMessage::YouAreHost {},
            );
            broadcast::broadcast_to_all(
                &room.state,
                &room.senders,
                ServerMessage::HostChanged {
                    player_id: new_host,
                },
            );
        } else {
            room.state.host_id = None;
        }
    }

    engine::on_player_count_changed(room, room_arc);
}
