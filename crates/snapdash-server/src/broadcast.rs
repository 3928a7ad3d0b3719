//! Outbound fan-out: unicast, broadcast, and personalised broadcast.
//!
//! Three modes, per message contract:
//! - unicast (`send_to_player` / `send_to_connection`),
//! - plain broadcast — identical bytes to every joined connection,
//! - personalised broadcast — a render closure produces each recipient's
//!   payload from their own [`Player`], all inside one locked section, so
//!   no other message interleaves the fan-out.
//!
//! Any message whose payload depends on the recipient (`isYou`,
//! `yourCard`, `penaltyRemainingMs`) must go through the personalised
//! path; the full hand of one player is never rendered for another.

use snapdash_core::protocol::{
    ErrorCode, LastGame, Phase, PlayerId, PlayerView, RoomSnapshot, ServerMessage,
};
use tokio::time::Instant;

use crate::room::{Outbound, Senders};
use crate::state::{ConnectionId, Player, RoomState};

pub fn send_to_connection(senders: &Senders, connection: ConnectionId, msg: ServerMessage) {
    if let Some(tx) = senders.get(&connection) {
        // Send failure just means the socket is mid-teardown.
        let _ = tx.send(Outbound::Message(msg));
    }
}

/// Ask the write task to close this connection.
pub fn close_connection(senders: &Senders, connection: ConnectionId) {
    if let Some(tx) = senders.get(&connection) {
        let _ = tx.send(Outbound::Close);
    }
}

/// Unicast an `error` frame to one connection.
pub fn send_error(senders: &Senders, connection: ConnectionId, code: ErrorCode, message: &str) {
    send_to_connection(
        senders,
        connection,
        ServerMessage::Error {
            code,
            message: message.to_string(),
        },
    );
}

pub fn send_to_player(
    state: &RoomState,
    senders: &Senders,
    player_id: &PlayerId,
    msg: ServerMessage,
) {
    if let Some(connection) = state.players.get(player_id).and_then(|p| p.connection_id) {
        send_to_connection(senders, connection, msg);
    }
}

/// Identical bytes to every joined connection.
pub fn broadcast_to_all(state: &RoomState, senders: &Senders, msg: ServerMessage) {
    for connection in state.connection_to_player.keys() {
        send_to_connection(senders, *connection, msg.clone());
    }
}

/// Render a per-recipient payload for every joined connection.
pub fn broadcast_personalised(
    state: &RoomState,
    senders: &Senders,
    render: impl Fn(&RoomState, &Player) -> ServerMessage,
) {
    broadcast_personalised_inner(state, senders, None, render);
}

/// Personalised broadcast that skips one player (e.g. a joiner who gets a
/// full snapshot instead).
pub fn broadcast_personalised_except(
    state: &RoomState,
    senders: &Senders,
    exclude: &PlayerId,
    render: impl Fn(&RoomState, &Player) -> ServerMessage,
) {
    broadcast_personalised_inner(state, senders, Some(exclude), render);
}

fn broadcast_personalised_inner(
    state: &RoomState,
    senders: &Senders,
    exclude: Option<&PlayerId>,
    render: impl Fn(&RoomState, &Player) -> ServerMessage,
) {
    for (connection, player_id) in &state.connection_to_player {
        if exclude == Some(player_id) {
            continue;
        }
        if let Some(recipient) = state.players.get(player_id) {
            send_to_connection(senders, *connection, render(state, recipient));
        }
    }
}

// ── Client-view projection ───────────────────────────────────────────────

pub fn player_view(player: &Player, is_you: bool) -> PlayerView {
    PlayerView {
        id: player.id.clone(),
        name: player.name.clone(),
        status: player.status,
        cards_remaining: player.card_stack.len(),
        is_host: player.is_host,
        is_you,
    }
}

/// Build the personalised `room_state` snapshot for one recipient.
pub fn snapshot_for(state: &RoomState, recipient: &PlayerId, now: Instant) -> ServerMessage {
    let players = state
        .join_order
        .iter()
        .filter_map(|id| state.players.get(id))
        .map(|p| player_view(p, &p.id == recipient))
        .collect();

    let your_cards_remaining = state
        .players
        .get(recipient)
        .map(|p| p.card_stack.len())
        .unwrap_or(0);

    let rejoin_window_remaining_ms = (state.phase == Phase::GameOver)
        .then(|| {
            state
                .rejoin_window_ends_at
                .map(|ends| ends.saturating_duration_since(now).as_millis() as u64)
        })
        .flatten();

    ServerMessage::RoomState(RoomSnapshot {
        phase: state.phase,
        players,
        host_id: state.host_id.clone(),
        config: state.config.clone(),
        round_number: state.round_number,
        center_card: state.center().cloned(),
        your_card: state.top_card_of(recipient).cloned(),
        your_cards_remaining,
        penalty_remaining_ms: state.penalty_remaining_ms(recipient, now),
        round_winner_id: state.round_winner_id.clone(),
        last_game: state.last_game.as_ref().map(|g| LastGame {
            reason: g.reason,
            winner_id: g.winner_id.clone(),
            winner_name: g.winner_name.clone(),
        }),
        rejoin_window_remaining_ms,
    })
}

/// Convenience: render and unicast a fresh snapshot to one player.
pub fn send_snapshot(state: &RoomState, senders: &Senders, recipient: &PlayerId) {
    send_to_player(
        state,
        senders,
        recipient,
        snapshot_for(state, recipient, Instant::now()),
    );
}

/// The per-player `round_start` payload, or `None` when the recipient has
/// no card to play (e.g. removed mid-transition).
pub fn round_start_for(state: &RoomState, recipient: &PlayerId) -> Option<ServerMessage> {
    let center_card = state.center()?.clone();
    let your_card = state.top_card_of(recipient)?.clone();
    let your_cards_remaining = state.players.get(recipient)?.card_stack.len();
    Some(ServerMessage::RoundStart {
        center_card,
        your_card,
        your_cards_remaining,
        all_players_remaining: state.all_players_remaining(),
        round_number: state.round_number,
    })
}
